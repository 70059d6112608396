//! Method signature strings
//!
//! A signature names a method and encodes its arity with `_` placeholders:
//!
//! | Form | Example | Arity |
//! |------|---------|-------|
//! | method | `increment(_)`, `create()` | placeholders |
//! | getter | `count`, `-` | 0 |
//! | setter | `name=(_)` | 1 |
//! | subscript | `[_,_]` | placeholders |
//! | subscript setter | `[_]=(_)` | placeholders + 1 |
//! | operator | `+(_)` | placeholders |
//!
//! Binding-table keys for static methods carry a `static ` prefix.

use crate::error::{Error, Result};
use std::fmt;

pub const STATIC_PREFIX: &str = "static ";

const OPERATORS: &[&str] = &[
    "+", "-", "*", "/", "%", "<", ">", "<=", ">=", "==", "!=", "&", "|", "^", "<<", ">>", "..",
    "...", "!", "~", "is",
];

/// Shape of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Method,
    Getter,
    Setter,
    Subscript,
    SubscriptSetter,
}

/// A parsed and validated signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub is_static: bool,
    pub name: String,
    pub kind: SignatureKind,
    pub arity: usize,
}

impl Signature {
    /// Parse a signature, with or without the `static ` prefix.
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSignature {
            signature: text.to_string(),
            reason: reason.to_string(),
        };

        let (is_static, body) = match text.strip_prefix(STATIC_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if body.is_empty() {
            return Err(invalid("empty signature"));
        }

        if let Some(rest) = body.strip_prefix('[') {
            let close = rest.find(']').ok_or_else(|| invalid("unterminated subscript"))?;
            let arity = placeholders(&rest[..close])
                .ok_or_else(|| invalid("malformed subscript parameters"))?;
            if arity == 0 {
                return Err(invalid("subscript needs at least one parameter"));
            }
            return match &rest[close + 1..] {
                "" => Ok(Self::new(is_static, "[]", SignatureKind::Subscript, arity)),
                "=(_)" => Ok(Self::new(is_static, "[]", SignatureKind::SubscriptSetter, arity + 1)),
                _ => Err(invalid("unexpected text after subscript")),
            };
        }

        let (name, params) = match body.find('(') {
            Some(open) => (&body[..open], Some(&body[open..])),
            None => (body, None),
        };
        let (name, setter) = match name.strip_suffix('=') {
            Some(stripped) if is_identifier(stripped) => (stripped, true),
            _ => (name, false),
        };
        if !is_identifier(name) && !OPERATORS.contains(&name) {
            return Err(invalid("name is neither an identifier nor an operator"));
        }

        let Some(params) = params else {
            if setter {
                return Err(invalid("setter needs one parameter"));
            }
            return Ok(Self::new(is_static, name, SignatureKind::Getter, 0));
        };
        let inner = params
            .strip_prefix('(')
            .and_then(|p| p.strip_suffix(')'))
            .ok_or_else(|| invalid("unbalanced parentheses"))?;
        let arity =
            placeholders(inner).ok_or_else(|| invalid("parameters must be '_' separated by ','"))?;
        if setter {
            return match arity {
                1 => Ok(Self::new(is_static, name, SignatureKind::Setter, 1)),
                _ => Err(invalid("setter needs one parameter")),
            };
        }
        Ok(Self::new(is_static, name, SignatureKind::Method, arity))
    }

    fn new(is_static: bool, name: &str, kind: SignatureKind, arity: usize) -> Self {
        Self {
            is_static,
            name: name.to_string(),
            kind,
            arity,
        }
    }

    /// The signature as the guest spells it, without the static prefix.
    pub fn call_form(&self) -> String {
        let params = |n: usize| vec!["_"; n].join(",");
        match self.kind {
            SignatureKind::Method => format!("{}({})", self.name, params(self.arity)),
            SignatureKind::Getter => self.name.clone(),
            SignatureKind::Setter => format!("{}=(_)", self.name),
            SignatureKind::Subscript => format!("[{}]", params(self.arity)),
            SignatureKind::SubscriptSetter => format!("[{}]=(_)", params(self.arity - 1)),
        }
    }

    /// Key under which the method is stored in a [`crate::MethodMap`].
    pub fn key(&self) -> String {
        binding_key(self.is_static, &self.call_form())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Method-map key for a signature reported by the VM.
pub fn binding_key(is_static: bool, signature: &str) -> String {
    if is_static {
        format!("{STATIC_PREFIX}{signature}")
    } else {
        signature.to_string()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Number of `_` placeholders in a comma-separated list, or None if malformed.
fn placeholders(list: &str) -> Option<usize> {
    if list.is_empty() {
        return Some(0);
    }
    list.split(',').try_fold(0, |n, part| (part == "_").then_some(n + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_methods_and_getters() {
        let sig = Signature::parse("increment(_)").unwrap();
        assert_eq!(sig.kind, SignatureKind::Method);
        assert_eq!(sig.arity, 1);
        assert!(!sig.is_static);

        let sig = Signature::parse("static create(_,_)").unwrap();
        assert!(sig.is_static);
        assert_eq!(sig.arity, 2);
        assert_eq!(sig.key(), "static create(_,_)");

        let sig = Signature::parse("count").unwrap();
        assert_eq!(sig.kind, SignatureKind::Getter);
        assert_eq!(sig.arity, 0);
    }

    #[test]
    fn test_parse_setters_subscripts_and_operators() {
        assert_eq!(Signature::parse("name=(_)").unwrap().kind, SignatureKind::Setter);
        assert_eq!(Signature::parse("[_,_]").unwrap().arity, 2);

        let sig = Signature::parse("[_]=(_)").unwrap();
        assert_eq!(sig.kind, SignatureKind::SubscriptSetter);
        assert_eq!(sig.arity, 2);
        assert_eq!(sig.call_form(), "[_]=(_)");

        assert_eq!(Signature::parse("+(_)").unwrap().arity, 1);
        assert_eq!(Signature::parse("-").unwrap().kind, SignatureKind::Getter);
    }

    #[test]
    fn test_rejects_malformed_signatures() {
        let malformed = [
            "", "static ", "foo(", "foo(x)", "foo(_,)", "1abc()", "[]", "[_", "name=(_,_)", "a b()",
        ];
        for bad in malformed {
            assert!(
                matches!(Signature::parse(bad), Err(Error::InvalidSignature { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_binding_key() {
        assert_eq!(binding_key(true, "new()"), "static new()");
        assert_eq!(binding_key(false, "new()"), "new()");
    }
}
