//! Host-side representation of guest values
//!
//! The closed set of host types that can cross into a slot. Primitives are
//! copied; everything else travels as a handle that keeps the guest object alive.

use crate::error::{Error, Result};
use crate::handle::{AsHandle, ForeignHandle, Handle, ListHandle, MapHandle};
use std::any::Any;
use std::fmt;

/// A value read from or written to a guest slot.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    /// Every host number is stored as the guest's single `f64` representation
    Num(f64),
    String(String),
    /// Guest strings that are not valid UTF-8
    Bytes(Vec<u8>),
    Handle(Handle),
    List(ListHandle),
    Map(MapHandle),
    Foreign(ForeignHandle),
}

impl Value {
    /// Convert a dynamically typed host value.
    ///
    /// Accepts the primitive Rust types, strings, byte vectors, handles and
    /// `Value` itself. Anything else is an [`Error::UnsupportedValue`].
    pub fn from_any<T: Any>(value: &T) -> Result<Value> {
        let any = value as &dyn Any;
        macro_rules! numbers {
            ($($ty:ty),*) => {
                $(if let Some(n) = any.downcast_ref::<$ty>() {
                    return Ok(Value::Num(*n as f64));
                })*
            };
        }
        numbers!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

        if let Some(v) = any.downcast_ref::<Value>() {
            return Ok(v.clone());
        }
        if let Some(b) = any.downcast_ref::<bool>() {
            return Ok(Value::Bool(*b));
        }
        if any.downcast_ref::<()>().is_some() {
            return Ok(Value::Null);
        }
        if let Some(s) = any.downcast_ref::<String>() {
            return Ok(Value::String(s.clone()));
        }
        if let Some(s) = any.downcast_ref::<&'static str>() {
            return Ok(Value::String((*s).to_string()));
        }
        if let Some(bytes) = any.downcast_ref::<Vec<u8>>() {
            return Ok(Value::Bytes(bytes.clone()));
        }
        if let Some(h) = any.downcast_ref::<Handle>() {
            return Ok(Value::Handle(h.clone()));
        }
        if let Some(h) = any.downcast_ref::<ListHandle>() {
            return Ok(Value::List(h.clone()));
        }
        if let Some(h) = any.downcast_ref::<MapHandle>() {
            return Ok(Value::Map(h.clone()));
        }
        if let Some(h) = any.downcast_ref::<ForeignHandle>() {
            return Ok(Value::Foreign(h.clone()));
        }
        Err(Error::unsupported::<T>())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of either string variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The underlying handle of any handle variant.
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::Handle(h) => Some(h),
            Value::List(h) => Some(h.handle()),
            Value::Map(h) => Some(h.handle()),
            Value::Foreign(h) => Some(h.handle()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListHandle> {
        match self {
            Value::List(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapHandle> {
        match self {
            Value::Map(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_foreign(&self) -> Option<&ForeignHandle> {
        match self {
            Value::Foreign(h) => Some(h),
            _ => None,
        }
    }

    /// Map keys are restricted to value types.
    pub fn is_map_key(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Num(_) | Value::String(_) | Value::Bytes(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Num(_) => "num",
            Value::String(_) | Value::Bytes(_) => "string",
            Value::Handle(_) => "handle",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Foreign(_) => "foreign",
        }
    }
}

/// Strings compare by content across both string variants; handles compare
/// by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (a, b) if a.as_bytes().is_some() && b.as_bytes().is_some() => {
                a.as_bytes() == b.as_bytes()
            }
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.handle() == b.handle(),
            (Value::Map(a), Value::Map(b)) => a.handle() == b.handle(),
            (Value::Foreign(a), Value::Foreign(b)) => a.handle() == b.handle(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

macro_rules! from_number {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Value::Num(n as f64)
            }
        })*
    };
}

from_number!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::Handle(h)
    }
}

impl From<ListHandle> for Value {
    fn from(h: ListHandle) -> Self {
        Value::List(h)
    }
}

impl From<MapHandle> for Value {
    fn from(h: MapHandle) -> Self {
        Value::Map(h)
    }
}

impl From<ForeignHandle> for Value {
    fn from(h: ForeignHandle) -> Self {
        Value::Foreign(h)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbers_widen_to_f64() {
        assert_eq!(Value::from(-3i8), Value::Num(-3.0));
        assert_eq!(Value::from(u32::MAX), Value::Num(4294967295.0));
        assert_eq!(Value::from(1u64 << 53), Value::Num(9007199254740992.0));
        assert_eq!(Value::from(0.5f32), Value::Num(0.5));
        assert_eq!(Value::from(-5i128), Value::Num(-5.0));
        assert_eq!(Value::from(1u128 << 64), Value::Num(18446744073709551616.0));
    }

    #[test]
    fn test_from_any_wide_integers() {
        assert_eq!(Value::from_any(&5i128).unwrap(), Value::Num(5.0));
        assert_eq!(Value::from_any(&7u128).unwrap(), Value::Num(7.0));
    }

    #[test]
    fn test_from_any_closed_set() {
        assert_eq!(Value::from_any(&7u16).unwrap(), Value::Num(7.0));
        assert_eq!(Value::from_any(&true).unwrap(), Value::Bool(true));
        assert_eq!(Value::from_any(&"hi").unwrap(), Value::from("hi"));
        assert_eq!(Value::from_any(&()).unwrap(), Value::Null);
        assert!(matches!(
            Value::from_any(&vec![1u32]),
            Err(Error::UnsupportedValue { .. })
        ));
    }

    #[test]
    fn test_string_variants_compare_by_content() {
        assert_eq!(Value::from("a\0b"), Value::Bytes(b"a\0b".to_vec()));
        assert_ne!(Value::from("a"), Value::Num(1.0));
    }

    #[test]
    fn test_map_keys_and_option() {
        assert!(Value::from(1).is_map_key());
        assert!(Value::Null.is_map_key());
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("x")).as_str(), Some("x"));
    }
}
