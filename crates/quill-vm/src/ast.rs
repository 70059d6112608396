//! Abstract syntax tree for Quill.
//!
//! Almost every operator is desugared to a method [`ExprKind::Call`] with a
//! signature string (`+(_)`, `[_]=(_)`, `name=(_)`, ...), which is how the
//! interpreter dispatches everything that is not control flow.

use crate::c_api::QuillForeignMethodFn;
use std::cell::Cell;
use std::rc::Rc;

pub type Block = Vec<Stmt>;

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: u32,
}

#[derive(Debug)]
pub enum StmtKind {
    Expr(Expr),
    Var {
        name: String,
        init: Option<Expr>,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        var: String,
        seq: Expr,
        body: Box<Stmt>,
    },
    Block(Block),
    Return(Option<Expr>),
    Break,
    Continue,
    Class(Rc<ClassDecl>),
    Import {
        module: String,
        names: Vec<ImportName>,
    },
}

#[derive(Debug, Clone)]
pub struct ImportName {
    pub name: String,
    pub alias: Option<String>,
}

impl ImportName {
    /// The name the variable is bound to in the importing module.
    pub fn local(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<String>,
    pub is_foreign: bool,
    pub methods: Vec<Rc<MethodDecl>>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Constructor,
    Instance,
    Static,
}

#[derive(Debug)]
pub struct MethodDecl {
    pub kind: MethodKind,
    /// Full signature, e.g. `increment(_)`, `name=(_)`, `[_]`.
    pub signature: String,
    pub params: Vec<String>,
    /// `None` for foreign methods.
    pub body: Option<Body>,
    pub is_foreign: bool,
    /// Filled in by the binder before the module runs.
    pub bound: Cell<Option<QuillForeignMethodFn>>,
    pub line: u32,
}

/// A function or method body.
#[derive(Debug)]
pub struct Body {
    pub stmts: Block,
    /// Single-line `{ expr }` bodies evaluate to their expression.
    pub is_expression: bool,
}

/// A block argument such as `Fn.new { |a, b| a + b }`.
#[derive(Debug)]
pub struct FnDecl {
    pub params: Vec<String>,
    pub body: Body,
    pub line: u32,
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: u32,
}

#[derive(Debug)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Num(f64),
    Str(Rc<[u8]>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    /// A bare identifier: a local, an implicit `this` getter or a module variable.
    Name(String),
    Field(String),
    StaticField(String),
    This,
    /// `receiver: None` is an implicit call on `this`.
    Call {
        receiver: Option<Box<Expr>>,
        signature: String,
        args: Vec<Expr>,
    },
    SuperCall {
        signature: String,
        args: Vec<Expr>,
    },
    Fn(Rc<FnDecl>),
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional {
        cond: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    Is(Box<Expr>, Box<Expr>),
}

/// Number of arguments a signature takes, counted from its placeholders.
pub fn signature_arity(signature: &str) -> usize {
    signature
        .find(['(', '['])
        .map(|i| signature[i..].matches('_').count())
        .unwrap_or(0)
}

/// Builds `name(_,_)` style signatures.
pub fn call_signature(name: &str, arity: usize) -> String {
    format!("{}({})", name, vec!["_"; arity].join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_arity() {
        assert_eq!(signature_arity("count"), 0);
        assert_eq!(signature_arity("do_it(_,_)"), 2);
        assert_eq!(signature_arity("[_]=(_)"), 2);
        assert_eq!(signature_arity("+(_)"), 1);
        assert_eq!(signature_arity("-"), 0);
    }

    #[test]
    fn test_call_signature() {
        assert_eq!(call_signature("new", 0), "new()");
        assert_eq!(call_signature("echo", 3), "echo(_,_,_)");
    }
}
