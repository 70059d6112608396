//! Runtime values and heap object layouts.

use crate::ast::{FnDecl, MethodDecl};
use crate::c_api::{QuillFinalizerFn, QuillForeignMethodFn};
use crate::interpreter::{Interpreter, Throw};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Index of an object in the [`crate::heap::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub(crate) u32);

impl ObjId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A Quill value. Everything that is not null, a bool or a number lives on the heap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Obj(ObjId),
}

impl Value {
    /// `false` and `null` are the only falsy values.
    pub fn is_falsy(self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_obj(self) -> Option<ObjId> {
        match self {
            Value::Obj(id) => Some(id),
            _ => None,
        }
    }
}

// ============================================================================
// Heap objects
// ============================================================================

pub enum Obj {
    String(Vec<u8>),
    List(Vec<Value>),
    Map(MapObj),
    Range(RangeObj),
    Instance(InstanceObj),
    Class(ClassObj),
    Foreign(ForeignObj),
    Fn(FnObj),
    Fiber(FiberObj),
}

/// Keys are hashed structurally; the original key value is kept alongside
/// the entry so it can be handed back to scripts.
pub type MapObj = FxHashMap<MapKey, (Value, Value)>;

/// The value types allowed as map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Bool(bool),
    Num(u64),
    Str(Vec<u8>),
    Class(ObjId),
    Range(u64, u64, bool),
}

impl MapKey {
    /// Normalizes `-0` to `0` so both hash alike.
    pub fn num(n: f64) -> Self {
        MapKey::Num(if n == 0.0 { 0 } else { n.to_bits() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeObj {
    pub from: f64,
    pub to: f64,
    pub inclusive: bool,
}

pub struct InstanceObj {
    pub class: ObjId,
    pub fields: FxHashMap<String, Value>,
}

/// A host-owned block of bytes inside a guest object. The boxed slice keeps
/// its address stable while the heap vector reallocates.
pub struct ForeignObj {
    pub class: ObjId,
    pub data: Box<[u64]>,
}

pub struct FnObj {
    pub decl: Rc<FnDecl>,
    pub closure: Closure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Running,
    Done,
}

pub struct FiberObj {
    pub func: ObjId,
    pub state: FiberState,
    pub error: Value,
}

pub struct ClassObj {
    pub name: String,
    pub superclass: Option<ObjId>,
    pub methods: FxHashMap<String, Method>,
    pub static_methods: FxHashMap<String, Method>,
    pub static_fields: FxHashMap<String, Value>,
    pub is_foreign: bool,
    pub allocate: Option<QuillForeignMethodFn>,
    pub finalize: Option<QuillFinalizerFn>,
}

impl ClassObj {
    pub fn new(name: impl Into<String>, superclass: Option<ObjId>) -> Self {
        Self {
            name: name.into(),
            superclass,
            methods: FxHashMap::default(),
            static_methods: FxHashMap::default(),
            static_fields: FxHashMap::default(),
            is_foreign: false,
            allocate: None,
            finalize: None,
        }
    }
}

// ============================================================================
// Methods
// ============================================================================

/// Native method implemented by the interpreter. `args[0]` is the receiver.
pub type Primitive = fn(&Interpreter, &[Value]) -> Result<Value, Throw>;

#[derive(Clone)]
pub enum Method {
    Primitive(Primitive),
    /// A method written in Quill, with the class that defines it.
    Block {
        decl: Rc<MethodDecl>,
        module: Rc<Module>,
        class: ObjId,
    },
    Foreign(QuillForeignMethodFn),
    /// The static side of `construct name(...)`: allocates, then runs `init`.
    Constructor { init: String },
}

// ============================================================================
// Scopes
// ============================================================================

/// A module's top-level variables.
pub struct Module {
    pub name: String,
    pub vars: RefCell<FxHashMap<String, Value>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).copied()
    }
}

/// A local scope. Scopes outlive their block when a closure captures them.
pub struct Env {
    pub vars: RefCell<FxHashMap<String, Value>>,
    pub parent: Option<Rc<Env>>,
}

impl Env {
    pub fn new(parent: Option<Rc<Env>>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(FxHashMap::default()),
            parent,
        })
    }

    /// Finds the innermost scope that declares `name`.
    pub fn lookup(self: &Rc<Self>, name: &str) -> Option<Rc<Env>> {
        let mut env = Some(self.clone());
        while let Some(scope) = env {
            if scope.vars.borrow().contains_key(name) {
                return Some(scope);
            }
            env = scope.parent.clone();
        }
        None
    }
}

/// Lexical context captured by a block argument or active in a method body.
#[derive(Clone)]
pub struct Closure {
    pub module: Rc<Module>,
    pub env: Option<Rc<Env>>,
    pub this: Option<Value>,
    pub class: Option<ObjId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falsiness() {
        assert!(Value::Null.is_falsy());
        assert!(Value::Bool(false).is_falsy());
        assert!(!Value::Num(0.0).is_falsy());
        assert!(!Value::Bool(true).is_falsy());
    }

    #[test]
    fn test_negative_zero_key() {
        assert_eq!(MapKey::num(-0.0), MapKey::num(0.0));
        assert_ne!(MapKey::num(1.0), MapKey::num(2.0));
    }

    #[test]
    fn test_env_lookup_walks_parents() {
        let outer = Env::new(None);
        outer.vars.borrow_mut().insert("a".into(), Value::Num(1.0));
        let inner = Env::new(Some(outer.clone()));
        let found = inner.lookup("a").unwrap();
        assert!(Rc::ptr_eq(&found, &outer));
        assert!(inner.lookup("b").is_none());
    }
}
