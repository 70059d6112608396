//! Binding tables
//!
//! Plain-data descriptions of the foreign classes a VM exposes, keyed by
//! module, class name and method signature. Tables are built before any VM
//! exists; a VM stores its own clone, so later edits to the original have no
//! effect on it.
//!
//! `merge` overlays a source table onto the receiver at the same key path and
//! never deletes entries.

use crate::error::{ForeignError, Result};
use crate::signature::{binding_key, Signature};
use crate::value::Value;
use crate::vm::VmContext;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A host method. `args[0]` is the receiver (the instance, or the class for
/// static methods), followed by the call arguments.
pub type ForeignFn =
    Arc<dyn Fn(&VmContext, &[Value]) -> std::result::Result<Value, ForeignError> + Send + Sync>;

/// Builds the host payload of a new foreign instance from the constructor
/// arguments. The class is not passed: each initializer belongs to exactly
/// one class entry.
pub type Initializer = Arc<
    dyn Fn(&VmContext, &[Value]) -> std::result::Result<Box<dyn Any + Send>, ForeignError>
        + Send
        + Sync,
>;

/// Runs when the guest finalizes a foreign instance, with the VM that created
/// it.
///
/// Finalizers run during garbage collection or VM teardown. The context is for
/// reading host state (id, user data, config); calls into the VM from here
/// fail with [`Error::ReentrantCall`](crate::Error::ReentrantCall) or
/// [`Error::VmAlreadyFreed`](crate::Error::VmAlreadyFreed).
pub type Finalizer = Arc<dyn Fn(&VmContext, &mut (dyn Any + Send)) + Send + Sync>;

// ============================================================================
// Methods
// ============================================================================

/// Signature key → host method. Static methods are keyed `static <sig>`.
#[derive(Clone, Default)]
pub struct MethodMap {
    methods: FxHashMap<String, ForeignFn>,
}

impl MethodMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `signature` (optionally `static `-prefixed) to `method`.
    pub fn insert<F>(&mut self, signature: &str, method: F) -> Result<()>
    where
        F: Fn(&VmContext, &[Value]) -> std::result::Result<Value, ForeignError>
            + Send
            + Sync
            + 'static,
    {
        self.insert_fn(signature, Arc::new(method))
    }

    pub fn insert_fn(&mut self, signature: &str, method: ForeignFn) -> Result<()> {
        let key = Signature::parse(signature)?.key();
        self.methods.insert(key, method);
        Ok(())
    }

    /// Look up a method the way the VM asks for it.
    pub fn lookup(&self, is_static: bool, signature: &str) -> Option<&ForeignFn> {
        self.methods.get(&binding_key(is_static, signature))
    }

    pub fn get(&self, key: &str) -> Option<&ForeignFn> {
        self.methods.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.methods.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Overlay every method of `source`, replacing methods with the same key.
    pub fn merge(&mut self, source: &MethodMap) {
        for (key, method) in &source.methods {
            self.methods.insert(key.clone(), method.clone());
        }
    }
}

impl fmt::Debug for MethodMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_unstable();
        f.debug_set().entries(keys).finish()
    }
}

// ============================================================================
// Classes
// ============================================================================

/// Host implementation of one foreign class.
#[derive(Clone, Default)]
pub struct ForeignClass {
    initializer: Option<Initializer>,
    finalizer: Option<Finalizer>,
    methods: MethodMap,
}

impl ForeignClass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the constructor body. Without one, constructing the class aborts.
    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&VmContext, &[Value]) -> std::result::Result<Box<dyn Any + Send>, ForeignError>
            + Send
            + Sync
            + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Constructor that ignores its arguments and stores `T::default()`.
    pub fn with_default_payload<T: Default + Send + 'static>(self) -> Self {
        self.with_initializer(|_, _| Ok(Box::new(T::default())))
    }

    pub fn with_finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: Fn(&VmContext, &mut (dyn Any + Send)) + Send + Sync + 'static,
    {
        self.finalizer = Some(Arc::new(finalizer));
        self
    }

    pub fn with_method<F>(mut self, signature: &str, method: F) -> Result<Self>
    where
        F: Fn(&VmContext, &[Value]) -> std::result::Result<Value, ForeignError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(signature, method)?;
        Ok(self)
    }

    pub fn with_static_method<F>(self, signature: &str, method: F) -> Result<Self>
    where
        F: Fn(&VmContext, &[Value]) -> std::result::Result<Value, ForeignError>
            + Send
            + Sync
            + 'static,
    {
        self.with_method(&binding_key(true, signature), method)
    }

    pub fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    pub fn finalizer(&self) -> Option<&Finalizer> {
        self.finalizer.as_ref()
    }

    pub fn methods(&self) -> &MethodMap {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut MethodMap {
        &mut self.methods
    }

    /// Overlay `source`: its initializer and finalizer replace ours when set,
    /// and its methods are merged.
    pub fn merge(&mut self, source: &ForeignClass) {
        if let Some(initializer) = &source.initializer {
            self.initializer = Some(initializer.clone());
        }
        if let Some(finalizer) = &source.finalizer {
            self.finalizer = Some(finalizer.clone());
        }
        self.methods.merge(&source.methods);
    }
}

impl fmt::Debug for ForeignClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClass")
            .field("initializer", &self.initializer.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .field("methods", &self.methods)
            .finish()
    }
}

/// Class name → foreign class.
#[derive(Debug, Clone, Default)]
pub struct ClassMap {
    classes: FxHashMap<String, ForeignClass>,
}

/// The classes one guest module exposes.
pub type Module = ClassMap;

impl ClassMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, class: ForeignClass) {
        self.classes.insert(name.into(), class);
    }

    pub fn with_class(mut self, name: impl Into<String>, class: ForeignClass) -> Self {
        self.insert(name, class);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ForeignClass> {
        self.classes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ForeignClass> {
        self.classes.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn merge(&mut self, source: &ClassMap) {
        for (name, class) in &source.classes {
            self.classes.entry(name.clone()).or_default().merge(class);
        }
    }
}

// ============================================================================
// Modules
// ============================================================================

/// Module name → classes.
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    modules: FxHashMap<String, Module>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, module: Module) {
        self.modules.insert(name.into(), module);
    }

    pub fn with_module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.insert(name, module);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn class(&self, module: &str, class: &str) -> Option<&ForeignClass> {
        self.modules.get(module)?.get(class)
    }

    /// Resolve a method the way the bind callback receives it.
    pub fn method(
        &self,
        module: &str,
        class: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<&ForeignFn> {
        self.class(module, class)?.methods().lookup(is_static, signature)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn merge(&mut self, source: &ModuleMap) {
        for (name, module) in &source.modules {
            self.modules.entry(name.clone()).or_default().merge(module);
        }
    }

    /// Merge a single module.
    pub fn merge_module(&mut self, name: &str, module: &Module) {
        self.modules.entry(name.to_string()).or_default().merge(module);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn returning(
        n: f64,
    ) -> impl Fn(&VmContext, &[Value]) -> std::result::Result<Value, ForeignError> {
        move |_, _| Ok(Value::Num(n))
    }

    #[test]
    fn test_static_methods_are_prefixed() {
        let class = ForeignClass::new()
            .with_method("count", returning(1.0))
            .unwrap()
            .with_static_method("create()", returning(2.0))
            .unwrap();
        let methods = class.methods();
        assert!(methods.contains("count"));
        assert!(methods.contains("static create()"));
        assert!(methods.lookup(true, "create()").is_some());
        assert!(methods.lookup(false, "create()").is_none());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let result = ForeignClass::new().with_method("bad(", returning(0.0));
        assert!(result.is_err());
    }

    #[test]
    fn test_merge_disjoint_is_union() {
        let a = ForeignClass::new().with_method("a()", returning(1.0)).unwrap();
        let b = ForeignClass::new().with_method("b()", returning(2.0)).unwrap();
        let left = ModuleMap::new().with_module("main", Module::new().with_class("A", a));
        let right = ModuleMap::new()
            .with_module("main", Module::new().with_class("A", b))
            .with_module("other", Module::new().with_class("B", ForeignClass::new()));

        let left_a = left.class("main", "A").unwrap().methods().get("a()").unwrap().clone();
        let mut merged = left.clone();
        merged.merge(&right);

        let methods = merged.class("main", "A").unwrap().methods();
        assert_eq!(methods.len(), 2);
        assert!(methods.contains("a()"));
        assert!(methods.contains("b()"));
        assert!(merged.class("other", "B").is_some());
        assert!(Arc::ptr_eq(methods.get("a()").unwrap(), &left_a));

        // The source of the clone is untouched.
        assert_eq!(left.class("main", "A").unwrap().methods().len(), 1);
        assert!(left.get("other").is_none());
    }

    #[test]
    fn test_merge_shared_key_takes_source() {
        let left = Module::new().with_class(
            "A",
            ForeignClass::new()
                .with_method("x()", returning(1.0))
                .unwrap()
                .with_method("keep()", returning(3.0))
                .unwrap(),
        );
        let x = ForeignClass::new().with_method("x()", returning(2.0)).unwrap();
        let right = Module::new().with_class("A", x);

        let right_x = right.get("A").unwrap().methods().get("x()").unwrap().clone();
        let left_keep = left.get("A").unwrap().methods().get("keep()").unwrap().clone();

        let mut merged = left.clone();
        merged.merge(&right);
        let class = merged.get("A").unwrap();
        assert!(Arc::ptr_eq(class.methods().get("x()").unwrap(), &right_x));
        assert!(Arc::ptr_eq(class.methods().get("keep()").unwrap(), &left_keep));
    }

    #[test]
    fn test_merge_keeps_initializer_unless_overridden() {
        let mut left = ForeignClass::new().with_default_payload::<i64>();
        left.merge(&ForeignClass::new().with_method("m()", returning(0.0)).unwrap());
        assert!(left.initializer().is_some());

        let replacement = ForeignClass::new().with_default_payload::<u8>();
        let expected = replacement.initializer().unwrap().clone();
        left.merge(&replacement);
        assert!(Arc::ptr_eq(left.initializer().unwrap(), &expected));
    }
}
