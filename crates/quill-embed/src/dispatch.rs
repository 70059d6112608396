//! Callbacks from the VM into the host
//!
//! The VM reports events through plain `extern "C"` functions that carry only
//! the native VM pointer. Each callback here:
//! 1. finds the host VM through the [registry](crate::registry), doing nothing
//!    (or returning "not found") if it is gone
//! 2. routes the event to the VM's config, binding table or the foreign
//!    object table
//! 3. catches panics so they never unwind into the VM
//!
//! Foreign methods and allocators need per-binding state but the VM only
//! stores a function pointer, so each `(module, class, signature)` is parked
//! in a numbered dispatch slot and the VM receives the trampoline
//! monomorphized for that slot. Slots are shared by every VM binding the same
//! key; the host function itself is looked up in the calling VM's binding
//! table when the trampoline runs.

use crate::config::SharedWriter;
use crate::defaults;
use crate::error::{Error, ForeignError, StackFrame};
use crate::foreign::ForeignTable;
use crate::marshal::Slots;
use crate::registry;
use crate::signature::binding_key;
use crate::value::Value;
use crate::vm::VmContext;
use parking_lot::RwLock;
use quill_vm::c_api::{
    host_string, QuillConfiguration, QuillErrorType, QuillForeignClassMethods,
    QuillForeignMethodFn, QuillHostString, QuillVM,
};
use rustc_hash::FxHashSet;
use std::any::Any;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;
use tracing::{debug, error, warn};

/// Number of distinct foreign methods that can be bound at once, across all VMs.
pub const METHOD_SLOTS: usize = 256;

/// Number of distinct foreign classes that can be bound at once, across all VMs.
pub const CLASS_SLOTS: usize = 64;

/// Foreign classes the VM implements itself when the host does not.
const BUILTIN_CLASSES: &[(&str, &str)] = &[("random", "Random")];

/// Point the native config's callbacks at this module.
pub(crate) fn install(native: &mut QuillConfiguration) {
    native.write_fn = Some(write_callback);
    native.error_fn = Some(error_callback);
    native.resolve_module_fn = Some(resolve_module_callback);
    native.load_module_fn = Some(load_module_callback);
    native.bind_foreign_method_fn = Some(bind_method_callback);
    native.bind_foreign_class_fn = Some(bind_class_callback);
}

// ============================================================================
// Dispatch slots
// ============================================================================

struct MethodSlot {
    module: String,
    class: String,
    key: String,
    vms: FxHashSet<u64>,
}

struct ClassSlot {
    module: String,
    class: String,
    vms: FxHashSet<u64>,
}

struct DispatchTable {
    methods: Vec<Option<MethodSlot>>,
    classes: Vec<Option<ClassSlot>>,
}

static DISPATCH: LazyLock<RwLock<DispatchTable>> =
    LazyLock::new(|| RwLock::new(DispatchTable::new()));

impl DispatchTable {
    fn new() -> Self {
        Self {
            methods: (0..METHOD_SLOTS).map(|_| None).collect(),
            classes: (0..CLASS_SLOTS).map(|_| None).collect(),
        }
    }

    /// Park a method for `vm_id`, joining the slot of any VM that already
    /// bound the same key.
    fn bind_method(&mut self, vm_id: u64, module: &str, class: &str, key: &str) -> Option<usize> {
        let existing = self.methods.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|s| s.module == module && s.class == class && s.key == key)
        });
        let index = match existing {
            Some(index) => index,
            None => {
                let index = self.methods.iter().position(Option::is_none)?;
                self.methods[index] = Some(MethodSlot {
                    module: module.to_string(),
                    class: class.to_string(),
                    key: key.to_string(),
                    vms: FxHashSet::default(),
                });
                index
            }
        };
        if let Some(slot) = self.methods[index].as_mut() {
            slot.vms.insert(vm_id);
        }
        Some(index)
    }

    fn bind_class(&mut self, vm_id: u64, module: &str, class: &str) -> Option<usize> {
        let existing = self.classes.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|s| s.module == module && s.class == class)
        });
        let index = match existing {
            Some(index) => index,
            None => {
                let index = self.classes.iter().position(Option::is_none)?;
                self.classes[index] = Some(ClassSlot {
                    module: module.to_string(),
                    class: class.to_string(),
                    vms: FxHashSet::default(),
                });
                index
            }
        };
        if let Some(slot) = self.classes[index].as_mut() {
            slot.vms.insert(vm_id);
        }
        Some(index)
    }

    /// The `(module, class, key)` parked in a method slot, if `vm_id` bound it.
    fn method(&self, slot: usize, vm_id: u64) -> Option<(String, String, String)> {
        self.methods
            .get(slot)
            .and_then(Option::as_ref)
            .filter(|bound| bound.vms.contains(&vm_id))
            .map(|bound| (bound.module.clone(), bound.class.clone(), bound.key.clone()))
    }

    fn class(&self, slot: usize, vm_id: u64) -> Option<(String, String)> {
        self.classes
            .get(slot)
            .and_then(Option::as_ref)
            .filter(|bound| bound.vms.contains(&vm_id))
            .map(|bound| (bound.module.clone(), bound.class.clone()))
    }

    /// Drop `vm_id` from every slot, freeing slots no other VM uses.
    /// Returns the number of slots the VM was using.
    fn release_vm(&mut self, vm_id: u64) -> usize {
        let mut released = 0;
        for slot in self.methods.iter_mut() {
            if let Some(bound) = slot.as_mut() {
                if bound.vms.remove(&vm_id) {
                    released += 1;
                    if bound.vms.is_empty() {
                        *slot = None;
                    }
                }
            }
        }
        for slot in self.classes.iter_mut() {
            if let Some(bound) = slot.as_mut() {
                if bound.vms.remove(&vm_id) {
                    released += 1;
                    if bound.vms.is_empty() {
                        *slot = None;
                    }
                }
            }
        }
        released
    }

    fn in_use(&self) -> usize {
        let methods = self.methods.iter().filter(|slot| slot.is_some()).count();
        methods + self.classes.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Free every dispatch slot held by a VM.
pub(crate) fn release_vm(vm_id: u64) {
    let released = DISPATCH.write().release_vm(vm_id);
    if released > 0 {
        debug!(vm = vm_id, released, "released dispatch slots");
    }
}

/// Dispatch slots currently bound, across all VMs.
pub fn slots_in_use() -> usize {
    DISPATCH.read().in_use()
}

// ============================================================================
// Trampolines
// ============================================================================

unsafe extern "C" fn method_trampoline<const SLOT: usize>(vm: *mut QuillVM) {
    invoke_method(vm, SLOT);
}

unsafe extern "C" fn allocate_trampoline<const SLOT: usize>(vm: *mut QuillVM) {
    invoke_allocate(vm, SLOT);
}

macro_rules! trampoline_row {
    ($f:ident, $row:literal) => {
        [
            $f::<{ $row * 16 }>,
            $f::<{ $row * 16 + 1 }>,
            $f::<{ $row * 16 + 2 }>,
            $f::<{ $row * 16 + 3 }>,
            $f::<{ $row * 16 + 4 }>,
            $f::<{ $row * 16 + 5 }>,
            $f::<{ $row * 16 + 6 }>,
            $f::<{ $row * 16 + 7 }>,
            $f::<{ $row * 16 + 8 }>,
            $f::<{ $row * 16 + 9 }>,
            $f::<{ $row * 16 + 10 }>,
            $f::<{ $row * 16 + 11 }>,
            $f::<{ $row * 16 + 12 }>,
            $f::<{ $row * 16 + 13 }>,
            $f::<{ $row * 16 + 14 }>,
            $f::<{ $row * 16 + 15 }>,
        ]
    };
}

static METHOD_TRAMPOLINES: [[QuillForeignMethodFn; 16]; METHOD_SLOTS / 16] = [
    trampoline_row!(method_trampoline, 0),
    trampoline_row!(method_trampoline, 1),
    trampoline_row!(method_trampoline, 2),
    trampoline_row!(method_trampoline, 3),
    trampoline_row!(method_trampoline, 4),
    trampoline_row!(method_trampoline, 5),
    trampoline_row!(method_trampoline, 6),
    trampoline_row!(method_trampoline, 7),
    trampoline_row!(method_trampoline, 8),
    trampoline_row!(method_trampoline, 9),
    trampoline_row!(method_trampoline, 10),
    trampoline_row!(method_trampoline, 11),
    trampoline_row!(method_trampoline, 12),
    trampoline_row!(method_trampoline, 13),
    trampoline_row!(method_trampoline, 14),
    trampoline_row!(method_trampoline, 15),
];

static ALLOCATE_TRAMPOLINES: [[QuillForeignMethodFn; 16]; CLASS_SLOTS / 16] = [
    trampoline_row!(allocate_trampoline, 0),
    trampoline_row!(allocate_trampoline, 1),
    trampoline_row!(allocate_trampoline, 2),
    trampoline_row!(allocate_trampoline, 3),
];

fn method_trampoline_for(slot: usize) -> QuillForeignMethodFn {
    METHOD_TRAMPOLINES[slot / 16][slot % 16]
}

fn allocate_trampoline_for(slot: usize) -> QuillForeignMethodFn {
    ALLOCATE_TRAMPOLINES[slot / 16][slot % 16]
}

/// Marshal the slots into arguments, run the host method and put its result
/// in slot 0. Failures and panics abort the calling fiber.
fn invoke_method(vm: *mut QuillVM, slot: usize) {
    let Some(ctx) = context(vm) else {
        return;
    };
    let Some((module, class, key)) = DISPATCH.read().method(slot, ctx.id()) else {
        abort(&ctx, "Foreign method is not bound in this VM.");
        return;
    };
    let method = ctx
        .inner()
        .bindings
        .read()
        .class(&module, &class)
        .and_then(|entry| entry.methods().get(&key).cloned());
    let Some(method) = method else {
        abort(&ctx, &format!("Foreign method '{key}' of class {class} is no longer bound."));
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Value, ForeignError> {
        let args = Slots::new(ctx.inner())?.read_from(0)?;
        method(&ctx, &args)
    }));
    match outcome {
        Ok(Ok(value)) => {
            let written = Slots::new(ctx.inner()).and_then(|slots| slots.write(0, &value));
            if let Err(err) = written {
                warn!(vm = ctx.id(), error = %err, "foreign method result written as null");
            }
        }
        Ok(Err(err)) => abort(&ctx, &err.to_string()),
        Err(panic) => abort(&ctx, &format!("Host function panicked: {}", panic_message(&*panic))),
    }
}

/// Run a class initializer and attach its payload to a new foreign object.
fn invoke_allocate(vm: *mut QuillVM, slot: usize) {
    let Some(ctx) = context(vm) else {
        return;
    };
    let Some((module, class)) = DISPATCH.read().class(slot, ctx.id()) else {
        abort(&ctx, "Foreign class is not bound in this VM.");
        return;
    };
    let (initializer, finalizer) = match ctx.inner().bindings.read().class(&module, &class) {
        Some(entry) => (entry.initializer().cloned(), entry.finalizer().cloned()),
        None => (None, None),
    };
    let Some(initializer) = initializer else {
        abort(&ctx, &format!("Class '{class}' implements no constructor."));
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), ForeignError> {
        // Initializers may use the slots, so hold on to the class first.
        let (class_handle, args) = {
            let slots = Slots::new(ctx.inner())?;
            (slots.handle_at(0)?, slots.read_from(1)?)
        };
        let payload = initializer(&ctx, &args)?;

        let slots = Slots::new(ctx.inner())?;
        slots.ensure(1);
        slots.write_handle(0, &class_handle)?;
        let address = unsafe {
            quill_vm::c_api::quill_set_slot_new_foreign(slots.raw(), 0, 0, size_of::<u64>())
        };
        if address.is_null() {
            return Err(format!("Class '{class}' is not a foreign class.").into());
        }
        ForeignTable::global().register(address as usize, payload, finalizer, &ctx);
        Ok(())
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => abort(&ctx, &err.to_string()),
        Err(panic) => abort(&ctx, &format!("Host function panicked: {}", panic_message(&*panic))),
    }
}

/// Allocator for classes with no binding, or when no dispatch slot is free.
unsafe extern "C" fn no_constructor(vm: *mut QuillVM) {
    if let Some(ctx) = context(vm) {
        abort(&ctx, "Foreign class implements no constructor.");
    }
}

unsafe extern "C" fn finalize_trampoline(data: *mut c_void) {
    guard("finalize", (), || {
        ForeignTable::global().finalize(data as usize);
    });
}

// ============================================================================
// VM callbacks
// ============================================================================

unsafe extern "C" fn write_callback(vm: *mut QuillVM, text: *const c_char) {
    guard("write", (), || {
        let Some(ctx) = context(vm) else {
            return;
        };
        let text = c_text(text);
        let (handler, stream) = {
            let config = ctx.inner().config.read();
            (config.write_fn.clone(), config.default_output.clone())
        };
        match handler {
            Some(handler) => handler(&ctx, &text),
            None => write_stream(stream.or_else(defaults::output), text.as_bytes()),
        }
    });
}

unsafe extern "C" fn error_callback(
    vm: *mut QuillVM,
    error_type: QuillErrorType,
    module: *const c_char,
    line: c_int,
    message: *const c_char,
) {
    guard("error", (), || {
        let Some(ctx) = context(vm) else {
            return;
        };
        let module = c_text(module);
        let message = c_text(message);
        let line = line.max(0) as u32;
        let err = match error_type {
            QuillErrorType::Compile => Error::Compile { module, line, message },
            QuillErrorType::Runtime => Error::Runtime {
                message,
                stack_trace: Vec::new(),
            },
            QuillErrorType::StackTrace => Error::StackTrace(StackFrame {
                module,
                line,
                function: message,
            }),
        };
        ctx.inner().record_error(&err);

        let (handler, stream) = {
            let config = ctx.inner().config.read();
            (config.error_fn.clone(), config.default_error.clone())
        };
        match handler {
            Some(handler) => handler(&ctx, &err),
            None => write_stream(stream.or_else(defaults::error), format!("{err}\n").as_bytes()),
        }
    });
}

unsafe extern "C" fn resolve_module_callback(
    vm: *mut QuillVM,
    importer: *const c_char,
    name: *const c_char,
) -> QuillHostString {
    guard("resolve module", QuillHostString::none(), || {
        let Some(ctx) = context(vm) else {
            return QuillHostString::none();
        };
        let resolver = ctx.inner().config.read().resolve_module_fn.clone();
        let Some(resolver) = resolver else {
            return QuillHostString::none();
        };
        match resolver(&ctx, &c_text(importer), &c_text(name)) {
            Some(resolved) => host_string(&resolved),
            None => QuillHostString::none(),
        }
    })
}

unsafe extern "C" fn load_module_callback(
    vm: *mut QuillVM,
    name: *const c_char,
) -> QuillHostString {
    guard("load module", QuillHostString::none(), || {
        let Some(ctx) = context(vm) else {
            return QuillHostString::none();
        };
        let name = c_text(name);
        let loader = ctx.inner().config.read().load_module_fn.clone().or_else(defaults::loader);
        match loader.and_then(|load| load(&ctx, &name)) {
            Some(source) => {
                debug!(vm = ctx.id(), module = %name, "module loaded");
                host_string(&source)
            }
            None => {
                debug!(vm = ctx.id(), module = %name, "module not found");
                QuillHostString::none()
            }
        }
    })
}

unsafe extern "C" fn bind_method_callback(
    vm: *mut QuillVM,
    module: *const c_char,
    class_name: *const c_char,
    is_static: bool,
    signature: *const c_char,
) -> Option<QuillForeignMethodFn> {
    guard("bind foreign method", None, || {
        let ctx = context(vm)?;
        let module = c_text(module);
        let class = c_text(class_name);
        let signature = c_text(signature);
        let bound = ctx
            .inner()
            .bindings
            .read()
            .method(&module, &class, is_static, &signature)
            .is_some();
        if !bound {
            debug!(vm = ctx.id(), %module, %class, %signature, "foreign method not bound");
            return None;
        }

        let key = binding_key(is_static, &signature);
        let Some(slot) = DISPATCH.write().bind_method(ctx.id(), &module, &class, &key) else {
            warn!(vm = ctx.id(), %module, %class, %key, "no free dispatch slot for foreign method");
            return None;
        };
        debug!(vm = ctx.id(), %module, %class, %key, slot, "foreign method bound");
        Some(method_trampoline_for(slot))
    })
}

unsafe extern "C" fn bind_class_callback(
    vm: *mut QuillVM,
    module: *const c_char,
    class_name: *const c_char,
) -> QuillForeignClassMethods {
    guard("bind foreign class", QuillForeignClassMethods::default(), || {
        let Some(ctx) = context(vm) else {
            return QuillForeignClassMethods::default();
        };
        let module = c_text(module);
        let class = c_text(class_name);
        let bound = ctx.inner().bindings.read().class(&module, &class).is_some();
        if !bound {
            if BUILTIN_CLASSES.iter().any(|&(m, c)| m == module && c == class) {
                return QuillForeignClassMethods::default();
            }
            debug!(vm = ctx.id(), %module, %class, "foreign class not bound");
            return QuillForeignClassMethods {
                allocate: Some(no_constructor),
                finalize: None,
            };
        }

        let Some(slot) = DISPATCH.write().bind_class(ctx.id(), &module, &class) else {
            warn!(vm = ctx.id(), %module, %class, "no free dispatch slot for foreign class");
            return QuillForeignClassMethods {
                allocate: Some(no_constructor),
                finalize: None,
            };
        };
        debug!(vm = ctx.id(), %module, %class, slot, "foreign class bound");
        QuillForeignClassMethods {
            allocate: Some(allocate_trampoline_for(slot)),
            finalize: Some(finalize_trampoline),
        }
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn context(vm: *mut QuillVM) -> Option<VmContext> {
    registry::lookup(vm).map(VmContext::from_inner)
}

/// Raise `message` in the fiber that called into the host.
fn abort(ctx: &VmContext, message: &str) {
    if let Ok(slots) = Slots::new(ctx.inner()) {
        slots.abort(message);
    }
}

unsafe fn c_text(text: *const c_char) -> String {
    if text.is_null() {
        String::new()
    } else {
        CStr::from_ptr(text).to_string_lossy().into_owned()
    }
}

fn write_stream(stream: Option<SharedWriter>, bytes: &[u8]) {
    if let Some(stream) = stream {
        let mut stream = stream.lock();
        if stream.write_all(bytes).and_then(|_| stream.flush()).is_err() {
            debug!("dropped VM output after a write failure");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Run a callback body, turning a panic into `fallback`.
fn guard<R>(callback: &'static str, fallback: R, body: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(panic) => {
            error!(callback, message = %panic_message(&*panic), "host callback panicked");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_method_shares_slot_across_vms() {
        let mut table = DispatchTable::new();
        let first = table.bind_method(1, "main", "A", "f()").unwrap();
        let again = table.bind_method(1, "main", "A", "f()").unwrap();
        let other_vm = table.bind_method(2, "main", "A", "f()").unwrap();
        assert_eq!(first, again);
        assert_eq!(first, other_vm);
        assert_eq!(table.in_use(), 1);

        assert_eq!(table.release_vm(1), 1);
        assert_eq!(table.method(first, 1), None);
        assert_eq!(
            table.method(first, 2),
            Some(("main".to_string(), "A".to_string(), "f()".to_string()))
        );
        assert_eq!(table.release_vm(2), 1);
        assert_eq!(table.in_use(), 0);
        assert_eq!(table.bind_method(3, "main", "B", "g()"), Some(first));
    }

    #[test]
    fn test_method_pool_exhaustion() {
        let mut table = DispatchTable::new();
        for i in 0..METHOD_SLOTS {
            assert!(table.bind_method(1, "main", "A", &format!("m{i}()")).is_some());
        }
        assert!(table.bind_method(1, "main", "A", "overflow()").is_none());
        // Keys already parked stay available to other VMs.
        assert!(table.bind_method(2, "main", "A", "m0()").is_some());
        assert_eq!(table.release_vm(1), METHOD_SLOTS);
        assert_eq!(table.in_use(), 1);
    }

    #[test]
    fn test_class_slots_do_not_grow_with_vms() {
        let mut table = DispatchTable::new();
        let first = table.bind_class(0, "main", "Counter").unwrap();
        for vm_id in 1..(CLASS_SLOTS as u64 * 2) {
            assert_eq!(table.bind_class(vm_id, "main", "Counter"), Some(first));
        }
        assert_eq!(table.in_use(), 1);
        assert_eq!(table.class(first, 5), Some(("main".to_string(), "Counter".to_string())));
        assert_eq!(table.class(first, 1000), None);
    }

    #[test]
    fn test_trampolines_are_distinct() {
        assert_ne!(method_trampoline_for(0) as usize, method_trampoline_for(1) as usize);
        assert_ne!(method_trampoline_for(17) as usize, method_trampoline_for(255) as usize);
        assert_ne!(allocate_trampoline_for(0) as usize, allocate_trampoline_for(63) as usize);
    }

    #[test]
    fn test_guard_catches_panics() {
        let value = guard("test", 7, || -> i32 { panic!("boom") });
        assert_eq!(value, 7);
        assert_eq!(panic_message(&"text"), "text");
    }
}
