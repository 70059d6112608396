//! VM instances
//!
//! [`Vm`] owns one native VM. [`VmContext`] is a cheap, cloneable reference
//! to the same VM handed to host callbacks and foreign methods; it stops
//! working (with [`Error::VmAlreadyFreed`]) once the `Vm` is freed.
//!
//! A VM runs one guest call at a time:
//! - `interpret` and `call` move it from idle to running and back
//! - starting either while running fails with [`Error::ReentrantCall`]
//! - all guest access goes through a reentrant lock, so calls from other
//!   threads wait for the current one to finish

use crate::bindings::{Module, ModuleMap};
use crate::config::Config;
use crate::dispatch;
use crate::error::{Error, Result, StackFrame};
use crate::handle::{AsHandle, CallHandle, Handle, HandleRegistry, ListHandle, MapHandle};
use crate::marshal::{c_string, Slots};
use crate::registry;
use crate::value::Value;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use quill_vm::c_api::{self, QuillHandle, QuillInterpretResult, QuillVM};
use std::any::Any;
use std::ops::Deref;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Errors reported by the VM during the current run.
#[derive(Default)]
struct ErrorLog {
    compile: Option<Error>,
    runtime: Option<(String, Vec<StackFrame>)>,
}

/// Host-side state of one VM, shared by [`Vm`], [`VmContext`] and handles.
pub(crate) struct VmInner {
    pub(crate) id: u64,
    /// Null once the VM has been freed
    pub(crate) raw: AtomicPtr<QuillVM>,
    pub(crate) lock: ReentrantMutex<()>,
    running: AtomicBool,
    pub(crate) config: RwLock<Config>,
    pub(crate) bindings: RwLock<ModuleMap>,
    pub(crate) handles: Mutex<HandleRegistry>,
    errors: Mutex<ErrorLog>,
}

/// Marks a VM as running until dropped.
pub(crate) struct Running<'a> {
    slots: Slots<'a>,
    running: &'a AtomicBool,
}

impl<'a> Running<'a> {
    pub(crate) fn slots(&self) -> &Slots<'a> {
        &self.slots
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

impl VmInner {
    /// Start a guest run, rejecting reentry before touching the VM.
    pub(crate) fn enter(self: &Arc<Self>) -> Result<Running<'_>> {
        let slots = Slots::new(self)?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::ReentrantCall);
        }
        *self.errors.lock() = ErrorLog::default();
        Ok(Running {
            slots,
            running: &self.running,
        })
    }

    pub(crate) fn release_native_handle(&self, native: *mut QuillHandle) {
        let _guard = self.lock.lock();
        self.handles.lock().forget(native);
        let raw = self.raw.load(Ordering::Acquire);
        if !raw.is_null() {
            unsafe { c_api::quill_release_handle(raw, native) };
        }
    }

    pub(crate) fn record_error(&self, err: &Error) {
        let mut log = self.errors.lock();
        match err {
            Error::Compile { module, line, message } => {
                log.compile = Some(Error::Compile {
                    module: module.clone(),
                    line: *line,
                    message: message.clone(),
                });
            }
            Error::Runtime { message, .. } => log.runtime = Some((message.clone(), Vec::new())),
            Error::StackTrace(frame) => {
                if let Some((_, frames)) = log.runtime.as_mut() {
                    frames.push(frame.clone());
                }
            }
            _ => {}
        }
    }

    pub(crate) fn take_compile_error(&self, module: &str) -> Error {
        self.errors.lock().compile.take().unwrap_or_else(|| Error::Compile {
            module: module.to_string(),
            line: 0,
            message: "Compilation failed.".to_string(),
        })
    }

    pub(crate) fn take_runtime_error(&self) -> Error {
        let (message, stack_trace) = self
            .errors
            .lock()
            .runtime
            .take()
            .unwrap_or_else(|| ("Runtime error.".to_string(), Vec::new()));
        Error::Runtime { message, stack_trace }
    }

    /// Release outstanding handles, then free the native VM.
    fn free(&self) -> Result<()> {
        let _guard = self.lock.lock();
        if self.running.load(Ordering::Acquire) {
            return Err(Error::ReentrantCall);
        }
        let raw = self.raw.load(Ordering::Acquire);
        if raw.is_null() {
            return Err(Error::VmAlreadyFreed);
        }
        let released = HandleRegistry::free_all(self, raw);
        registry::unregister(raw);
        self.raw.store(ptr::null_mut(), Ordering::Release);
        unsafe { c_api::quill_free_vm(raw) };
        dispatch::release_vm(self.id);

        // Drop host callbacks now; they may hold contexts of this VM.
        *self.config.write() = Config::new();
        *self.bindings.write() = ModuleMap::new();
        debug!(vm = self.id, released, "VM freed");
        Ok(())
    }
}

// ============================================================================
// VmContext
// ============================================================================

/// A reference to a VM, usable from host callbacks and foreign methods.
#[derive(Clone)]
pub struct VmContext {
    inner: Arc<VmInner>,
}

impl VmContext {
    pub(crate) fn from_inner(inner: Arc<VmInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<VmInner> {
        &self.inner
    }

    /// Process-unique id of this VM.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_freed(&self) -> bool {
        self.inner.raw.load(Ordering::Acquire).is_null()
    }

    /// Compile and run `source` as module `module`.
    ///
    /// Compile and runtime errors are reported to the error handler and also
    /// returned. Fails with [`Error::ReentrantCall`] while the VM is running.
    pub fn interpret(&self, module: &str, source: &str) -> Result<()> {
        let module_name = c_string(module, "module name")?;
        let source_text = c_string(source, "source")?;
        let run = self.inner.enter()?;
        debug!(vm = self.id(), module, "interpreting");
        let result = unsafe {
            c_api::quill_interpret(run.slots().raw(), module_name.as_ptr(), source_text.as_ptr())
        };
        match result {
            QuillInterpretResult::Success => Ok(()),
            QuillInterpretResult::CompileError => Err(self.inner.take_compile_error(module)),
            QuillInterpretResult::RuntimeError => Err(self.inner.take_runtime_error()),
        }
    }

    /// Interpret a file, using its path as the module name.
    pub fn interpret_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        self.interpret(&path.to_string_lossy(), &source)
    }

    /// A call handle for `signature` on `receiver`.
    pub fn make_call_handle(&self, receiver: &Handle, signature: &str) -> Result<CallHandle> {
        if receiver.vm_id() != self.id() {
            return Err(Error::WrongVm);
        }
        receiver.func(signature)
    }

    /// Read a top-level variable of a loaded module.
    pub fn get_variable(&self, module: &str, name: &str) -> Result<Value> {
        let module_name = c_string(module, "module name")?;
        let variable = c_string(name, "variable name")?;
        let slots = Slots::new(&self.inner)?;
        unsafe {
            if !c_api::quill_has_module(slots.raw(), module_name.as_ptr()) {
                return Err(Error::NoSuchModule {
                    module: module.to_string(),
                });
            }
            if !c_api::quill_has_variable(slots.raw(), module_name.as_ptr(), variable.as_ptr()) {
                return Err(Error::NoSuchVariable {
                    module: module.to_string(),
                    name: name.to_string(),
                });
            }
            slots.ensure(1);
            c_api::quill_get_variable(slots.raw(), module_name.as_ptr(), variable.as_ptr(), 0);
        }
        let value = slots.read(0);
        slots.clear(0..1);
        value
    }

    /// Convenience for a call handle on a module variable, typically a class.
    pub fn method(&self, module: &str, variable: &str, signature: &str) -> Result<CallHandle> {
        match self.get_variable(module, variable)?.as_handle() {
            Some(receiver) => receiver.func(signature),
            None => Err(Error::UnsupportedValue {
                type_name: format!("primitive variable '{variable}' as a receiver"),
            }),
        }
    }

    pub fn has_module(&self, module: &str) -> Result<bool> {
        let module_name = c_string(module, "module name")?;
        let slots = Slots::new(&self.inner)?;
        Ok(unsafe { c_api::quill_has_module(slots.raw(), module_name.as_ptr()) })
    }

    pub fn has_variable(&self, module: &str, name: &str) -> Result<bool> {
        let module_name = c_string(module, "module name")?;
        let variable = c_string(name, "variable name")?;
        let slots = Slots::new(&self.inner)?;
        Ok(unsafe {
            c_api::quill_has_variable(slots.raw(), module_name.as_ptr(), variable.as_ptr())
        })
    }

    pub fn new_list(&self) -> Result<ListHandle> {
        let slots = Slots::new(&self.inner)?;
        slots.ensure(1);
        unsafe { c_api::quill_set_slot_new_list(slots.raw(), 0) };
        let handle = slots.handle_at(0);
        slots.clear(0..1);
        handle.map(ListHandle::new)
    }

    pub fn new_map(&self) -> Result<MapHandle> {
        let slots = Slots::new(&self.inner)?;
        slots.ensure(1);
        unsafe { c_api::quill_set_slot_new_map(slots.raw(), 0) };
        let handle = slots.handle_at(0);
        slots.clear(0..1);
        handle.map(MapHandle::new)
    }

    // ------------------------------------------------------------------------
    // Raw slot access
    // ------------------------------------------------------------------------

    pub fn slot_count(&self) -> Result<usize> {
        Ok(Slots::new(&self.inner)?.count())
    }

    pub fn ensure_slots(&self, count: usize) -> Result<()> {
        Slots::new(&self.inner)?.ensure(count);
        Ok(())
    }

    /// Decode a slot. Valid until the next slot operation.
    pub fn slot(&self, index: usize) -> Result<Value> {
        Slots::new(&self.inner)?.read(index)
    }

    pub fn set_slot(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        Slots::new(&self.inner)?.write(index, &value.into())
    }

    /// Write any host value; unsupported types write null and fail.
    pub fn set_slot_any<T: Any>(&self, index: usize, value: &T) -> Result<()> {
        Slots::new(&self.inner)?.write_any(index, value)
    }

    // ------------------------------------------------------------------------
    // Configuration and bindings
    // ------------------------------------------------------------------------

    /// Collect garbage now, or when the current run ends.
    pub fn collect_garbage(&self) -> Result<()> {
        let slots = Slots::new(&self.inner)?;
        unsafe { c_api::quill_collect_garbage(slots.raw()) };
        Ok(())
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.config.read().user_data.clone()
    }

    /// The user data, if it is a `T`.
    pub fn user_data_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data()?.downcast::<T>().ok()
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Edit the configuration in place. Heap settings only apply at creation.
    pub fn update_config(&self, edit: impl FnOnce(&mut Config)) {
        edit(&mut self.inner.config.write());
    }

    /// Merge `module` into this VM's bindings under `name`. Takes effect for
    /// foreign declarations compiled afterwards.
    pub fn set_module(&self, name: &str, module: &Module) {
        self.inner.bindings.write().merge_module(name, module);
    }

    pub fn set_modules(&self, modules: &ModuleMap) {
        self.inner.bindings.write().merge(modules);
    }

    /// A copy of this VM's binding table.
    pub fn modules(&self) -> ModuleMap {
        self.inner.bindings.read().clone()
    }

    /// Handles of this VM the host has not released.
    pub fn live_handle_count(&self) -> usize {
        self.inner.handles.lock().len()
    }
}

// ============================================================================
// Vm
// ============================================================================

/// An owned VM. Dropping it frees the VM.
pub struct Vm {
    context: VmContext,
}

impl Vm {
    pub fn new(config: Config) -> Self {
        Self::with_modules(config, &ModuleMap::new())
    }

    /// Create a VM exposing a copy of `modules`.
    pub fn with_modules(config: Config, modules: &ModuleMap) -> Self {
        let mut native = config.native();
        dispatch::install(&mut native);

        let raw = unsafe { c_api::quill_new_vm(&native) };
        let inner = Arc::new(VmInner {
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            raw: AtomicPtr::new(raw),
            lock: ReentrantMutex::new(()),
            running: AtomicBool::new(false),
            config: RwLock::new(config),
            bindings: RwLock::new(modules.clone()),
            handles: Mutex::new(HandleRegistry::default()),
            errors: Mutex::new(ErrorLog::default()),
        });
        registry::register(raw, &inner);
        debug!(vm = inner.id, modules = modules.len(), "VM created");
        Self {
            context: VmContext { inner },
        }
    }

    /// A context that can be stored in callbacks or moved to other threads.
    pub fn context(&self) -> VmContext {
        self.context.clone()
    }

    /// Free the VM: release every outstanding handle, then the native VM.
    ///
    /// Fails with [`Error::VmAlreadyFreed`] when called twice and with
    /// [`Error::ReentrantCall`] from inside a running call.
    pub fn free(&mut self) -> Result<()> {
        self.context.inner.free()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Deref for Vm {
    type Target = VmContext;

    fn deref(&self) -> &VmContext {
        &self.context
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if self.context.is_freed() {
            return;
        }
        if let Err(err) = self.context.inner.free() {
            warn!(vm = self.context.id(), error = %err, "VM could not be freed on drop");
        }
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.context.id())
            .field("running", &self.context.is_running())
            .field("freed", &self.context.is_freed())
            .finish()
    }
}
