//! Handles to guest values
//!
//! A [`Handle`] keeps a guest object alive across slot operations. Every
//! handle belongs to the VM that created it and is tracked in that VM's
//! [`HandleRegistry`], so tearing the VM down can release whatever the host
//! still holds.
//!
//! Lifetime rules shared by all variants:
//! - `release` is idempotent; clones share one native handle
//! - the last clone to be dropped releases the native handle
//! - any operation on a released handle fails with [`Error::HandleReleased`]

use crate::error::{Error, Result};
use crate::foreign::{ForeignPayload, ForeignTable};
use crate::marshal::{c_string, Slots};
use crate::signature::Signature;
use crate::value::Value;
use crate::vm::VmInner;
use quill_vm::c_api::{self, QuillHandle, QuillInterpretResult, QuillVM};
use rustc_hash::FxHashMap;
use std::ffi::c_int;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

// ============================================================================
// Registry
// ============================================================================

/// Per-VM set of live handles, keyed by native handle pointer.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    live: FxHashMap<usize, Weak<HandleCell>>,
}

impl HandleRegistry {
    /// Wrap a native handle and register it with `vm`.
    pub(crate) fn create(vm: &Arc<VmInner>, native: *mut QuillHandle) -> Handle {
        let cell = Arc::new(HandleCell {
            native: AtomicPtr::new(native),
            vm: Arc::downgrade(vm),
            vm_id: vm.id,
        });
        vm.handles.lock().live.insert(native as usize, Arc::downgrade(&cell));
        trace!(vm = vm.id, handle = ?native, "handle created");
        Handle { cell }
    }

    pub(crate) fn forget(&mut self, native: *mut QuillHandle) {
        self.live.remove(&(native as usize));
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    /// Take every registered handle, leaving the registry empty.
    pub(crate) fn drain(&mut self) -> Vec<Weak<HandleCell>> {
        self.live.drain().map(|(_, cell)| cell).collect()
    }

    /// Release every outstanding handle of a VM that is about to be freed.
    ///
    /// The registry lock is not held while handles are released, since
    /// dropping the last clone of a handle re-enters the registry.
    pub(crate) fn free_all(vm: &VmInner, raw: *mut QuillVM) -> usize {
        let cells = vm.handles.lock().drain();
        let mut released = 0;
        for cell in cells.iter().filter_map(Weak::upgrade) {
            let native = cell.native.swap(ptr::null_mut(), Ordering::AcqRel);
            if !native.is_null() {
                unsafe { c_api::quill_release_handle(raw, native) };
                released += 1;
            }
        }
        released
    }
}

pub(crate) struct HandleCell {
    native: AtomicPtr<QuillHandle>,
    vm: Weak<VmInner>,
    vm_id: u64,
}

impl HandleCell {
    fn release(&self) {
        let native = self.native.swap(ptr::null_mut(), Ordering::AcqRel);
        if native.is_null() {
            return;
        }
        trace!(vm = self.vm_id, handle = ?native, "handle released");
        if let Some(vm) = self.vm.upgrade() {
            vm.release_native_handle(native);
        }
    }
}

impl Drop for HandleCell {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// Handle
// ============================================================================

/// A reference to a guest value owned by one VM.
#[derive(Clone)]
pub struct Handle {
    cell: Arc<HandleCell>,
}

impl Handle {
    /// Release the guest value. Calling this again is a no-op.
    pub fn release(&self) {
        self.cell.release();
    }

    pub fn is_released(&self) -> bool {
        self.cell.native.load(Ordering::Acquire).is_null()
    }

    /// Id of the owning VM.
    pub fn vm_id(&self) -> u64 {
        self.cell.vm_id
    }

    pub(crate) fn native(&self) -> Result<*mut QuillHandle> {
        let native = self.cell.native.load(Ordering::Acquire);
        if native.is_null() {
            Err(Error::HandleReleased)
        } else {
            Ok(native)
        }
    }

    /// The owning VM, after checking the handle is still live.
    pub(crate) fn vm(&self) -> Result<Arc<VmInner>> {
        self.native()?;
        self.cell.vm.upgrade().ok_or(Error::VmAlreadyFreed)
    }

    /// Lock the owning VM and put this handle's value in slot 0.
    fn load<'a>(&self, vm: &'a Arc<VmInner>, slots_needed: usize) -> Result<Slots<'a>> {
        let slots = Slots::new(vm)?;
        slots.ensure(slots_needed);
        slots.write_handle(0, self)?;
        Ok(slots)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("vm", &self.cell.vm_id)
            .field("native", &self.cell.native.load(Ordering::Relaxed))
            .finish()
    }
}

/// Operations shared by every handle variant.
pub trait AsHandle {
    fn handle(&self) -> &Handle;

    fn release(&self) {
        self.handle().release();
    }

    fn is_released(&self) -> bool {
        self.handle().is_released()
    }

    /// A call handle invoking `signature` with this value as the receiver.
    fn func(&self, signature: &str) -> Result<CallHandle> {
        CallHandle::new(self.handle(), signature)
    }
}

impl AsHandle for Handle {
    fn handle(&self) -> &Handle {
        self
    }
}

// ============================================================================
// Lists
// ============================================================================

/// A handle to a guest list.
#[derive(Debug, Clone)]
pub struct ListHandle(Handle);

impl ListHandle {
    pub(crate) fn new(handle: Handle) -> Self {
        Self(handle)
    }

    pub fn count(&self) -> Result<usize> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 1)?;
        Ok(list_count(&slots))
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 2)?;
        check_index(index, list_count(&slots))?;
        unsafe { c_api::quill_get_list_element(slots.raw(), 0, index as c_int, 1) };
        slots.read(1)
    }

    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 2)?;
        check_index(index, list_count(&slots))?;
        slots.write(1, &value.into())?;
        unsafe { c_api::quill_set_list_element(slots.raw(), 0, index as c_int, 1) };
        slots.clear(1..2);
        Ok(())
    }

    /// Insert before `index`; `index == count` appends.
    pub fn insert(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 2)?;
        let count = list_count(&slots);
        if index > count {
            return Err(Error::IndexOutOfBounds { index, count });
        }
        slots.write(1, &value.into())?;
        unsafe { c_api::quill_insert_in_list(slots.raw(), 0, index as c_int, 1) };
        slots.clear(1..2);
        Ok(())
    }

    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 2)?;
        slots.write(1, &value.into())?;
        unsafe { c_api::quill_insert_in_list(slots.raw(), 0, -1, 1) };
        slots.clear(1..2);
        Ok(())
    }

    /// Every element, in order.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 2)?;
        (0..list_count(&slots))
            .map(|index| {
                unsafe { c_api::quill_get_list_element(slots.raw(), 0, index as c_int, 1) };
                slots.read(1)
            })
            .collect()
    }
}

impl AsHandle for ListHandle {
    fn handle(&self) -> &Handle {
        &self.0
    }
}

fn list_count(slots: &Slots<'_>) -> usize {
    unsafe { c_api::quill_get_list_count(slots.raw(), 0) }.max(0) as usize
}

fn check_index(index: usize, count: usize) -> Result<()> {
    if index < count {
        Ok(())
    } else {
        Err(Error::IndexOutOfBounds { index, count })
    }
}

// ============================================================================
// Maps
// ============================================================================

/// A handle to a guest map.
#[derive(Debug, Clone)]
pub struct MapHandle(Handle);

impl MapHandle {
    pub(crate) fn new(handle: Handle) -> Self {
        Self(handle)
    }

    pub fn count(&self) -> Result<usize> {
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 1)?;
        Ok(unsafe { c_api::quill_get_map_count(slots.raw(), 0) }.max(0) as usize)
    }

    pub fn contains(&self, key: impl Into<Value>) -> Result<bool> {
        let key = key.into();
        self.with_key(&key, |slots| {
            Ok(unsafe { c_api::quill_get_map_contains_key(slots.raw(), 0, 1) })
        })
    }

    pub fn get(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.with_key(&key, |slots| {
            if !unsafe { c_api::quill_get_map_value(slots.raw(), 0, 1, 2) } {
                return Err(Error::KeyNotFound { key: key.to_string() });
            }
            slots.read(2)
        })
    }

    /// Store `value` under `key`. Keys that are not null, booleans, numbers
    /// or strings fail with [`Error::InvalidMapKey`] before the map is touched.
    pub fn set(&self, key: impl Into<Value>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        self.with_key(&key, |slots| {
            slots.write(2, &value)?;
            if !unsafe { c_api::quill_set_map_value(slots.raw(), 0, 1, 2) } {
                return Err(Error::InvalidMapKey { key: key.to_string() });
            }
            Ok(())
        })
    }

    /// Remove `key`, returning the value it held.
    pub fn remove(&self, key: impl Into<Value>) -> Result<Value> {
        let key = key.into();
        self.with_key(&key, |slots| {
            if !unsafe { c_api::quill_remove_map_value(slots.raw(), 0, 1, 2) } {
                return Err(Error::KeyNotFound { key: key.to_string() });
            }
            slots.read(2)
        })
    }

    /// Map in slot 0, key in slot 1, slot 2 free for a value.
    fn with_key<R>(&self, key: &Value, f: impl FnOnce(&Slots<'_>) -> Result<R>) -> Result<R> {
        if !key.is_map_key() {
            return Err(Error::InvalidMapKey { key: key.to_string() });
        }
        let vm = self.0.vm()?;
        let slots = self.0.load(&vm, 3)?;
        slots.write(1, key)?;
        let result = f(&slots);
        slots.clear(1..3);
        result
    }
}

impl AsHandle for MapHandle {
    fn handle(&self) -> &Handle {
        &self.0
    }
}

// ============================================================================
// Foreign objects
// ============================================================================

/// A handle to a foreign-class instance and, through the foreign object
/// table, to its host payload.
#[derive(Debug, Clone)]
pub struct ForeignHandle {
    handle: Handle,
    address: usize,
}

impl ForeignHandle {
    pub(crate) fn new(handle: Handle, address: usize) -> Self {
        Self { handle, address }
    }

    /// Address of the guest-allocated data block.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The shared payload cell registered for this object.
    pub fn payload(&self) -> Result<ForeignPayload> {
        self.handle.native()?;
        ForeignTable::global().lookup(self.address)
    }

    /// Run `f` on the payload, downcast to `T`.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let payload = self.payload()?;
        let mut payload = payload.lock();
        let value = (**payload).downcast_mut::<T>().ok_or(Error::ForeignTypeMismatch {
            expected: std::any::type_name::<T>(),
        })?;
        Ok(f(value))
    }
}

impl AsHandle for ForeignHandle {
    fn handle(&self) -> &Handle {
        &self.handle
    }
}

// ============================================================================
// Call handles
// ============================================================================

/// A receiver bound to a method signature, callable from the host.
#[derive(Debug, Clone)]
pub struct CallHandle {
    method: Handle,
    receiver: Handle,
    signature: Signature,
}

impl CallHandle {
    pub(crate) fn new(receiver: &Handle, signature: &str) -> Result<Self> {
        let signature = Signature::parse(signature)?;
        if signature.is_static {
            return Err(Error::InvalidSignature {
                signature: signature.to_string(),
                reason: "call the method on the class object without the static prefix".to_string(),
            });
        }
        let text = c_string(&signature.call_form(), "signature")?;
        let vm = receiver.vm()?;
        let slots = Slots::new(&vm)?;
        let native = unsafe { c_api::quill_make_call_handle(slots.raw(), text.as_ptr()) };
        if native.is_null() {
            return Err(Error::VmAlreadyFreed);
        }
        Ok(Self {
            method: HandleRegistry::create(&vm, native),
            receiver: receiver.clone(),
            signature,
        })
    }

    /// Invoke the method with `args` and return its result.
    ///
    /// Fails with [`Error::ReentrantCall`] when the VM is already running.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        if args.len() != self.signature.arity {
            return Err(Error::ArityMismatch {
                signature: self.signature.call_form(),
                expected: self.signature.arity,
                got: args.len(),
            });
        }
        let vm = self.method.vm()?;
        let run = vm.enter()?;
        let slots = run.slots();
        let method = slots.native_handle(&self.method)?;
        slots.ensure(args.len() + 1);
        slots.write_handle(0, &self.receiver)?;
        for (i, arg) in args.iter().enumerate() {
            slots.write(i + 1, arg)?;
        }
        match unsafe { c_api::quill_call(slots.raw(), method) } {
            QuillInterpretResult::Success => slots.read(0),
            _ => Err(vm.take_runtime_error()),
        }
    }

    /// The signature as the guest spells it, e.g. `add(_,_)`.
    pub fn signature(&self) -> String {
        self.signature.call_form()
    }

    pub fn arity(&self) -> usize {
        self.signature.arity
    }

    pub fn receiver(&self) -> &Handle {
        &self.receiver
    }
}

impl AsHandle for CallHandle {
    fn handle(&self) -> &Handle {
        &self.method
    }
}
