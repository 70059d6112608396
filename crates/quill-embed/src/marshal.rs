//! Slot marshaling
//!
//! Moves [`Value`]s in and out of the VM's slot registers. A [`Slots`] value
//! holds the VM lock for its whole lifetime, so a sequence of slot operations
//! (write a handle, read an element, ...) cannot interleave with another
//! thread's use of the same VM.
//!
//! Slots are scratch space: every operation here starts writing at slot 0.
//! Inside a foreign method the arguments have already been read out by the
//! time host code runs, and the result is written to slot 0 last.

use crate::error::{Error, Result};
use crate::handle::{AsHandle, ForeignHandle, Handle, HandleRegistry, ListHandle, MapHandle};
use crate::value::Value;
use crate::vm::VmInner;
use parking_lot::ReentrantMutexGuard;
use quill_vm::c_api::{self, QuillHandle, QuillType, QuillVM};
use std::any::Any;
use std::ffi::{c_int, CString};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

/// Locked access to one VM's slots.
pub(crate) struct Slots<'a> {
    vm: &'a Arc<VmInner>,
    raw: *mut QuillVM,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> Slots<'a> {
    /// Lock the VM. Fails if it has been freed.
    pub(crate) fn new(vm: &'a Arc<VmInner>) -> Result<Self> {
        let guard = vm.lock.lock();
        let raw = vm.raw.load(Ordering::Acquire);
        if raw.is_null() {
            return Err(Error::VmAlreadyFreed);
        }
        Ok(Self {
            vm,
            raw,
            _guard: guard,
        })
    }

    pub(crate) fn raw(&self) -> *mut QuillVM {
        self.raw
    }

    pub(crate) fn vm(&self) -> &'a Arc<VmInner> {
        self.vm
    }

    pub(crate) fn count(&self) -> usize {
        unsafe { c_api::quill_get_slot_count(self.raw) }.max(0) as usize
    }

    pub(crate) fn ensure(&self, count: usize) {
        unsafe { c_api::quill_ensure_slots(self.raw, count as c_int) }
    }

    /// Encode `value` into `slot`.
    ///
    /// Handle values are checked before use: a released handle fails with
    /// [`Error::HandleReleased`] and a handle from another VM with
    /// [`Error::WrongVm`]. On failure the slot is set to null.
    pub(crate) fn write(&self, slot: usize, value: &Value) -> Result<()> {
        let index = slot as c_int;
        unsafe {
            match value {
                Value::Null => c_api::quill_set_slot_null(self.raw, index),
                Value::Bool(b) => c_api::quill_set_slot_bool(self.raw, index, *b),
                Value::Num(n) => c_api::quill_set_slot_double(self.raw, index, *n),
                Value::String(s) => self.write_bytes(index, s.as_bytes()),
                Value::Bytes(b) => self.write_bytes(index, b),
                Value::Handle(h) => self.write_handle(slot, h)?,
                Value::List(h) => self.write_handle(slot, h.handle())?,
                Value::Map(h) => self.write_handle(slot, h.handle())?,
                Value::Foreign(h) => self.write_handle(slot, h.handle())?,
            }
        }
        Ok(())
    }

    /// Encode any host value from the marshalable set. Anything else writes
    /// null and fails with [`Error::UnsupportedValue`].
    pub(crate) fn write_any<T: Any>(&self, slot: usize, value: &T) -> Result<()> {
        match Value::from_any(value) {
            Ok(value) => self.write(slot, &value),
            Err(err) => {
                warn!(slot, error = %err, "writing null for unsupported host value");
                unsafe { c_api::quill_set_slot_null(self.raw, slot as c_int) };
                Err(err)
            }
        }
    }

    unsafe fn write_bytes(&self, index: c_int, bytes: &[u8]) {
        c_api::quill_set_slot_bytes(self.raw, index, bytes.as_ptr().cast(), bytes.len());
    }

    pub(crate) fn write_handle(&self, slot: usize, handle: &Handle) -> Result<()> {
        match self.native_handle(handle) {
            Ok(native) => {
                unsafe { c_api::quill_set_slot_handle(self.raw, slot as c_int, native) };
                Ok(())
            }
            Err(err) => {
                unsafe { c_api::quill_set_slot_null(self.raw, slot as c_int) };
                Err(err)
            }
        }
    }

    /// The native pointer of a live handle owned by this VM.
    pub(crate) fn native_handle(&self, handle: &Handle) -> Result<*mut QuillHandle> {
        let native = handle.native()?;
        if handle.vm_id() != self.vm.id {
            return Err(Error::WrongVm);
        }
        Ok(native)
    }

    /// Decode `slot`. Objects other than strings come back as fresh handles.
    pub(crate) fn read(&self, slot: usize) -> Result<Value> {
        let index = slot as c_int;
        let value = unsafe {
            match c_api::quill_get_slot_type(self.raw, index) {
                QuillType::Null => Value::Null,
                QuillType::Bool => Value::Bool(c_api::quill_get_slot_bool(self.raw, index)),
                QuillType::Num => Value::Num(c_api::quill_get_slot_double(self.raw, index)),
                QuillType::String => {
                    let mut length: c_int = 0;
                    let data = c_api::quill_get_slot_bytes(self.raw, index, &mut length);
                    let bytes = if data.is_null() {
                        Vec::new()
                    } else {
                        let length = length.max(0) as usize;
                        std::slice::from_raw_parts(data.cast::<u8>(), length).to_vec()
                    };
                    match String::from_utf8(bytes) {
                        Ok(text) => Value::String(text),
                        Err(err) => Value::Bytes(err.into_bytes()),
                    }
                }
                QuillType::List => Value::List(ListHandle::new(self.handle_at(slot)?)),
                QuillType::Map => Value::Map(MapHandle::new(self.handle_at(slot)?)),
                QuillType::Foreign => {
                    let address = c_api::quill_get_slot_foreign(self.raw, index) as usize;
                    Value::Foreign(ForeignHandle::new(self.handle_at(slot)?, address))
                }
                QuillType::Unknown => Value::Handle(self.handle_at(slot)?),
            }
        };
        Ok(value)
    }

    /// Decode slots `from..count`.
    pub(crate) fn read_from(&self, from: usize) -> Result<Vec<Value>> {
        (from..self.count()).map(|slot| self.read(slot)).collect()
    }

    /// Register a new handle for the value in `slot`.
    pub(crate) fn handle_at(&self, slot: usize) -> Result<Handle> {
        let native = unsafe { c_api::quill_get_slot_handle(self.raw, slot as c_int) };
        if native.is_null() {
            return Err(Error::VmAlreadyFreed);
        }
        Ok(HandleRegistry::create(self.vm, native))
    }

    pub(crate) fn clear(&self, slots: std::ops::Range<usize>) {
        for slot in slots {
            unsafe { c_api::quill_set_slot_null(self.raw, slot as c_int) };
        }
    }

    /// Raise `message` as an error in the running fiber.
    pub(crate) fn abort(&self, message: &str) {
        self.ensure(1);
        unsafe {
            self.write_bytes(0, message.as_bytes());
            c_api::quill_abort_fiber(self.raw, 0);
        }
    }
}

/// A NUL-terminated copy of a name passed to the VM.
pub(crate) fn c_string(text: &str, what: &'static str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::InteriorNul { what })
}
