//! VM registry
//!
//! Maps each live native VM pointer to its host-side state so that callbacks,
//! which only receive the native pointer, can find their VM. Entries are added
//! right after the native VM is created and removed before it is freed; a
//! callback arriving outside that window finds nothing and does nothing.

use crate::vm::VmInner;
use parking_lot::RwLock;
use quill_vm::c_api::QuillVM;
use rustc_hash::FxHashMap;
use std::sync::{Arc, LazyLock, Weak};
use tracing::debug;

static VM_REGISTRY: LazyLock<RwLock<VmRegistry>> = LazyLock::new(|| RwLock::new(VmRegistry::new()));

/// Native VM pointer → host VM state.
pub(crate) struct VmRegistry {
    vms: FxHashMap<usize, Weak<VmInner>>,
}

impl VmRegistry {
    pub(crate) fn new() -> Self {
        Self {
            vms: FxHashMap::default(),
        }
    }

    pub(crate) fn register(&mut self, raw: *mut QuillVM, vm: &Arc<VmInner>) {
        self.vms.insert(raw as usize, Arc::downgrade(vm));
    }

    pub(crate) fn unregister(&mut self, raw: *mut QuillVM) -> bool {
        self.vms.remove(&(raw as usize)).is_some()
    }

    pub(crate) fn lookup(&self, raw: *mut QuillVM) -> Option<Arc<VmInner>> {
        self.vms.get(&(raw as usize)).and_then(Weak::upgrade)
    }

    pub(crate) fn len(&self) -> usize {
        self.vms.len()
    }
}

pub(crate) fn register(raw: *mut QuillVM, vm: &Arc<VmInner>) {
    VM_REGISTRY.write().register(raw, vm);
    debug!(vm = vm.id, "registered VM");
}

pub(crate) fn unregister(raw: *mut QuillVM) {
    if VM_REGISTRY.write().unregister(raw) {
        debug!(native = ?raw, "unregistered VM");
    }
}

/// The VM owning `raw`, if it is still registered.
pub(crate) fn lookup(raw: *mut QuillVM) -> Option<Arc<VmInner>> {
    VM_REGISTRY.read().lookup(raw)
}

/// Number of VMs currently registered in this process.
pub fn live_vm_count() -> usize {
    VM_REGISTRY.read().len()
}
