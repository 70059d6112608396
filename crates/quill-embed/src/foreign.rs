//! Foreign object table
//!
//! Maps the address of each guest-allocated foreign data block to the host
//! payload created by its class initializer. Entries are added when the
//! guest allocates a foreign object and removed when its collector (or VM
//! teardown) finalizes it. The table is process-wide because the finalize
//! callback receives only the address.

use crate::bindings::Finalizer;
use crate::error::{Error, Result};
use crate::vm::{VmContext, VmInner};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::sync::{Arc, LazyLock, Weak};
use tracing::{trace, warn};

/// A host payload shared between the table and any handles reading it.
pub type ForeignPayload = Arc<Mutex<Box<dyn Any + Send>>>;

struct ForeignEntry {
    payload: ForeignPayload,
    finalizer: Option<Finalizer>,
    vm_id: u64,
    owner: Weak<VmInner>,
}

static FOREIGN_TABLE: LazyLock<ForeignTable> = LazyLock::new(ForeignTable::new);

/// Address-keyed registry of foreign payloads.
pub struct ForeignTable {
    entries: RwLock<FxHashMap<usize, ForeignEntry>>,
}

impl ForeignTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// The table shared by every VM in the process.
    pub fn global() -> &'static ForeignTable {
        &FOREIGN_TABLE
    }

    /// Attach `payload` to the foreign object at `address`, created by `owner`.
    pub fn register(
        &self,
        address: usize,
        payload: Box<dyn Any + Send>,
        finalizer: Option<Finalizer>,
        owner: &VmContext,
    ) -> ForeignPayload {
        let payload = Arc::new(Mutex::new(payload));
        let vm_id = owner.id();
        let entry = ForeignEntry {
            payload: payload.clone(),
            finalizer,
            vm_id,
            owner: Arc::downgrade(owner.inner()),
        };
        if let Some(stale) = self.entries.write().insert(address, entry) {
            warn!(address, vm = stale.vm_id, "replaced a foreign object that was never finalized");
        }
        trace!(address, vm = vm_id, "foreign object registered");
        payload
    }

    pub fn lookup(&self, address: usize) -> Result<ForeignPayload> {
        self.entries
            .read()
            .get(&address)
            .map(|entry| entry.payload.clone())
            .ok_or(Error::UnknownForeignObject { address })
    }

    /// Remove the entry for `address` and run its finalizer on the payload.
    ///
    /// Returns false, doing nothing, if no entry exists. The finalizer is
    /// skipped if the owning VM no longer exists; the payload is dropped
    /// either way.
    pub fn finalize(&self, address: usize) -> bool {
        let Some(entry) = self.entries.write().remove(&address) else {
            warn!(address, "finalize called for an unknown foreign object");
            return false;
        };
        trace!(address, vm = entry.vm_id, "foreign object finalized");
        if let Some(finalizer) = entry.finalizer {
            match entry.owner.upgrade() {
                Some(owner) => {
                    let ctx = VmContext::from_inner(owner);
                    let mut payload = entry.payload.lock();
                    finalizer(&ctx, &mut **payload);
                }
                None => warn!(address, vm = entry.vm_id, "owning VM dropped before finalizer ran"),
            }
        }
        true
    }

    pub fn contains(&self, address: usize) -> bool {
        self.entries.read().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of live entries created by one VM.
    pub fn count_for_vm(&self, vm_id: u64) -> usize {
        self.entries.read().values().filter(|entry| entry.vm_id == vm_id).count()
    }
}

impl Default for ForeignTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::vm::Vm;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[test]
    fn test_register_lookup_finalize() {
        let vm = Vm::new(Config::new());
        let table = ForeignTable::new();
        table.register(0x1000, Box::new(41i64), None, &vm);

        let payload = table.lookup(0x1000).unwrap();
        *payload.lock().downcast_mut::<i64>().unwrap() += 1;
        assert_eq!(*table.lookup(0x1000).unwrap().lock().downcast_ref::<i64>().unwrap(), 42);

        assert!(table.finalize(0x1000));
        assert!(!table.contains(0x1000));
        assert!(matches!(
            table.lookup(0x1000),
            Err(Error::UnknownForeignObject { address: 0x1000 })
        ));
    }

    #[test]
    fn test_finalizer_sees_payload_once() {
        let vm = Vm::new(Config::new());
        let table = ForeignTable::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let owner = Arc::new(AtomicU64::new(0));
        let (counter, finalized_by) = (seen.clone(), owner.clone());
        let finalizer: Finalizer = Arc::new(move |ctx: &VmContext, payload: &mut (dyn Any + Send)| {
            let value = payload.downcast_ref::<String>().map_or(0, String::len);
            counter.fetch_add(value, Ordering::SeqCst);
            finalized_by.store(ctx.id(), Ordering::SeqCst);
        });
        table.register(0x2000, Box::new("four".to_string()), Some(finalizer), &vm);
        assert_eq!(table.count_for_vm(vm.id()), 1);

        assert!(table.finalize(0x2000));
        assert!(!table.finalize(0x2000));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(owner.load(Ordering::SeqCst), vm.id());
        assert!(table.is_empty());
    }

    #[test]
    fn test_finalizer_skipped_after_vm_dropped() {
        let table = ForeignTable::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let finalizer: Finalizer = Arc::new(move |_: &VmContext, _: &mut (dyn Any + Send)| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        {
            let vm = Vm::new(Config::new());
            table.register(0x3000, Box::new(1u8), Some(finalizer), &vm);
        }
        assert!(table.finalize(0x3000));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_registration() {
        let vm = Vm::new(Config::new());
        let table = Arc::new(ForeignTable::new());
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let table = table.clone();
                let ctx = vm.context();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let address = worker * 1000 + i;
                        table.register(address, Box::new(i), None, &ctx);
                        assert!(table.lookup(address).is_ok());
                        assert!(table.finalize(address));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
