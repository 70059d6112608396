//! Object arena and mark-sweep collector.
//!
//! Collections only run at idle safepoints (between top-level interpret and
//! call invocations), so the interpreter never has to root values held on the
//! Rust stack. The roots are module variables, API slots, live handles and the
//! core classes; everything else must be reachable from them.

use crate::c_api::QuillFinalizerFn;
use crate::value::{Env, Obj, ObjId, Value};
use rustc_hash::FxHashSet;
use std::mem::size_of;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

struct Entry {
    obj: Obj,
    marked: bool,
    size: usize,
}

/// A foreign object's finalizer, to be invoked once the heap borrow is released.
pub struct PendingFinalizer {
    pub finalize: QuillFinalizerFn,
    pub data: Box<[u64]>,
}

impl PendingFinalizer {
    /// Runs the host finalizer with the object's data pointer.
    ///
    /// # Safety
    /// The finalizer must be a valid function supplied by the host.
    pub unsafe fn run(mut self) {
        (self.finalize)(self.data.as_mut_ptr().cast());
    }
}

/// Heap sizing knobs, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

pub struct Heap {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    config: HeapConfig,
}

fn approximate_size(obj: &Obj) -> usize {
    size_of::<Entry>()
        + match obj {
            Obj::String(bytes) => bytes.len(),
            Obj::List(items) => items.len() * size_of::<Value>(),
            Obj::Map(map) => map.len() * 64,
            Obj::Instance(instance) => instance.fields.len() * 48,
            Obj::Foreign(foreign) => foreign.data.len() * 8,
            Obj::Class(class) => (class.methods.len() + class.static_methods.len()) * 64,
            _ => 0,
        }
}

impl Heap {
    pub fn new(config: HeapConfig) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_heap_size.max(config.min_heap_size),
            config,
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        let size = approximate_size(&obj);
        self.bytes_allocated += size;
        let entry = Some(Entry {
            obj,
            marked: false,
            size,
        });
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = entry;
                ObjId(index)
            }
            None => {
                self.entries.push(entry);
                ObjId((self.entries.len() - 1) as u32)
            }
        }
    }

    pub fn contains(&self, id: ObjId) -> bool {
        matches!(self.entries.get(id.index()), Some(Some(_)))
    }

    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Marks everything reachable from `roots`, frees the rest and returns the
    /// finalizers of any foreign objects that died.
    pub fn collect(&mut self, roots: &[Value]) -> Vec<PendingFinalizer> {
        let mut gray: Vec<ObjId> = roots.iter().filter_map(|v| v.as_obj()).collect();
        let mut seen_envs: FxHashSet<*const Env> = FxHashSet::default();

        while let Some(id) = gray.pop() {
            let Some(Some(entry)) = self.entries.get_mut(id.index()) else {
                continue;
            };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            trace_children(&entry.obj, &mut gray, &mut seen_envs);
        }

        let finalizers = self.sweep();
        self.next_gc = (self.bytes_allocated * (100 + self.config.heap_growth_percent) / 100)
            .max(self.config.min_heap_size);
        finalizers
    }

    fn sweep(&mut self) -> Vec<PendingFinalizer> {
        // Finalizers are looked up first: a dead object's class may die in the same pass.
        let mut doomed_finalizers = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(Entry {
                obj: Obj::Foreign(foreign),
                marked: false,
                ..
            }) = entry
            {
                if let Some(Some(Entry {
                    obj: Obj::Class(class),
                    ..
                })) = self.entries.get(foreign.class.index())
                {
                    if let Some(finalize) = class.finalize {
                        doomed_finalizers.push((index, finalize));
                    }
                }
            }
        }

        let mut pending = Vec::new();
        let mut finalizers = doomed_finalizers.into_iter().peekable();
        for index in 0..self.entries.len() {
            let dead = matches!(&self.entries[index], Some(entry) if !entry.marked);
            if let Some(entry) = self.entries[index].as_mut() {
                entry.marked = false;
            }
            if !dead {
                continue;
            }
            let Some(entry) = self.entries[index].take() else {
                continue;
            };
            self.bytes_allocated = self.bytes_allocated.saturating_sub(entry.size);
            self.free.push(index as u32);
            if finalizers.peek().map(|(i, _)| *i) == Some(index) {
                let next = finalizers.next();
                if let (Some((_, finalize)), Obj::Foreign(foreign)) = (next, entry.obj) {
                    pending.push(PendingFinalizer {
                        finalize,
                        data: foreign.data,
                    });
                }
            }
        }
        pending
    }

    /// Empties the heap, returning every outstanding foreign finalizer.
    pub fn teardown(&mut self) -> Vec<PendingFinalizer> {
        let collected = self.collect(&[]);
        self.entries.clear();
        self.free.clear();
        self.bytes_allocated = 0;
        collected
    }
}

fn push_value(value: &Value, gray: &mut Vec<ObjId>) {
    if let Value::Obj(id) = value {
        gray.push(*id);
    }
}

fn trace_env(env: &Option<Rc<Env>>, gray: &mut Vec<ObjId>, seen: &mut FxHashSet<*const Env>) {
    let mut current = env.clone();
    while let Some(scope) = current {
        if !seen.insert(Rc::as_ptr(&scope)) {
            break;
        }
        for value in scope.vars.borrow().values() {
            push_value(value, gray);
        }
        current = scope.parent.clone();
    }
}

fn trace_children(obj: &Obj, gray: &mut Vec<ObjId>, seen: &mut FxHashSet<*const Env>) {
    match obj {
        Obj::String(_) | Obj::Range(_) => {}
        Obj::List(items) => items.iter().for_each(|v| push_value(v, gray)),
        Obj::Map(map) => {
            for (key, value) in map.values() {
                push_value(key, gray);
                push_value(value, gray);
            }
        }
        Obj::Instance(instance) => {
            gray.push(instance.class);
            instance.fields.values().for_each(|v| push_value(v, gray));
        }
        Obj::Class(class) => {
            if let Some(superclass) = class.superclass {
                gray.push(superclass);
            }
            class.static_fields.values().for_each(|v| push_value(v, gray));
        }
        Obj::Foreign(foreign) => gray.push(foreign.class),
        Obj::Fn(function) => {
            if let Some(this) = &function.closure.this {
                push_value(this, gray);
            }
            if let Some(class) = function.closure.class {
                gray.push(class);
            }
            trace_env(&function.closure.env, gray, seen);
        }
        Obj::Fiber(fiber) => {
            gray.push(fiber.func);
            push_value(&fiber.error, gray);
        }
    }
}

impl Index<ObjId> for Heap {
    type Output = Obj;

    fn index(&self, id: ObjId) -> &Obj {
        &self.entries[id.index()]
            .as_ref()
            .expect("object id refers to a collected object")
            .obj
    }
}

impl IndexMut<ObjId> for Heap {
    fn index_mut(&mut self, id: ObjId) -> &mut Obj {
        &mut self.entries[id.index()]
            .as_mut()
            .expect("object id refers to a collected object")
            .obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ClassObj;

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut heap = Heap::new(HeapConfig::default());
        let kept = heap.alloc(Obj::String(b"kept".to_vec()));
        let list = heap.alloc(Obj::List(vec![Value::Obj(kept)]));
        let dropped = heap.alloc(Obj::String(b"dropped".to_vec()));

        let finalizers = heap.collect(&[Value::Obj(list)]);
        assert!(finalizers.is_empty());
        assert!(heap.contains(kept));
        assert!(heap.contains(list));
        assert!(!heap.contains(dropped));
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut heap = Heap::new(HeapConfig::default());
        let first = heap.alloc(Obj::String(Vec::new()));
        heap.collect(&[]);
        let second = heap.alloc(Obj::String(Vec::new()));
        assert_eq!(first, second);
        assert_eq!(heap.live_objects(), 1);
    }

    unsafe extern "C" fn count_finalize(data: *mut std::ffi::c_void) {
        *(data as *mut u64) += 1;
    }

    #[test]
    fn test_dead_foreign_objects_yield_finalizers() {
        let mut heap = Heap::new(HeapConfig::default());
        let mut class = ClassObj::new("Thing", None);
        class.is_foreign = true;
        class.finalize = Some(count_finalize);
        let class = heap.alloc(Obj::Class(class));
        heap.alloc(Obj::Foreign(crate::value::ForeignObj {
            class,
            data: vec![41u64].into_boxed_slice(),
        }));

        let mut finalizers = heap.collect(&[]);
        assert_eq!(finalizers.len(), 1);
        let pending = finalizers.remove(0);
        let data_ptr = pending.data.as_ptr();
        unsafe {
            assert_eq!(*data_ptr, 41);
            pending.run();
        }
        assert_eq!(heap.live_objects(), 0);
    }
}
