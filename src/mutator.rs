//! C10 — the mutator (application thread) record (spec.md §3 "Mutator
//! Record", §4.7).
//!
//! Grounded on the teacher's `JlTLS`/per-thread `ThreadHeap` in
//! `c_interface.rs`/`gc2.rs`: one record per application thread, reachable
//! both from that thread (via a thread-local handle) and from the
//! collector thread (via a process-wide registry), since the collector
//! must be able to walk every mutator's root tables and object pools
//! without relying on thread-local access from a different OS thread.

use std::array;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::block::BlockAllocator;
use crate::error::GcError;
use crate::large_object::LargeObjectAllocator;
use crate::object_pool::ObjectPool;
use crate::roots::{heap_roots::HeapRootAllocator, init_stack_probe, stack_roots::StackRootTable};
use crate::type_info::TypeMetadata;

/// Width of one chunk of the per-type allocator cache (spec.md §4.7:
/// indexed by `type_index / 64, type_index % 64`).
const CHUNK_SIZE: usize = 64;

/// One application thread's full allocation and root-tracking state.
pub struct Mutator {
    pub allocated_bytes: AtomicUsize,
    pub allocated_objects: AtomicUsize,
    pools: RefCell<Vec<Option<Box<[Option<ObjectPool>; CHUNK_SIZE]>>>>,
    large: RefCell<LargeObjectAllocator>,
    pub stack_roots: RefCell<StackRootTable>,
    pub heap_roots: RefCell<HeapRootAllocator>,
    block_allocator: &'static BlockAllocator,
    /// `false` once this thread has exited (spec.md §3 "Mutator Record").
    /// Flipped by the thread-local destructor in `CURRENT`; the collector's
    /// `check_threads` (spec.md §4.9 step 1) drains and removes records
    /// once it observes this.
    is_used: AtomicBool,
    /// The slot address a `make_tracked` call on this thread is currently
    /// reserving, or 0 if none is in flight (spec.md §3 "recursive_alloc_
    /// pointer"). The collector compares this against the previous cycle's
    /// snapshot to detect a constructor that is itself recursively
    /// allocating and hasn't progressed — see `collector::check_threads`.
    recursive_alloc_pointer: AtomicUsize,
}

impl Mutator {
    fn new(block_allocator: &'static BlockAllocator) -> Self {
        init_stack_probe();
        Mutator {
            allocated_bytes: AtomicUsize::new(0),
            allocated_objects: AtomicUsize::new(0),
            pools: RefCell::new(Vec::new()),
            large: RefCell::new(LargeObjectAllocator::new()),
            stack_roots: RefCell::new(StackRootTable::default()),
            heap_roots: RefCell::new(HeapRootAllocator::new()),
            block_allocator,
            is_used: AtomicBool::new(true),
            recursive_alloc_pointer: AtomicUsize::new(0),
        }
    }

    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    /// Record that a `make_tracked` call on this thread is about to
    /// reserve/construct at `slot` (spec.md §4.7 step 2-3). Called by
    /// `tracked::make_tracked` before construction starts.
    pub fn begin_recursive_alloc_watch(&self, slot: *mut u8) {
        self.recursive_alloc_pointer
            .store(slot as usize, Ordering::Release);
    }

    /// Clear the watch once construction has finished, successfully or
    /// not (spec.md §4.7 steps 5-6).
    pub fn end_recursive_alloc_watch(&self) {
        self.recursive_alloc_pointer.store(0, Ordering::Release);
    }

    pub fn recursive_alloc_pointer(&self) -> usize {
        self.recursive_alloc_pointer.load(Ordering::Acquire)
    }

    /// Allocate one object of `meta`'s type through this thread's
    /// size-classed pool (spec.md §4.3, via this thread's cached
    /// `ObjectPool`).
    pub fn alloc(&self, meta: &'static TypeMetadata) -> Result<*mut u8, GcError> {
        let outer = meta.type_index as usize / CHUNK_SIZE;
        let inner = meta.type_index as usize % CHUNK_SIZE;
        let mut pools = self.pools.borrow_mut();
        if pools.len() <= outer {
            pools.resize_with(outer + 1, || None);
        }
        if pools[outer].is_none() {
            pools[outer] = Some(Box::new(array::from_fn(|_| None)));
        }
        let chunk = pools[outer].as_mut().unwrap();
        if chunk[inner].is_none() {
            chunk[inner] = Some(ObjectPool::new(meta));
        }
        let slot = chunk[inner].as_mut().unwrap().alloc(self.block_allocator)?;
        self.allocated_bytes
            .fetch_add(meta.object_size, Ordering::Relaxed);
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Allocate an oversize object/array through this thread's large-object
    /// allocator (spec.md §4.4).
    pub fn alloc_large(&self, meta: &'static TypeMetadata, count: usize) -> Result<*mut u8, GcError> {
        let slot = self
            .large
            .borrow_mut()
            .alloc(self.block_allocator, meta, count)?;
        self.allocated_bytes
            .fetch_add(meta.object_size.saturating_mul(count.max(1)), Ordering::Relaxed);
        self.allocated_objects.fetch_add(1, Ordering::Relaxed);
        Ok(slot)
    }

    /// Splice every per-type pool's remaining local free slots back onto
    /// their process-wide recycling stacks (spec.md §4.3 "on allocator
    /// destruction") — called when this mutator shuts down.
    pub fn drain_pools(&self) {
        let mut pools = self.pools.borrow_mut();
        for chunk in pools.iter_mut().flatten() {
            for slot in chunk.iter_mut() {
                if let Some(pool) = slot {
                    pool.drain_to_recycler();
                }
            }
        }
    }
}

/// Process-wide list of every mutator ever created, so the collector
/// thread can walk root tables and sweep pools that belong to other OS
/// threads (spec.md §4.9).
fn registry() -> &'static Mutex<Vec<Arc<Mutator>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<Mutator>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Thread-local holder for this thread's `Mutator`. Its `Drop` is the
/// thread-exit signal spec.md §3 describes ("is_used (false ⇒ thread is
/// exiting)"): the registry keeps its own `Arc` clone, so this slot being
/// dropped doesn't deallocate the record, it just flips the flag the
/// collector's `check_threads` watches for.
struct CurrentSlot(Option<Arc<Mutator>>);

impl Drop for CurrentSlot {
    fn drop(&mut self) {
        if let Some(m) = self.0.take() {
            m.is_used.store(false, Ordering::Release);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<CurrentSlot> = RefCell::new(CurrentSlot(None));
}

/// Get (lazily creating and registering) this thread's mutator record,
/// backed by the single process-wide block allocator (spec.md §9).
pub fn current() -> Arc<Mutator> {
    CURRENT.with(|cell| {
        if let Some(m) = cell.borrow().0.as_ref() {
            return m.clone();
        }
        let m = Arc::new(Mutator::new(crate::block::global()));
        registry().lock().unwrap().push(m.clone());
        cell.borrow_mut().0 = Some(m.clone());
        m
    })
}

/// Visit every mutator that has ever been created (spec.md §4.9
/// `check_threads`, `mark_roots`). Dead threads' records remain in the
/// registry — their pools/roots are still swept/scanned as usual since the
/// underlying pages may still hold live objects reachable from elsewhere.
pub fn for_each(mut f: impl FnMut(&Arc<Mutator>)) {
    for m in registry().lock().unwrap().iter() {
        f(m);
    }
}

pub fn live_count() -> usize {
    registry().lock().unwrap().len()
}

/// Drain every mutator record whose thread has exited (spec.md §4.9 step
/// 1 `check_threads`: "splice out records with `is_used=false`"),
/// invoking `on_dead` with each one's final counters before it is
/// dropped. The underlying pages and pools such a thread left behind are
/// unaffected: they stay reachable through the collector's own registered-
/// pages list (`page_meta::take_new_registrations`), never through the
/// mutator record.
pub fn drain_dead(mut on_dead: impl FnMut(&Arc<Mutator>)) {
    let mut reg = registry().lock().unwrap();
    let mut i = 0;
    while i < reg.len() {
        if !reg[i].is_used() {
            let dead = reg.swap_remove(i);
            on_dead(&dead);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_info::{registry as type_registry, DestroyFn};
    use std::any::TypeId;

    unsafe fn noop_destroy(_p: *mut u8) {}
    struct Widget;

    #[test]
    fn current_is_stable_within_a_thread() {
        std::thread::spawn(|| {
            let a = current();
            let b = current();
            assert!(Arc::ptr_eq(&a, &b));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn alloc_through_mutator_updates_counters() {
        let meta = type_registry()
            .get_or_register(TypeId::of::<Widget>(), "Widget", 24, 8, noop_destroy as DestroyFn)
            .unwrap();
        std::thread::spawn(move || {
            let m = current();
            let _ = m.alloc(meta).unwrap();
            assert_eq!(m.allocated_objects.load(Ordering::Relaxed), 1);
            assert_eq!(m.allocated_bytes.load(Ordering::Relaxed), 24);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn for_each_visits_every_registered_mutator() {
        let before = live_count();
        std::thread::spawn(|| {
            let _ = current();
        })
        .join()
        .unwrap();
        let mut seen = 0;
        for_each(|_| seen += 1);
        assert!(seen >= before + 1);
    }
}
