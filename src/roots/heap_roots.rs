//! C8 — the heap-roots allocator (spec.md §3, §4.5).
//!
//! A heap root is a tracked-pointer cell that lives in memory the collector
//! doesn't otherwise scan (a `malloc`'d or `Box`-owned struct, a `static`)
//! and isn't an embedded field discovered via `type_info`'s offset
//! discovery either. Each thread owns a small working set of fixed-capacity
//! sub-pools and allocates from whichever one has room, favouring the most
//! recently used (the common case is a single active sub-pool, which keeps
//! alloc/free amortised O(1) exactly as spec.md §4.5 describes); the
//! collector scans every sub-pool a thread owns. A sub-pool is only ever
//! handed back to the process-wide reserve once its own occupancy count
//! reaches zero — never while it might still hold a live root — so a
//! sub-pool that fills up while an older one is still occupied grows the
//! thread's working set instead of silently discarding the older one's
//! contents. Retired (emptied) sub-pools are recycled through a
//! process-wide, lock-free free/reserve list (`crossbeam::queue::SegQueue`,
//! spec.md §4.5/§5 "lock-free (CAS on a Treiber stack)") so threads don't
//! need to `mmap` a fresh sub-pool on every growth.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam::queue::SegQueue;

/// Capacity of one sub-pool, in root slots.
pub const SUBPOOL_CAPACITY: usize = 512;

/// One fixed-capacity array of heap-root slots. `slots[i]` is null when
/// unoccupied. `occupied` is an exact count of non-null slots, kept so a
/// sub-pool's emptiness can be checked in O(1) instead of rescanning it.
pub struct SubPool {
    slots: Box<[AtomicPtr<()>]>,
    occupied: AtomicUsize,
}

impl SubPool {
    fn new() -> Self {
        let mut v = Vec::with_capacity(SUBPOOL_CAPACITY);
        v.resize_with(SUBPOOL_CAPACITY, || AtomicPtr::new(std::ptr::null_mut()));
        SubPool {
            slots: v.into_boxed_slice(),
            occupied: AtomicUsize::new(0),
        }
    }

    fn clear(&self) {
        for s in self.slots.iter() {
            s.store(std::ptr::null_mut(), Ordering::Release);
        }
        self.occupied.store(0, Ordering::Release);
    }

    fn is_empty(&self) -> bool {
        self.occupied.load(Ordering::Acquire) == 0
    }

    /// Find the first free slot and occupy it with `cell_addr`. Returns
    /// `false` if the sub-pool is full.
    fn try_register(&self, cell_addr: *const ()) -> bool {
        for slot in self.slots.iter() {
            if slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    cell_addr as *mut (),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.occupied.fetch_add(1, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    /// Returns `true` if `cell_addr` was found (and removed) in this
    /// sub-pool.
    fn unregister(&self, cell_addr: *const ()) -> bool {
        for slot in self.slots.iter() {
            if slot
                .compare_exchange(
                    cell_addr as *mut (),
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.occupied.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
        }
        false
    }

    pub fn for_each(&self, mut f: impl FnMut(*const ())) {
        for slot in self.slots.iter() {
            let p = slot.load(Ordering::Acquire);
            if !p.is_null() {
                f(p as *const ());
            }
        }
    }
}

/// Process-wide free/reserve list of retired sub-pools (spec.md §4.5).
fn reserve() -> &'static SegQueue<Box<SubPool>> {
    static RESERVE: OnceLock<SegQueue<Box<SubPool>>> = OnceLock::new();
    RESERVE.get_or_init(SegQueue::new)
}

fn take_subpool() -> Box<SubPool> {
    reserve().pop().unwrap_or_else(|| Box::new(SubPool::new()))
}

fn release_subpool(pool: Box<SubPool>) {
    pool.clear();
    reserve().push(pool);
}

/// A single thread's heap-roots allocator: a small working set of
/// sub-pools, grown on demand and shrunk back to the reserve only once a
/// sub-pool genuinely empties out.
pub struct HeapRootAllocator {
    /// Most-recently-allocated-from pool is always last, so the common
    /// case (room in the current pool) is an O(1) check of the tail.
    pools: Vec<Box<SubPool>>,
}

impl HeapRootAllocator {
    pub fn new() -> Self {
        HeapRootAllocator {
            pools: vec![take_subpool()],
        }
    }

    /// Register `cell_addr`. Tries the most recently used sub-pool first
    /// (the amortised O(1) fast path); if every existing sub-pool is full,
    /// grows the working set with a fresh one from the process-wide
    /// reserve rather than discarding any sub-pool's existing occupants
    /// (spec.md §4.5: "empty sub-pools are returned to a global free
    /// list" — never *occupied* ones).
    pub fn register(&mut self, cell_addr: *const ()) {
        if let Some(last) = self.pools.last() {
            if last.try_register(cell_addr) {
                return;
            }
        }
        for pool in self.pools.iter() {
            if pool.try_register(cell_addr) {
                return;
            }
        }
        let fresh = take_subpool();
        let ok = fresh.try_register(cell_addr);
        debug_assert!(ok, "freshly reserved sub-pool must have room");
        self.pools.push(fresh);
    }

    /// Unregister `cell_addr` and, if that leaves its sub-pool empty and
    /// there is more than one pool in the working set, return that
    /// now-empty sub-pool to the process-wide reserve immediately (spec.md
    /// §4.5).
    pub fn unregister(&mut self, cell_addr: *const ()) {
        let mut emptied_index = None;
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.unregister(cell_addr) {
                if pool.is_empty() {
                    emptied_index = Some(i);
                }
                break;
            }
        }
        if let Some(i) = emptied_index {
            if self.pools.len() > 1 {
                let retiring = self.pools.remove(i);
                release_subpool(retiring);
            }
        }
    }

    /// Visit every occupied slot across every sub-pool this thread owns
    /// (spec.md §4.9 `mark_roots`).
    pub fn for_each(&self, mut f: impl FnMut(*const ())) {
        for pool in self.pools.iter() {
            pool.for_each(&mut f);
        }
    }
}

impl Default for HeapRootAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeapRootAllocator {
    fn drop(&mut self) {
        for pool in self.pools.drain(..) {
            release_subpool(pool);
        }
    }
}
