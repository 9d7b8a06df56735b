//! C2 — the pointer pool (spec.md §4, component table): a fixed-capacity
//! free-list over free slots (or free pages), with `fill`/`alloc`/`free`
//! operations. Every pool instance is exclusively owned by one thread (a
//! mutator's per-type allocator, or one half of a heap-roots sub-pool), so
//! no internal locking is needed — the "no locks" half of the contract.

/// A fixed-capacity LIFO free list of `T` (usually raw slot addresses).
/// `fill` replaces the contents wholesale (e.g. when a fresh page's slots
/// are handed to the pool); `alloc`/`free` are plain push/pop.
pub struct SlotPool<T> {
    capacity: usize,
    free: Vec<T>,
}

impl<T> SlotPool<T> {
    pub fn new(capacity: usize) -> Self {
        SlotPool {
            capacity,
            free: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.len() == self.capacity
    }

    /// Take ownership of a fresh batch of free slots, discarding whatever
    /// was left (the caller is responsible for having drained it first).
    pub fn fill(&mut self, slots: impl IntoIterator<Item = T>) {
        self.free.clear();
        for slot in slots {
            if self.free.len() == self.capacity {
                break;
            }
            self.free.push(slot);
        }
    }

    pub fn alloc(&mut self) -> Option<T> {
        self.free.pop()
    }

    pub fn free(&mut self, slot: T) {
        debug_assert!(self.free.len() < self.capacity, "pool overfilled");
        self.free.push(slot);
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.free.drain(..)
    }
}
