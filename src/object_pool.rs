//! C5 — the per-thread, per-type object-pool allocator (spec.md §4.3).
//!
//! Grounded on the teacher's `GcPool`/`pool_alloc`/`find_pool` in `gc2.rs`:
//! one pool per (mutator thread, size class), a packed `Vec` free list, and
//! pages carved lazily from the block allocator. Unlike the teacher, which
//! keeps a single process-wide `ThreadHeap` per OS thread and never shares
//! pages across threads, this pool additionally recycles fully-vacated
//! pages through a process-wide, per-type `SegQueue` (spec.md §4.3
//! `_pages_buffer`) so that a page freed by one mutator can be reused by
//! another of the same type without round-tripping through the block
//! allocator.

use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use crossbeam::queue::SegQueue;
use log::trace;

use crate::block::BlockAllocator;
use crate::error::GcError;
use crate::page_meta::PageHeader;
use crate::pool::SlotPool;
use crate::state::State;
use crate::type_info::TypeMetadata;

/// Process-wide recycling stacks, one per registered type, created lazily
/// and sized to `MAX_TYPE_NUMBER` up front so that publishing a page for
/// type `i` never requires taking a lock to grow the table.
struct PageRecyclers {
    queues: Vec<SegQueue<*mut PageHeader>>,
}

unsafe impl Send for PageRecyclers {}
unsafe impl Sync for PageRecyclers {}

fn recyclers() -> &'static PageRecyclers {
    static RECYCLERS: OnceLock<PageRecyclers> = OnceLock::new();
    RECYCLERS.get_or_init(|| {
        let mut queues = Vec::with_capacity(crate::config::MAX_TYPE_NUMBER as usize);
        queues.resize_with(crate::config::MAX_TYPE_NUMBER as usize, SegQueue::new);
        PageRecyclers { queues }
    })
}

/// Hand a fully- or partially-vacated page back for reuse by any mutator
/// allocating the same type. Exposed crate-wide so the collector's sweep
/// (spec.md §4.9 `remove_garbage`) can forward a page it swept straight
/// back into circulation without going through an `ObjectPool` instance.
pub(crate) fn push_recycled(type_index: u32, header: *mut PageHeader) {
    recyclers().queues[type_index as usize].push(header);
}

/// Take a recycled page for `type_index`, if one is waiting.
fn pop_recycled(type_index: u32) -> Option<*mut PageHeader> {
    recyclers().queues[type_index as usize].pop()
}

/// A per-(thread, type) allocator (spec.md §4.3). Not `Sync`: each mutator
/// owns its own instance per type it has allocated, keyed by
/// `TypeMetadata::type_index` in the mutator record (§4.7).
pub struct ObjectPool {
    meta: &'static TypeMetadata,
    local_free: SlotPool<*mut u8>,
    active_page: Option<*mut PageHeader>,
    /// Every page this instance has ever carved or recycled-in, kept so the
    /// collector can be handed the full set at sweep time.
    owned_pages: Vec<*mut PageHeader>,
}

impl ObjectPool {
    pub fn new(meta: &'static TypeMetadata) -> Self {
        ObjectPool {
            meta,
            local_free: SlotPool::new(meta.object_count_per_page),
            active_page: None,
            owned_pages: Vec::new(),
        }
    }

    /// Slot addresses are the object base addresses of every `Unused` slot
    /// on `header` (spec.md §4.1 "free_count"/state map).
    fn free_slots_of(header: &PageHeader) -> Vec<*mut u8> {
        (0..header.object_count)
            .filter(|&i| header.state_of(i).is_unused())
            .map(|i| unsafe { header.data.add(i * header.object_size) as *mut u8 })
            .collect()
    }

    /// Allocate one slot of this pool's type (spec.md §4.3 algorithm):
    /// local free list, then the process-wide per-type recycling stack,
    /// then a freshly-carved page from the block allocator.
    pub fn alloc(&mut self, block_allocator: &BlockAllocator) -> Result<*mut u8, GcError> {
        if let Some(slot) = self.local_free.alloc() {
            self.note_taken();
            return Ok(slot);
        }

        if let Some(header) = pop_recycled(self.meta.type_index) {
            let slots = unsafe { Self::free_slots_of(&*header) };
            self.local_free.fill(slots);
            self.active_page = Some(header);
            self.owned_pages.push(header);
            if let Some(slot) = self.local_free.alloc() {
                self.note_taken();
                return Ok(slot);
            }
        }

        let header = block_allocator.alloc_page_for(
            self.meta.object_size,
            self.meta.object_count_per_page,
            false,
        )?;
        unsafe {
            (*header)
                .type_meta
                .store(self.meta as *const TypeMetadata as *mut TypeMetadata, Ordering::Release);
        }
        trace!(
            "carved new page for type {} ({} objects of {} bytes)",
            self.meta.name, self.meta.object_count_per_page, self.meta.object_size
        );
        let slots = unsafe { Self::free_slots_of(&*header) };
        self.local_free.fill(slots);
        self.active_page = Some(header);
        self.owned_pages.push(header);

        let slot = self
            .local_free
            .alloc()
            .ok_or(GcError::AllocationExhausted {
                requested: self.meta.object_size,
                source: std::io::Error::new(std::io::ErrorKind::Other, "freshly carved page reports no free slots"),
            })?;
        self.note_taken();
        Ok(slot)
    }

    /// Record that one slot of `active_page` just left the `Unused` state,
    /// keeping `PageHeader::free_count` accurate for the collector's
    /// `is_empty` check at sweep time (spec.md §4.2/§4.3).
    fn note_taken(&self) {
        if let Some(header) = self.active_page {
            let previous = unsafe { (*header).free_count.fetch_sub(1, Ordering::AcqRel) };
            crate::util::memfence_check!(previous > 0, "free_count underflowed on a {} page", self.meta.name);
        }
    }

    /// Splice every slot this allocator currently holds locally back onto
    /// its page's recycling stack (used when the mutator that owns this
    /// pool shuts down — spec.md §4.3 "on allocator destruction").
    pub fn drain_to_recycler(&mut self) {
        for slot in self.local_free.drain() {
            if let Some(header) = self.active_page {
                let header_ref = unsafe { &*header };
                let idx = header_ref.index_of(slot);
                header_ref.set_state(idx, State::UNUSED);
            }
        }
        for &header in &self.owned_pages {
            push_recycled(self.meta.type_index, header);
        }
        self.owned_pages.clear();
        self.active_page = None;
    }

    pub fn owned_page_count(&self) -> usize {
        self.owned_pages.len()
    }

}
