//! C6 — the large-object allocator (spec.md §4.4): one object per page,
//! for objects (or arrays) too big to fit a size-classed pool slot.
//!
//! Grounded on the teacher's `BigVal`/`big_alloc` in `gc2.rs`, stripped of
//! the generational young/old list bookkeeping (out of scope per spec.md's
//! Non-goals on generational collection) down to the one property spec.md
//! §4.4 actually asks for: a direct, page-granular allocation that frees
//! straight back to the block allocator rather than through a recycling
//! stack (a single large object rarely has a same-size sibling to hand a
//! vacated page to).

use std::sync::atomic::Ordering;

use log::trace;

use crate::block::BlockAllocator;
use crate::error::GcError;
use crate::page::PAGE_DATA_SIZE;
use crate::page_meta::PageHeader;
use crate::state::State;
use crate::type_info::TypeMetadata;

/// Per-thread bookkeeping of this mutator's own large-object pages, so the
/// collector can be handed the full set at sweep time (spec.md §4.4).
pub struct LargeObjectAllocator {
    pages: Vec<*mut PageHeader>,
}

impl LargeObjectAllocator {
    pub fn new() -> Self {
        LargeObjectAllocator { pages: Vec::new() }
    }

    /// Allocate storage for one oversize object of `meta`'s type, `count`
    /// contiguous elements wide (`count == 1` for a plain large object; an
    /// array uses `count` > 1). Rather than inventing a separate array
    /// element metadata type, this models the page exactly like an
    /// object-pool page with `count` slots of `meta.object_size` stride
    /// each — the existing per-slot `State`/`registered`/`marked`/
    /// `reachable` bitmaps then let the collector's mark/sweep walk a
    /// large-object page the same way it walks an ordinary one, iterating
    /// `0..object_count` (see DESIGN.md). A single object is capped at one
    /// page's data region, matching the fixed 4 KiB page geometry (spec.md
    /// §4.1) — this crate does not support objects spanning multiple
    /// pages.
    pub fn alloc(
        &mut self,
        block_allocator: &BlockAllocator,
        meta: &'static TypeMetadata,
        count: usize,
    ) -> Result<*mut u8, GcError> {
        // A count-0 array still needs one backing slot so that its handle
        // is a valid, non-null address (spec.md §8 boundary behaviour) —
        // the slot itself is simply left `Unused`, so it carries no live
        // elements and the collector never marks or destroys it.
        let page_slots = count.max(1);
        let total = meta.object_size.saturating_mul(page_slots);
        if total > PAGE_DATA_SIZE {
            return Err(GcError::AllocationExhausted {
                requested: total,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "object exceeds one page; multi-page large objects are unsupported",
                ),
            });
        }

        let header = block_allocator.alloc_page_for(meta.object_size, page_slots, true)?;
        unsafe {
            (*header)
                .type_meta
                .store(meta as *const TypeMetadata as *mut TypeMetadata, Ordering::Release);
            for i in 0..count {
                (*header).set_state(i, State::USED);
            }
        }
        trace!(
            "carved large-object page for type {} ({} bytes, {} elements)",
            meta.name, total, count
        );
        self.pages.push(header);
        Ok(unsafe { (*header).data as *mut u8 })
    }

    /// Hand every page in `dead` straight back to the block allocator
    /// (spec.md §4.4: no recycling stack for large objects) and drop its
    /// own record of them.
    pub fn free(&mut self, block_allocator: &BlockAllocator, dead: Vec<*mut PageHeader>) {
        let dead_set: std::collections::HashSet<*mut PageHeader> = dead.iter().copied().collect();
        self.pages.retain(|p| !dead_set.contains(p));
        block_allocator.free_headers(dead);
    }

    pub fn live_page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[*mut PageHeader] {
        &self.pages
    }
}

impl Default for LargeObjectAllocator {
    fn default() -> Self {
        Self::new()
    }
}
