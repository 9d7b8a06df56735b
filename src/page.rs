//! C1 — data page & block geometry, and pointer-to-page lookup (spec.md §4.1).
//!
//! A managed page is a fixed 4 KiB region whose base address is recoverable
//! from any interior pointer by masking. The first word at the base is a
//! back pointer: while the page sits empty it points at its owning `Block`
//! (see `block.rs`); once handed to an allocator it is overwritten with a
//! pointer to the page's `PageHeader` (see `page_meta.rs`).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::config::PAGE_SIZE;
use crate::util::align_down;

pub const PAGE_HEADER_WORD_SIZE: usize = std::mem::size_of::<usize>();
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_WORD_SIZE;

/// A fixed 4 KiB managed page. `back` is read/written by the allocators
/// that own the page at any given moment (`Block`, `ObjectPoolAllocator`,
/// `LargeObjectAllocator`); mutators never touch it directly.
#[repr(C)]
pub struct Page {
    back: AtomicPtr<()>,
    pub data: [u8; PAGE_DATA_SIZE],
}

impl Page {
    /// Compute the page base address for any interior pointer, per spec.md
    /// §4.1: `p & ~(PageSize-1)`.
    #[inline(always)]
    pub fn base_of(p: *const u8) -> *mut Page {
        align_down(p as usize, PAGE_SIZE) as *mut Page
    }

    /// Dereference the back-pointer word as whatever the caller asserts it
    /// currently holds. Safety: caller must know which phase of the page's
    /// lifecycle it is in (empty/owned-by-block vs. in-use/owned-by-header).
    #[inline(always)]
    pub unsafe fn back_ptr(&self) -> *mut () {
        self.back.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub unsafe fn set_back_ptr(&self, ptr: *mut ()) {
        self.back.store(ptr, Ordering::Release);
    }

    #[inline(always)]
    pub fn data_ptr(&self) -> NonNull<u8> {
        // Safety: `data` is a field of `self`, always non-null.
        unsafe { NonNull::new_unchecked(self.data.as_ptr() as *mut u8) }
    }
}
