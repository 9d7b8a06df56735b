//! C4 — page metadata and the state map (spec.md §3, §4.1).
//!
//! `PageHeader` is allocated separately from the `Page` it describes
//! (teacher's `PageMeta` in `gc.rs` follows the same split). It owns the
//! per-slot state array and the two collector-owned bitmaps, plus the
//! multiplier used to compute a slot index from an interior pointer without
//! a division on the hot path.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::block::Block;
use crate::page::Page;
use crate::state::{State, StateCell};
use crate::type_info::TypeMetadata;

/// Number of `u64` words needed to hold one bit per object.
#[inline(always)]
pub fn bitmap_words(object_count: usize) -> usize {
    (object_count + 63) / 64
}

pub struct Bitmap {
    words: Box<[AtomicU64]>,
}

impl Bitmap {
    pub fn new(object_count: usize) -> Self {
        let n = bitmap_words(object_count);
        let mut v = Vec::with_capacity(n);
        v.resize_with(n, || AtomicU64::new(0));
        Bitmap {
            words: v.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> bool {
        let word = self.words[index / 64].load(Ordering::Acquire);
        (word >> (index % 64)) & 1 != 0
    }

    #[inline(always)]
    pub fn set(&self, index: usize, value: bool) {
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64].fetch_or(mask, Ordering::AcqRel);
        } else {
            self.words[index / 64].fetch_and(!mask, Ordering::AcqRel);
        }
    }

    /// Atomically set the bit and report whether it was already set.
    #[inline(always)]
    pub fn test_and_set(&self, index: usize) -> bool {
        let mask = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_or(mask, Ordering::AcqRel);
        (prev & mask) != 0
    }

    pub fn clear_all(&self) {
        for w in self.words.iter() {
            w.store(0, Ordering::Relaxed);
        }
    }

    /// Iterate set bit indices up to `object_count`.
    pub fn iter_set(&self, object_count: usize) -> impl Iterator<Item = usize> + '_ {
        (0..object_count).filter(move |&i| self.get(i))
    }

    pub fn any_set(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Relaxed) != 0)
    }
}

/// Per-page metadata record (spec.md §3 "Page"). Lives for as long as the
/// page itself is in rotation; `type_meta` is written once (on first use)
/// and never changes afterwards.
pub struct PageHeader {
    pub type_meta: AtomicPtr<TypeMetadata>,
    /// Interior base of the object region (== the owning `Page`'s `data`).
    pub data: *const u8,
    /// `(1<<32 | 0x10000) / object_size`, see `index_of`.
    pub multiplier: u64,
    pub object_size: usize,
    pub object_count: usize,
    pub states: Box<[StateCell]>,
    pub registered: Bitmap,
    pub marked: Bitmap,
    /// Grey worklist: objects pending child-scan during `mark_reachable`.
    pub reachable: Bitmap,
    /// Owning block, set once at carve time (see DESIGN.md open question).
    pub owner: AtomicPtr<Block>,
    /// All pages ever carved for one type (object-pool allocator's list).
    pub next: AtomicPtr<PageHeader>,
    /// Recycling list (per-type empty-ish page stack).
    pub next_empty: AtomicPtr<PageHeader>,
    /// Collector's working list of all pages it has ever registered.
    pub next_registered: AtomicPtr<PageHeader>,
    /// Collector's grey stack, page-granular.
    pub next_reachable: AtomicPtr<PageHeader>,
    /// Number of slots currently `Unused`, maintained by the owning
    /// allocator to decide when a page can be forwarded to the block
    /// allocator's empty list.
    pub free_count: AtomicUsize,
    pub owning_page: *const Page,
    /// One object per page, carved by the large-object allocator (spec.md
    /// §4.4) rather than the per-type object pool — swept pages of this
    /// kind go straight back to the block allocator, never to a per-type
    /// recycling stack (there is rarely a same-size sibling to hand a
    /// vacated large-object page to).
    pub is_large: bool,
    /// Set while this page sits on the collector's grey stack (spec.md's
    /// page-granular `_reachable_pages`), so `mark` doesn't queue the same
    /// page twice while it is still pending a `mark_reachable` drain.
    pub in_reachable_stack: AtomicBool,
}

// Safety: all mutable state is behind atomics; raw pointers (`data`,
// `owning_page`) are only ever read, never written after construction.
unsafe impl Send for PageHeader {}
unsafe impl Sync for PageHeader {}

impl PageHeader {
    pub fn new(
        owning_page: &Page,
        owner: *mut Block,
        object_size: usize,
        object_count: usize,
        is_large: bool,
    ) -> Box<PageHeader> {
        let multiplier = compute_multiplier(object_size);
        let mut states = Vec::with_capacity(object_count);
        states.resize_with(object_count, || StateCell::new(State::UNUSED));
        Box::new(PageHeader {
            type_meta: AtomicPtr::new(std::ptr::null_mut()),
            data: owning_page.data_ptr().as_ptr(),
            multiplier,
            object_size,
            object_count,
            states: states.into_boxed_slice(),
            registered: Bitmap::new(object_count),
            marked: Bitmap::new(object_count),
            reachable: Bitmap::new(object_count),
            owner: AtomicPtr::new(owner),
            next: AtomicPtr::new(std::ptr::null_mut()),
            next_empty: AtomicPtr::new(std::ptr::null_mut()),
            next_registered: AtomicPtr::new(std::ptr::null_mut()),
            next_reachable: AtomicPtr::new(std::ptr::null_mut()),
            free_count: AtomicUsize::new(object_count),
            owning_page: owning_page as *const Page,
            is_large,
            in_reachable_stack: AtomicBool::new(false),
        })
    }

    /// Slot index containing interior pointer `p`, computed without
    /// division (spec.md §4.1 rationale).
    #[inline(always)]
    pub fn index_of(&self, p: *const u8) -> usize {
        let offset = (p as usize).wrapping_sub(self.data as usize) as u64;
        ((offset as u128 * self.multiplier as u128) >> 32) as usize
    }

    #[inline(always)]
    pub fn base_address_of(&self, p: *const u8) -> *const u8 {
        let idx = self.index_of(p);
        unsafe { self.data.add(idx * self.object_size) }
    }

    #[inline(always)]
    pub fn set_state(&self, index: usize, state: State) {
        crate::util::memfence_check!(
            index < self.object_count,
            "slot index {index} out of bounds for a {}-slot page",
            self.object_count
        );
        self.states[index].store(state, Ordering::Release);
    }

    #[inline(always)]
    pub fn state_of(&self, index: usize) -> State {
        self.states[index].load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.free_count.load(Ordering::Acquire) == self.object_count
    }
}

/// Process-wide, append-only list of every page ever carved, threaded
/// through each header's own `next_registered` word (spec.md §5: "Page
/// registration is append-only and published by release store on an
/// atomic list head; the collector reads by acquire"). A page links
/// itself in once, at creation (`block::install_header`), regardless of
/// which mutator or per-type pool ends up using it — so the collector's
/// `_registered_pages` walk (spec.md §4.9 step 3) never depends on any
/// particular allocator's bookkeeping still being reachable.
static REGISTERED_PAGES: AtomicPtr<PageHeader> = AtomicPtr::new(std::ptr::null_mut());

/// Publish `header` onto the global registered-pages list. Safe to call
/// concurrently from any number of mutator threads.
pub fn register_globally(header: *mut PageHeader) {
    loop {
        let head = REGISTERED_PAGES.load(Ordering::Acquire);
        unsafe { (*header).next_registered.store(head, Ordering::Relaxed) };
        if REGISTERED_PAGES
            .compare_exchange(head, header, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
    }
}

/// Atomically detach the entire chain of pages appended since the last
/// call (spec.md §5: "the collector... detaches dead pages with a CAS
/// that linearises with new appends"). Only the collector thread calls
/// this — it folds the returned chain into its own private page list,
/// which it alone may remove entries from once a page is fully
/// reclaimed, sidestepping lock-free-list node removal entirely (a
/// single-reader, single-remover structure needs none of that
/// machinery).
pub fn take_new_registrations() -> *mut PageHeader {
    REGISTERED_PAGES.swap(std::ptr::null_mut(), Ordering::AcqRel)
}

/// `multiplier = (1<<32 | 0x10000) / object_size`, chosen so the high 32
/// bits of `(p - data) * multiplier` equal `floor((p-data)/object_size)`
/// for every valid interior pointer (spec.md §4.1).
pub fn compute_multiplier(object_size: usize) -> u64 {
    debug_assert!(object_size > 0);
    ((1u64 << 32) | 0x10000) / object_size as u64
}
