//! C7 — the thread-local stack-roots table (spec.md §3, §4.5).
//!
//! Every live stack root is registered under `hash(&cell) % BUCKETS`, so
//! the collector's root scan (spec.md §4.9 `mark_stack`) only has to walk
//! one thread's table rather than probe raw stack memory. Each bucket is a
//! singly-linked chain of fixed-capacity pages, allocated lazily on first
//! use — most buckets on most threads never see a single registration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;

/// Number of hash buckets per thread (spec.md §4.5: "256-way hashed").
pub const BUCKETS: usize = 256;
/// Slots per lazily-allocated page within one bucket's chain.
const SLOTS_PER_PAGE: usize = 32;

struct RootPage {
    slots: [*const (); SLOTS_PER_PAGE],
    len: usize,
    next: Option<Box<RootPage>>,
}

impl RootPage {
    fn new() -> Self {
        RootPage {
            slots: [ptr::null(); SLOTS_PER_PAGE],
            len: 0,
            next: None,
        }
    }
}

/// One thread's full stack-roots table: `BUCKETS` independently-grown
/// chains of pages.
pub struct StackRootTable {
    buckets: Vec<Option<Box<RootPage>>>,
    count: usize,
}

impl StackRootTable {
    fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKETS);
        buckets.resize_with(BUCKETS, || None);
        StackRootTable { buckets, count: 0 }
    }

    fn bucket_of(addr: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        (hasher.finish() as usize) % BUCKETS
    }

    /// Register `cell_addr` as a live stack root. Idempotent is not
    /// required: a cell registers exactly once at construction and
    /// unregisters exactly once when its frame unwinds (spec.md §4.7).
    pub fn register(&mut self, cell_addr: *const ()) {
        let bucket = Self::bucket_of(cell_addr as usize);
        let mut page = &mut self.buckets[bucket];
        loop {
            match page {
                Some(p) => {
                    if p.len < SLOTS_PER_PAGE {
                        p.slots[p.len] = cell_addr;
                        p.len += 1;
                        self.count += 1;
                        return;
                    }
                    page = &mut p.next;
                }
                None => {
                    let mut fresh = Box::new(RootPage::new());
                    fresh.slots[0] = cell_addr;
                    fresh.len = 1;
                    *page = Some(fresh);
                    self.count += 1;
                    return;
                }
            }
        }
    }

    /// Remove one registration of `cell_addr` (the first one found; a
    /// given address is only ever registered once at a time).
    pub fn unregister(&mut self, cell_addr: *const ()) {
        let bucket = Self::bucket_of(cell_addr as usize);
        let mut page = &mut self.buckets[bucket];
        while let Some(p) = page {
            if let Some(i) = p.slots[..p.len].iter().position(|&s| s == cell_addr) {
                p.len -= 1;
                p.slots[i] = p.slots[p.len];
                p.slots[p.len] = ptr::null();
                self.count -= 1;
                return;
            }
            page = &mut p.next;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Visit every currently-registered root address (spec.md §4.9
    /// `mark_stack`).
    pub fn for_each(&self, mut f: impl FnMut(*const ())) {
        for bucket in &self.buckets {
            let mut page = bucket;
            while let Some(p) = page {
                for &slot in &p.slots[..p.len] {
                    f(slot);
                }
                page = &p.next;
            }
        }
    }
}

impl Default for StackRootTable {
    fn default() -> Self {
        Self::new()
    }
}
