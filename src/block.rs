//! C3 — the block allocator (spec.md §4.2). A `Block` groups
//! `PAGES_PER_BLOCK` contiguous, aligned pages (amortising the cost of the
//! underlying `mmap` call); the block allocator carves pages from blocks on
//! demand and returns whole blocks to the OS once every one of their pages
//! is idle.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::config::{PAGES_PER_BLOCK, PAGE_SIZE};
use crate::error::GcError;
use crate::page::Page;
use crate::page_meta::PageHeader;
use crate::util::Spinlock;

const BLOCK_BYTES: usize = PAGES_PER_BLOCK * PAGE_SIZE;

/// `PageCount` contiguous, page-aligned pages obtained from a single
/// `mmap` call. A block is only returned to the OS once all of its pages
/// are idle (spec.md invariant 5).
pub struct Block {
    base: NonNull<u8>,
    idle_pages: AtomicUsize,
}

// Safety: `base` points at OS-owned memory; access to the pages it backs
// is synchronised by the allocators that hand them out.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    fn map() -> Result<NonNull<u8>, GcError> {
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                BLOCK_BYTES,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(GcError::AllocationExhausted {
                    requested: BLOCK_BYTES,
                    source: std::io::Error::last_os_error(),
                });
            }
            // mmap'd anonymous memory is page-aligned and PAGE_SIZE divides
            // the OS page size on every platform this targets, so `ptr` is
            // already `PAGE_SIZE`-aligned.
            Ok(NonNull::new_unchecked(ptr as *mut u8))
        }
    }

    pub fn new() -> Result<Box<Block>, GcError> {
        let base = Self::map()?;
        debug!(
            "mapped block of {} pages ({} bytes) at {:p}",
            PAGES_PER_BLOCK, BLOCK_BYTES, base
        );
        Ok(Box::new(Block {
            base,
            idle_pages: AtomicUsize::new(PAGES_PER_BLOCK),
        }))
    }

    /// View this block's backing memory as its constituent pages.
    pub fn pages(&self) -> &[Page] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr() as *const Page, PAGES_PER_BLOCK) }
    }

    fn mark_idle(&self, n: usize) -> usize {
        self.idle_pages.fetch_add(n, Ordering::AcqRel) + n
    }

    fn mark_active(&self, n: usize) {
        self.idle_pages.fetch_sub(n, Ordering::AcqRel);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, BLOCK_BYTES);
        }
        trace!("unmapped block at {:p}", self.base);
    }
}

/// A page sitting in the empty-pages stack, still backed by a live block
/// but not currently owned by any per-type allocator.
struct EmptyPage {
    page: *const Page,
    owner: *mut Block,
}

// Safety: entries only ever move while `BlockAllocator::lock` is held.
unsafe impl Send for EmptyPage {}

/// Process-wide empty-page pool (spec.md §4.2). Guarded by a spin flag
/// rather than a blocking mutex: every critical section here is bounded,
/// O(pages-in-stack) list surgery, never a syscall.
pub struct BlockAllocator {
    lock: Spinlock,
    empty_pages: std::cell::UnsafeCell<Vec<EmptyPage>>,
    live_blocks: std::cell::UnsafeCell<Vec<Box<Block>>>,
}

unsafe impl Sync for BlockAllocator {}

impl BlockAllocator {
    pub fn new() -> Self {
        BlockAllocator {
            lock: Spinlock::new(),
            empty_pages: std::cell::UnsafeCell::new(Vec::new()),
            live_blocks: std::cell::UnsafeCell::new(Vec::new()),
        }
    }

    /// Carve a fresh page: pop from the empty-pages stack if one is
    /// available, otherwise map a new block and take its first page.
    pub fn alloc(&self) -> Result<*const Page, GcError> {
        self.carve_page().map(|(page, _owner)| page)
    }

    /// Same as `alloc`, but also hands back the page's owning block, which
    /// callers that need to `install_header` require.
    fn carve_page(&self) -> Result<(*const Page, *mut Block), GcError> {
        let _guard = self.lock.lock();
        let empty_pages = unsafe { &mut *self.empty_pages.get() };
        if let Some(entry) = empty_pages.pop() {
            unsafe { (*entry.owner).mark_active(1) };
            return Ok((entry.page, entry.owner));
        }
        drop(_guard);

        let block = Block::new()?;
        let block_ptr: *mut Block = Box::into_raw(block);
        let first_page: *const Page = unsafe { &(*block_ptr).pages()[0] as *const Page };
        unsafe { (*block_ptr).mark_active(1) };

        let guard = self.lock.lock();
        let live_blocks = unsafe { &mut *self.live_blocks.get() };
        live_blocks.push(unsafe { Box::from_raw(block_ptr) });
        let block_ref = live_blocks.last().unwrap().as_ref() as *const Block as *mut Block;
        // stash the remaining pages of the freshly-mapped block as empty
        let empty_pages = unsafe { &mut *self.empty_pages.get() };
        let pages = unsafe { (*block_ref).pages() };
        for p in &pages[1..] {
            empty_pages.push(EmptyPage {
                page: p as *const Page,
                owner: block_ref,
            });
        }
        drop(guard);
        Ok((first_page, block_ref))
    }

    /// Carve a fresh page and install a freshly-initialised `PageHeader` on
    /// it in one step — the entry point `object_pool.rs`/`large_object.rs`
    /// actually allocate through.
    pub fn alloc_page_for(
        &self,
        object_size: usize,
        object_count: usize,
        is_large: bool,
    ) -> Result<*mut PageHeader, GcError> {
        let (page, owner) = self.carve_page()?;
        Ok(install_header(page, owner, object_size, object_count, is_large))
    }

    /// Return pages to the empty list, then reclaim any block whose pages
    /// are now entirely idle (spec.md §4.2 algorithm).
    pub fn free(&self, pages: Vec<(*const Page, *mut Block)>) {
        if pages.is_empty() {
            return;
        }
        let guard = self.lock.lock();
        let empty_pages = unsafe { &mut *self.empty_pages.get() };

        let mut newly_idle: std::collections::HashMap<*mut Block, usize> =
            std::collections::HashMap::new();
        for (page, owner) in &pages {
            empty_pages.push(EmptyPage {
                page: *page,
                owner: *owner,
            });
            *newly_idle.entry(*owner).or_insert(0) += 1;
        }

        let mut fully_idle = Vec::new();
        for (owner, count) in newly_idle {
            let total_idle = unsafe { (*owner).mark_idle(count) };
            if total_idle == PAGES_PER_BLOCK {
                fully_idle.push(owner);
            }
        }

        if fully_idle.is_empty() {
            return;
        }

        empty_pages.retain(|entry| !fully_idle.contains(&entry.owner));

        let live_blocks = unsafe { &mut *self.live_blocks.get() };
        live_blocks.retain(|b| {
            let ptr = b.as_ref() as *const Block as *mut Block;
            if fully_idle.contains(&ptr) {
                debug!("returning fully-idle block {:p} to the OS", ptr);
                false
            } else {
                true
            }
        });
        drop(guard);
    }

    /// Convenience over `free` for callers holding `PageHeader`s rather than
    /// raw `(page, owner)` pairs: reads the owner back out of the header,
    /// forwards the backing page to the empty list, and drops the header
    /// itself (it was `Box::into_raw`'d by `install_header`).
    pub fn free_headers(&self, headers: Vec<*mut PageHeader>) {
        let pairs = headers
            .iter()
            .map(|&h| {
                let header = unsafe { &*h };
                (header.owning_page, header.owner.load(Ordering::Acquire))
            })
            .collect();
        self.free(pairs);
        for h in headers {
            unsafe { drop(Box::from_raw(h)) };
        }
    }

    pub fn empty_page_count(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { &*self.empty_pages.get() }.len()
    }

    pub fn live_block_count(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { &*self.live_blocks.get() }.len()
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The single process-wide block allocator every mutator and the
/// collector share (spec.md §9: one `OnceCell`-owned global). Lazily
/// created on first use, same lifecycle as the global `Collector`.
pub fn global() -> &'static BlockAllocator {
    static GLOBAL: once_cell::sync::OnceCell<BlockAllocator> = once_cell::sync::OnceCell::new();
    GLOBAL.get_or_init(BlockAllocator::new)
}

/// Install a header on a newly-carved page and hand back a raw pointer
/// suitable for registering with an object-pool/large-object allocator.
pub fn install_header(
    page: *const Page,
    owner: *mut Block,
    object_size: usize,
    object_count: usize,
    is_large: bool,
) -> *mut PageHeader {
    let page_ref = unsafe { &*page };
    let header = PageHeader::new(page_ref, owner, object_size, object_count, is_large);
    let header_ptr = Box::into_raw(header);
    unsafe { page_ref.set_back_ptr(header_ptr as *mut ()) };
    crate::page_meta::register_globally(header_ptr);
    header_ptr
}
