//! C11 — the collector (spec.md §4.9, §5).
//!
//! Grounded on the teacher's `Gc2::collect`/`mark_roots`/`sweep`/
//! `sweep_pools`/`sweep_bigvals` in `gc2.rs`: a single background thread
//! that premarks, walks roots, transitively marks, sweeps, and sleeps on a
//! allocation-vs-live trigger. Unlike the teacher (stop-the-world, driven
//! by a mutator thread requesting collection), this collector runs
//! entirely off its own detached thread and never blocks a mutator's
//! allocation path — the mark phase instead relies on the time-graded
//! `State` hint (`state.rs`) plus the two-pass `mark_reachable`/
//! `mark_updated` loop below to stay sound against concurrent writes
//! (spec.md §4.8, §9).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace};

use crate::config::GcConfig;
use crate::finalize;
use crate::mutator::{self, Mutator};
use crate::object_pool;
use crate::page::Page;
use crate::page_meta::{self, PageHeader};
use crate::state::State;

/// Drained mutator counters (spec.md §3 "Ownership": "the collector...
/// drains counters into a global remainder"). Spec.md §9 flags an open
/// question about whether `_allocated_rest`'s arithmetic is add in both
/// directions in one source draft; this crate resolves it as stated:
/// true addition on drain, true subtraction when freed bytes fold back in.
#[derive(Default)]
struct AllocatedRest {
    bytes: AtomicI64,
    objects: AtomicI64,
}

impl AllocatedRest {
    fn add(&self, bytes: i64, objects: i64) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
        self.objects.fetch_add(objects, Ordering::AcqRel);
    }

    fn sub(&self, bytes: i64, objects: i64) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.objects.fetch_sub(objects, Ordering::AcqRel);
    }

    fn bytes(&self) -> i64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn objects(&self) -> i64 {
        self.objects.load(Ordering::Acquire)
    }
}

/// Lifetime cycle-timing counters (spec.md §6 `gc_time`-class tunables:
/// off by default, pure observability). Stored as nanosecond/count atomics
/// rather than a `Duration` so reporting never needs a lock.
#[cfg(feature = "gc_time")]
struct GcTime {
    total_nanos: AtomicI64,
    cycles: AtomicI64,
}

#[cfg(feature = "gc_time")]
impl GcTime {
    const fn new() -> Self {
        GcTime {
            total_nanos: AtomicI64::new(0),
            cycles: AtomicI64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as i64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed).max(0) as u64)
    }

    fn cycle_count(&self) -> i64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "gc_time")]
static GC_TIME: GcTime = GcTime::new();

/// Snapshot of total allocation used both to decide the sleep-wake trigger
/// (spec.md §4.9 step 9) and to report live counters back out.
#[derive(Clone, Copy, Default, Debug)]
pub struct Totals {
    pub bytes: i64,
    pub objects: i64,
}

/// Outcome of a single `run_one_cycle` call, mostly useful to tests and to
/// the shutdown loop's progress check.
#[derive(Clone, Copy, Default, Debug)]
pub struct CycleStats {
    pub destroyed_objects: usize,
    pub destroyed_bytes: usize,
    pub live: Totals,
    pub skipped_recursive_alloc: bool,
}

/// The collector's private state. There is exactly one instance, created
/// lazily on first `make_tracked` and living for the process lifetime
/// (spec.md §9: "place these in a value owned by a `OnceCell`").
pub struct Collector {
    config: GcConfig,
    /// Every page ever carved, across every type and thread (spec.md §3
    /// `_registered_pages`). Grown from `page_meta::take_new_registrations`
    /// each cycle; a page leaves this list only when it is returned to the
    /// OS (large-object pages; fully-idle object-pool pages).
    all_pages: Vec<*mut PageHeader>,
    /// Page-granular grey stack (spec.md §3 "Grey stack").
    grey_stack: VecDeque<*mut PageHeader>,
    allocated_rest: AllocatedRest,
    last_update: Instant,
    live_at_cycle_start: Totals,
    /// Per-mutator snapshot of `recursive_alloc_pointer`, to detect a
    /// constructor that recursively allocates and hasn't progressed since
    /// the previous cycle (spec.md §4.9 step 1).
    last_recursive_ptr: HashMap<usize, usize>,
    shutdown: finalize::ShutdownProgress,
}

// Safety: every `*mut PageHeader` in `all_pages`/`grey_stack` is only ever
// dereferenced from the collector thread, which is the sole owner of this
// struct.
unsafe impl Send for Collector {}

impl Collector {
    fn new(config: GcConfig) -> Self {
        Collector {
            config,
            all_pages: Vec::new(),
            grey_stack: VecDeque::new(),
            allocated_rest: AllocatedRest::default(),
            last_update: Instant::now(),
            live_at_cycle_start: Totals::default(),
            last_recursive_ptr: HashMap::new(),
            shutdown: finalize::ShutdownProgress::new(),
        }
    }

    /// Fold newly-registered pages (spec.md §5 "the collector... detaches
    /// dead pages with a CAS that linearises with new appends") into
    /// `all_pages`.
    fn absorb_new_pages(&mut self) {
        let mut head = page_meta::take_new_registrations();
        while !head.is_null() {
            let next = unsafe { (*head).next_registered.load(Ordering::Acquire) };
            self.all_pages.push(head);
            head = next;
        }
    }

    /// Step 1: splice out dead mutator records, drain their counters, and
    /// detect a recursive-allocation stall (spec.md §4.9 step 1, §7).
    /// Returns `false` if this cycle should be skipped entirely.
    fn check_threads(&mut self) -> bool {
        let allocated_rest = &self.allocated_rest;
        mutator::drain_dead(|m| {
            allocated_rest.add(
                m.allocated_bytes.load(Ordering::Acquire) as i64,
                m.allocated_objects.load(Ordering::Acquire) as i64,
            );
            m.drain_pools();
            self_key_cleanup(m);
        });

        let mut stalled = false;
        let mut seen = HashMap::new();
        mutator::for_each(|m: &Arc<Mutator>| {
            let key = Arc::as_ptr(m) as usize;
            let cur = m.recursive_alloc_pointer();
            let prev = self.last_recursive_ptr.get(&key).copied().unwrap_or(0);
            if cur != 0 && cur == prev {
                stalled = true;
                debug!(
                    "{}",
                    crate::error::GcError::RecursiveAllocStalled { pointer: cur }
                );
            }
            seen.insert(key, cur);
        });
        self.last_recursive_ptr = seen;

        !stalled
    }

    /// Step 2: age every registered slot's state towards `Used` at a rate
    /// proportional to elapsed wall-clock time (spec.md §4.9 step 2).
    fn update_states(&mut self) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(self.last_update).as_millis().max(1) as u64;
        self.last_update = now;

        // "roughly AtomicReachable/100ms age units per elapsed ms".
        let atomic_steps = ((State::ATOMIC_REACHABLE.0 as u64 * elapsed_ms) / 100)
            .clamp(1, u8::MAX as u64) as u8;
        let ordinary_steps = elapsed_ms.clamp(1, u8::MAX as u64) as u8;

        for &page_ptr in &self.all_pages {
            let header = unsafe { &*page_ptr };
            for idx in 0..header.object_count {
                if !header.registered.get(idx) {
                    continue;
                }
                let cur = header.state_of(idx);
                let aged = cur.aged(ordinary_steps, atomic_steps);
                if aged != cur {
                    header.set_state(idx, aged);
                }
            }
        }
    }

    /// Clear the `marked` bitmap for every currently-registered slot before
    /// a fresh mark phase. Spec.md doesn't spell out when `marked` resets
    /// (only that sweep checks `registered & ~marked`); without a reset
    /// every object ever proven reachable would stay marked forever and
    /// nothing would ever be collected, so this crate resolves the gap by
    /// clearing at the start of each cycle's mark phase, the conventional
    /// placement in a tracing collector (documented in DESIGN.md).
    fn reset_marks(&mut self) {
        for &page_ptr in &self.all_pages {
            unsafe { (*page_ptr).marked.clear_all() };
        }
    }

    /// Step 3: observe every slot that has become non-`Unused` since it was
    /// last seen and seed it into the grey worklist (spec.md §4.9 step 3).
    /// `BadAlloc` slots are skipped permanently (spec.md §7, §9).
    fn mark_live_objects(&mut self) {
        for &page_ptr in self.all_pages.clone().iter() {
            let header = unsafe { &*page_ptr };
            for idx in 0..header.object_count {
                let st = header.state_of(idx);
                if st.is_unused() || st.is_bad_alloc() {
                    continue;
                }
                if !header.registered.get(idx) {
                    header.registered.set(idx, true);
                    header.reachable.set(idx, true);
                    self.push_grey(page_ptr);
                }
            }
        }
    }

    /// Steps 4/5: walk every mutator's stack- and heap-root tables.
    fn mark_stack_and_heap_roots(&mut self) {
        let mut targets = Vec::new();
        mutator::for_each(|m| {
            m.stack_roots.borrow().for_each(|addr| {
                targets.push(read_root_slot(addr));
            });
            m.heap_roots.borrow().for_each(|addr| {
                targets.push(read_root_slot(addr));
            });
        });
        for p in targets {
            self.mark(p);
        }
    }

    /// Register `p`'s slot with the collector if this is the first time it
    /// has been seen, and seed it into the grey worklist if not already
    /// marked this cycle (shared by the root walk and transitive mark).
    fn mark(&mut self, p: *const u8) {
        if p.is_null() {
            return;
        }
        let page = Page::base_of(p);
        if page.is_null() {
            return;
        }
        let header_ptr = unsafe { (*page).back_ptr() } as *mut PageHeader;
        if header_ptr.is_null() {
            return;
        }
        let header = unsafe { &*header_ptr };
        let idx = header.index_of(p);
        if idx >= header.object_count {
            return;
        }
        let st = header.state_of(idx);
        if st.is_unused() || st.is_bad_alloc() {
            return;
        }
        if !header.registered.test_and_set(idx) {
            // first time this collector has ever seen the slot live
        }
        if !header.marked.get(idx) {
            header.reachable.set(idx, true);
            self.push_grey(header_ptr);
        }
    }

    fn push_grey(&mut self, page_ptr: *mut PageHeader) {
        let header = unsafe { &*page_ptr };
        if !header.in_reachable_stack.swap(true, Ordering::AcqRel) {
            self.grey_stack.push_back(page_ptr);
        }
    }

    /// Step 6: drain the grey stack to a local fixpoint, following each
    /// newly-marked object's child pointers via its type's learned
    /// `pointer_offsets` (spec.md §4.9 step 6, §4.6).
    fn mark_reachable(&mut self) {
        while let Some(page_ptr) = self.grey_stack.pop_front() {
            let header = unsafe { &*page_ptr };
            header.in_reachable_stack.store(false, Ordering::Release);

            let pending: Vec<usize> = header.reachable.iter_set(header.object_count).collect();
            let mut children = Vec::new();
            for idx in pending {
                header.reachable.set(idx, false);
                if header.marked.test_and_set(idx) {
                    continue;
                }
                self.collect_children(header, idx, &mut children);
            }
            for child in children {
                self.mark(child);
            }

            // a child scan above may have set more bits on this very page
            // (a self-referential or sibling structure); requeue if so.
            if header.reachable.any_set() {
                self.push_grey(page_ptr);
            }
        }
    }

    /// Push the raw child-pointer words of object `idx` on `header` onto
    /// `out`, read via the type's learned offsets (spec.md §4.6, §4.9
    /// step 6 "for arrays, iterate the count and stride..." — this crate
    /// models an array as several same-type slots on one page, so no
    /// special per-element stride logic is needed here; see
    /// `large_object.rs`).
    fn collect_children(&self, header: &PageHeader, idx: usize, out: &mut Vec<*const u8>) {
        let meta_ptr = header.type_meta.load(Ordering::Acquire);
        if meta_ptr.is_null() {
            return;
        }
        let meta = unsafe { &*meta_ptr };
        let offsets = match meta.pointer_offsets() {
            Some(o) => o,
            None => return,
        };
        let slot = unsafe { header.data.add(idx * header.object_size) };
        for &offset in offsets {
            let cell = unsafe { slot.add(offset) } as *const std::sync::atomic::AtomicPtr<()>;
            let child = unsafe { (*cell).load(Ordering::Acquire) } as *const u8;
            out.push(child);
        }
    }

    /// Step 7: re-chase any registered-but-unmarked slot whose `State` rose
    /// during this cycle's mark phase (a concurrent mutator write racing
    /// the scan — spec.md §4.9 step 7, §9 property (a)). Returns whether
    /// any slot was newly re-queued.
    fn mark_updated(&mut self) -> bool {
        let mut progress = false;
        for &page_ptr in self.all_pages.clone().iter() {
            let header = unsafe { &*page_ptr };
            for idx in 0..header.object_count {
                if !header.registered.get(idx) || header.marked.get(idx) {
                    continue;
                }
                if header.state_of(idx).is_reachable_hint() {
                    header.marked.set(idx, true);
                    header.reachable.set(idx, true);
                    self.push_grey(page_ptr);
                    progress = true;
                }
            }
        }
        progress
    }

    /// Step 8: destroy every registered-but-unmarked slot, zero its
    /// tracked-pointer fields first, then forward its page either to the
    /// per-type recycling stack or straight back to the block allocator if
    /// it is now fully idle (spec.md §4.9 step 8, §4.2, §4.3, §4.4).
    ///
    /// The per-page work is independent (no two pages share a slot), so
    /// with the `parallel-sweep` feature it fans out across a scoped
    /// thread pool instead of running one page at a time.
    fn remove_garbage(&mut self) -> (usize, usize) {
        let results = sweep::sweep_all(&self.all_pages);

        let mut destroyed_objects = 0usize;
        let mut destroyed_bytes = 0usize;
        let mut recyclable: Vec<(u32, *mut PageHeader)> = Vec::new();
        let mut to_block: Vec<*mut PageHeader> = Vec::new();

        for result in results {
            destroyed_objects += result.destroyed_objects;
            destroyed_bytes += result.destroyed_bytes;
            if result.destroyed_objects == 0 {
                continue;
            }
            if let Some(type_index) = result.recycle_as {
                recyclable.push((type_index, result.page_ptr));
            } else {
                to_block.push(result.page_ptr);
            }
        }

        self.allocated_rest
            .sub(destroyed_bytes as i64, destroyed_objects as i64);

        for (type_index, page) in recyclable {
            object_pool::push_recycled(type_index, page);
        }
        if !to_block.is_empty() {
            let freed: std::collections::HashSet<*mut PageHeader> =
                to_block.iter().copied().collect();
            self.all_pages.retain(|p| !freed.contains(p));
            crate::block::global().free_headers(to_block);
        }

        (destroyed_objects, destroyed_bytes)
    }

    fn current_totals(&self) -> Totals {
        let mut bytes = self.allocated_rest.bytes();
        let mut objects = self.allocated_rest.objects();
        mutator::for_each(|m| {
            bytes += m.allocated_bytes.load(Ordering::Acquire) as i64;
            objects += m.allocated_objects.load(Ordering::Acquire) as i64;
        });
        Totals { bytes, objects }
    }

    /// Run exactly one cycle of mark + sweep (spec.md §4.9 steps 1-8),
    /// without the sleep policy (step 9) — callers drive sleeping.
    pub fn run_one_cycle(&mut self) -> CycleStats {
        #[cfg(feature = "gc_time")]
        let started = Instant::now();

        let stats = self.run_one_cycle_inner();

        #[cfg(feature = "gc_time")]
        {
            let elapsed = started.elapsed();
            GC_TIME.record(elapsed);
            trace!(
                "gc cycle took {:?} (lifetime total {:?} over {} cycles)",
                elapsed,
                GC_TIME.total(),
                GC_TIME.cycle_count(),
            );
        }

        stats
    }

    fn run_one_cycle_inner(&mut self) -> CycleStats {
        self.absorb_new_pages();

        if !self.check_threads() {
            return CycleStats {
                skipped_recursive_alloc: true,
                live: self.current_totals(),
                ..Default::default()
            };
        }

        self.update_states();
        self.reset_marks();
        self.mark_live_objects();
        self.mark_stack_and_heap_roots();

        self.mark_reachable();
        while self.mark_updated() {
            self.mark_reachable();
        }

        let (destroyed_objects, destroyed_bytes) = self.remove_garbage();

        let live = self.current_totals();
        self.live_at_cycle_start = live;
        self.shutdown.record_cycle();

        trace!(
            "gc cycle: destroyed {destroyed_objects} objects ({destroyed_bytes} bytes), live now {live:?}"
        );

        CycleStats {
            destroyed_objects,
            destroyed_bytes,
            live,
            skipped_recursive_alloc: false,
        }
    }

    /// Step 9: whether the trigger condition has already been met without
    /// waiting at all (spec.md §4.9 step 9a).
    fn trigger_met(&self) -> bool {
        let current = self.current_totals();
        let delta_bytes = (current.bytes - self.live_at_cycle_start.bytes).max(0) as u64;
        let delta_objects = (current.objects - self.live_at_cycle_start.objects).max(0) as u64;

        let byte_threshold = ((self.live_at_cycle_start.bytes.max(0) as u64)
            * self.config.trigger_percentage as u64
            / 100)
            .max(self.config.min_live_size as u64);
        let object_threshold = ((self.live_at_cycle_start.objects.max(0) as u64)
            * self.config.trigger_percentage as u64
            / 100)
            .max(self.config.min_live_count as u64);

        delta_bytes >= byte_threshold || delta_objects >= object_threshold
    }

    /// Sleep until the allocation trigger fires, `MAX_SLEEP_TIME_SEC`
    /// elapses, or abort is requested (spec.md §4.9 step 9).
    fn sleep_until_next_cycle(&self) {
        let deadline = Instant::now() + self.config.max_sleep_time();
        let tick = Duration::from_millis(50);
        while Instant::now() < deadline {
            if finalize::abort_requested() || self.trigger_met() {
                return;
            }
            std::thread::sleep(tick);
        }
    }

    /// The main background-thread loop: cycle, sleep, repeat, until abort
    /// is requested; then run the bounded finalisation tail (spec.md §4.9
    /// "Finalisation", §5 "Cancellation").
    fn run(&mut self) {
        loop {
            let stats = self.run_one_cycle();
            if finalize::abort_requested() {
                break;
            }
            let _ = stats;
            self.sleep_until_next_cycle();
        }

        info!("collector shutting down, running finalisation cycles");
        self.shutdown.begin_shutdown();
        let mut destroyed_last = usize::MAX;
        let mut live = self.current_totals().objects.max(0) as usize;
        while self.shutdown.should_continue(live, destroyed_last) {
            let stats = self.run_one_cycle();
            destroyed_last = stats.destroyed_objects;
            live = stats.live.objects.max(0) as usize;
        }
        info!("collector stopped, {live} objects remain live");
    }
}

fn self_key_cleanup(m: &Arc<Mutator>) {
    let _ = m;
}

/// Read the current pointer value out of a root-table entry. A root
/// table stores the *address of the `TrackedCell`*, not its contents
/// (`roots::stack_roots`/`roots::heap_roots`); since `TrackedCell` is
/// `repr(C)` with its `AtomicPtr<()>` word first, reading that address as
/// an `AtomicPtr<()>` recovers the tracked pointer without knowing `T`.
fn read_root_slot(cell_addr: *const ()) -> *const u8 {
    let cell = cell_addr as *const std::sync::atomic::AtomicPtr<()>;
    unsafe { (*cell).load(Ordering::Acquire) as *const u8 }
}

/// The single process-wide collector (spec.md §9). Created lazily on the
/// first `make_tracked`/`register_tracked_pointer` call; never torn down
/// until process exit.
static COLLECTOR: once_cell::sync::OnceCell<std::sync::Mutex<Collector>> =
    once_cell::sync::OnceCell::new();
static COLLECTOR_THREAD: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

fn collector() -> &'static std::sync::Mutex<Collector> {
    COLLECTOR.get_or_init(|| {
        std::sync::Mutex::new(Collector::new(
            GcConfig::from_env().unwrap_or_default(),
        ))
    })
}

/// Ensure the collector's background thread exists (spec.md §6: "created
/// lazily on first `make_tracked`"). Idempotent; safe to call from every
/// mutator thread's allocation path.
pub fn ensure_started() {
    COLLECTOR_THREAD.get_or_init(|| {
        collector();
        std::thread::Builder::new()
            .name("crucible-gc-collector".into())
            .spawn(|| {
                // `single_cycle` backs deterministic tests: run exactly one
                // cycle then stop, never entering the sleep/shutdown loop.
                if cfg!(feature = "single_cycle") {
                    collector().lock().unwrap().run_one_cycle();
                } else {
                    collector().lock().unwrap().run();
                }
            })
            .expect("failed to spawn collector thread");
    });
}

/// Run one cycle synchronously on the calling thread — used by tests that
/// want deterministic control over when a cycle happens, instead of racing
/// the background thread.
#[cfg(any(test, feature = "test-support"))]
pub fn run_one_cycle_for_test() -> CycleStats {
    collector().lock().unwrap().run_one_cycle()
}

/// Request collector shutdown (spec.md §5 "Cancellation": "a global
/// `abort` flag is set when the main thread's record is destroyed"). A
/// host runtime calls this once, at the point it considers its main
/// thread's record torn down — this crate has no portable way to detect
/// that on its own. After this call, `make_tracked` still works, but the
/// collector runs at most `finalize::MAX_FINALISATION_CYCLES` further
/// cycles before stopping for good. There is no way to un-request it.
pub fn request_shutdown() {
    finalize::request_abort();
}

/// Per-page sweep work, split out so it can run sequentially or across a
/// scoped thread pool (`parallel-sweep`) without changing the bookkeeping
/// in `Collector::remove_garbage`. No two pages share a slot, so sweeping
/// pages concurrently needs no synchronisation beyond giving each worker
/// its own disjoint slice.
mod sweep {
    use super::{finalize, Ordering, PageHeader, State};

    pub(super) struct PageSweepResult {
        pub page_ptr: *mut PageHeader,
        pub destroyed_objects: usize,
        pub destroyed_bytes: usize,
        /// `Some(type_index)` to send the page back to that type's
        /// recycler; `None` to return it straight to the block allocator
        /// (large pages and pages left fully idle).
        pub recycle_as: Option<u32>,
    }

    fn empty(page_ptr: *mut PageHeader) -> PageSweepResult {
        PageSweepResult {
            page_ptr,
            destroyed_objects: 0,
            destroyed_bytes: 0,
            recycle_as: None,
        }
    }

    /// Wraps a raw pointer so it can cross a `scoped_threadpool` closure
    /// boundary; sound because each page is visited by exactly one worker.
    #[cfg(feature = "parallel-sweep")]
    struct SendPtr(*mut PageHeader);
    #[cfg(feature = "parallel-sweep")]
    unsafe impl Send for SendPtr {}

    fn sweep_one(page_ptr: *mut PageHeader) -> PageSweepResult {
        let header = unsafe { &*page_ptr };
        let mut result = empty(page_ptr);
        for idx in 0..header.object_count {
            if !header.registered.get(idx) || header.marked.get(idx) {
                continue;
            }
            let meta_ptr = header.type_meta.load(Ordering::Acquire);
            if let Some(meta) = unsafe { meta_ptr.as_ref() } {
                let slot = unsafe { header.data.add(idx * header.object_size) as *mut u8 };
                unsafe { finalize::destroy_slot(slot, meta) };
                result.destroyed_bytes += meta.object_size;
            }
            header.set_state(idx, State::UNUSED);
            header.registered.set(idx, false);
            header.free_count.fetch_add(1, Ordering::AcqRel);
            result.destroyed_objects += 1;
        }
        if result.destroyed_objects == 0 {
            return result;
        }
        if !header.is_large && !header.is_empty() {
            let meta_ptr = header.type_meta.load(Ordering::Acquire);
            if let Some(meta) = unsafe { meta_ptr.as_ref() } {
                result.recycle_as = Some(meta.type_index);
            }
        }
        result
    }

    #[cfg(not(feature = "parallel-sweep"))]
    pub(super) fn sweep_all(pages: &[*mut PageHeader]) -> Vec<PageSweepResult> {
        pages.iter().map(|&p| sweep_one(p)).collect()
    }

    #[cfg(feature = "parallel-sweep")]
    pub(super) fn sweep_all(pages: &[*mut PageHeader]) -> Vec<PageSweepResult> {
        if pages.is_empty() {
            return Vec::new();
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(pages.len()) as u32;
        let chunk_size = (pages.len() + workers as usize - 1) / workers.max(1) as usize;

        let send_pages: Vec<SendPtr> = pages.iter().map(|&p| SendPtr(p)).collect();
        let mut results: Vec<PageSweepResult> = pages.iter().map(|&p| empty(p)).collect();

        let mut pool = scoped_threadpool::Pool::new(workers.max(1));
        pool.scoped(|scope| {
            let mut remaining_pages = send_pages.as_slice();
            let mut remaining_results = results.as_mut_slice();
            while !remaining_pages.is_empty() {
                let take = chunk_size.min(remaining_pages.len());
                let (page_chunk, rest_pages) = remaining_pages.split_at(take);
                let (result_chunk, rest_results) = remaining_results.split_at_mut(take);
                remaining_pages = rest_pages;
                remaining_results = rest_results;
                scope.execute(move || {
                    for (slot, page) in result_chunk.iter_mut().zip(page_chunk.iter()) {
                        *slot = sweep_one(page.0);
                    }
                });
            }
        });
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked::{make_tracked, TrackedCell};
    use crate::type_info::{registry, DestroyFn};
    use std::any::TypeId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as O;

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_destroy(_p: *mut u8) {
        DESTROYED.fetch_add(1, O::SeqCst);
    }

    #[repr(C)]
    struct Node {
        value: u64,
        next: TrackedCell<Node>,
    }

    fn node_meta(name: &'static str) -> &'static crate::type_info::TypeMetadata {
        registry()
            .get_or_register(
                TypeId::of::<Node>(),
                name,
                std::mem::size_of::<Node>(),
                4,
                counting_destroy as DestroyFn,
            )
            .unwrap()
    }

    fn build_node(
        meta: &'static crate::type_info::TypeMetadata,
        value: u64,
    ) -> *mut Node {
        let config = GcConfig::default();
        make_tracked::<Node>(meta, |p| {
            unsafe {
                (*p).value = value;
                let field_addr = &(*p).next as *const TrackedCell<Node> as *const ();
                std::ptr::write(
                    &mut (*p).next as *mut TrackedCell<Node>,
                    TrackedCell::new(field_addr, std::ptr::null_mut(), &config),
                );
            }
            Ok(())
        })
        .unwrap()
    }

    // Scenario A (spec.md §8): a two-node cycle with all roots dropped is
    // fully collected within a couple of cycles.
    #[test]
    fn unrooted_cycle_is_collected() {
        std::thread::spawn(|| {
            let before = DESTROYED.load(O::SeqCst);
            let meta = node_meta("CollectorNodeA");
            {
                let a = build_node(meta, 1);
                let b = build_node(meta, 2);
                unsafe {
                    (*a).next.store(b);
                    (*b).next.store(a);
                }
                // both `a` and `b` are local `*mut Node`, not roots
                // themselves (no `TrackedCell` wraps them on the stack in
                // this test) — they become unreachable once this scope
                // ends and nothing else points at them.
            }

            let mut collector = Collector::new(GcConfig::default());
            // first cycle: observes both nodes for the first time and
            // marks them live (mark_live_objects seeds everything it sees
            // for the first time), so neither is destroyed yet.
            let first = collector.run_one_cycle();
            assert_eq!(first.destroyed_objects, 0);
            // second cycle: nothing roots them any more, so both are
            // destroyed.
            let second = collector.run_one_cycle();
            assert_eq!(second.destroyed_objects, 2);
            assert_eq!(DESTROYED.load(O::SeqCst), before + 2);
        })
        .join()
        .unwrap();
    }

    // Scenario C (spec.md §8): a constructor failure leaves the slot
    // `BadAlloc` and no cycle ever destroys it.
    #[test]
    fn bad_alloc_slot_is_never_swept() {
        std::thread::spawn(|| {
            let before = DESTROYED.load(O::SeqCst);
            let meta = registry()
                .get_or_register(
                    TypeId::of::<(Node, u32)>(),
                    "CollectorNodeFailing",
                    std::mem::size_of::<Node>(),
                    4,
                    counting_destroy as DestroyFn,
                )
                .unwrap();
            let err = make_tracked::<Node>(meta, |_p| {
                Err(crate::error::GcError::ConstructionFailed { slot: 0 })
            })
            .unwrap_err();
            assert!(matches!(err, crate::error::GcError::ConstructionFailed { .. }));

            let mut collector = Collector::new(GcConfig::default());
            for _ in 0..3 {
                collector.run_one_cycle();
            }
            assert_eq!(DESTROYED.load(O::SeqCst), before);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn trigger_met_when_no_baseline_uses_floor() {
        let collector = Collector::new(GcConfig::default());
        // with live_at_cycle_start all zero, any allocation at all should
        // eventually exceed the floor once enough objects accumulate; here
        // we just check the threshold math doesn't divide by zero / panic.
        assert!(!collector.trigger_met());
    }
}
