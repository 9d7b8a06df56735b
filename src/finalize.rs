//! Finalisation and the shutdown protocol (spec.md §4.9 `remove_garbage`,
//! §1 "finalisation and shutdown protocol", §5 "Cancellation").
//!
//! Grounded on the teacher's `Finalizer`/`schedule_finalization`/
//! `finalize_object` bookkeeping in `gc.rs` and `sweep_finalizer_list` in
//! `gc2.rs`, stripped down to what spec.md actually asks of this core:
//! running a type's destructor once a slot is confirmed unreachable, and
//! giving the collector a way to decide when to stop retrying at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Set once the process is tearing down (spec.md §5 "A global `abort` flag
/// is set when the main thread's record is destroyed"). The collector's
/// sleep honours it as an early wake; cycles after abort proceed until
/// quiescence rather than stopping immediately.
static ABORT: AtomicBool = AtomicBool::new(false);

pub fn request_abort() {
    ABORT.store(true, Ordering::Release);
}

pub fn abort_requested() -> bool {
    ABORT.load(Ordering::Acquire)
}

/// Up to this many extra cycles run after abort is requested (spec.md §4.9
/// "Finalisation"), stopping early once a cycle finds nothing left to do.
pub const MAX_FINALISATION_CYCLES: u32 = 5;

/// Destroy one slot: run its type's destructor in place, then zero every
/// tracked-pointer field the destructor might otherwise read as a dangling
/// cross-reference (spec.md §4.9 step 8, testable property 3: "every
/// tracked pointer field it held reads as null").
///
/// Safety: `slot` must point at a `Used`/`Reachable`/`AtomicReachable`
/// object of `meta`'s type that the mark phase did not find reachable;
/// the caller (the collector's sweep) is the only legitimate caller.
pub unsafe fn destroy_slot(
    slot: *mut u8,
    meta: &crate::type_info::TypeMetadata,
) {
    if let Some(offsets) = meta.pointer_offsets() {
        // spec.md §9 open question: array destruction (and, by the same
        // reasoning, any type) only zeroes pointer fields when offsets are
        // known; a type with none recorded skips the pass entirely.
        for &offset in offsets {
            let field = slot.add(offset) as *mut *mut ();
            std::ptr::write(field, std::ptr::null_mut());
        }
    }
    (meta.destroy)(slot);
}

/// Tracks whether the most recent finalisation cycle made any progress
/// destroying objects, so the shutdown loop in `collector.rs` can stop as
/// soon as a cycle both finds the live set empty and frees nothing
/// (spec.md §4.9 "Finalisation": "terminates only after a cycle that
/// finds the live set empty or makes no progress destroying anything").
#[derive(Debug, Default)]
pub struct ShutdownProgress {
    cycles_run: AtomicU64,
}

impl ShutdownProgress {
    pub const fn new() -> Self {
        ShutdownProgress {
            cycles_run: AtomicU64::new(0),
        }
    }

    /// Returns `true` if the shutdown loop should keep running another
    /// cycle: fewer than `MAX_FINALISATION_CYCLES` have run, the live set
    /// is non-empty, and the previous cycle still destroyed something.
    pub fn should_continue(&self, live_count: usize, destroyed_last_cycle: usize) -> bool {
        let ran = self.cycles_run.load(Ordering::Acquire);
        if ran >= MAX_FINALISATION_CYCLES as u64 {
            return false;
        }
        if ran > 0 && (live_count == 0 || destroyed_last_cycle == 0) {
            return false;
        }
        true
    }

    pub fn record_cycle(&self) {
        self.cycles_run.fetch_add(1, Ordering::AcqRel);
    }

    /// Zero the counter so it tracks only cycles run since shutdown began,
    /// not the lifetime cycle count (spec.md §4.9 "the loop runs up to 5
    /// *more* cycles" — `record_cycle` is also called on every pre-abort
    /// cycle, so without this reset a long-running process would already
    /// be over the cap by the time it asked to shut down).
    pub fn begin_shutdown(&self) {
        self.cycles_run.store(0, Ordering::Release);
    }
}
