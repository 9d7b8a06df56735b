//! C7/C8 — root-set tracking (spec.md §3 "Root Tables", §4.5).
//!
//! Two kinds of root live outside the ordinary object pools:
//!
//! - A *stack root*: a `TrackedCell` whose own address sits on the current
//!   thread's call stack (a local variable holding a managed pointer).
//!   Classified at construction time by proximity to a one-time stack probe
//!   address (spec.md §4.5) and registered in [`stack_roots`]'s
//!   thread-local, hashed table.
//! - A *heap root*: a `TrackedCell` embedded in memory the collector does
//!   not otherwise scan (e.g. a `malloc`'d or `Box`-owned struct outside
//!   any managed page) and not discovered as an embedded field either.
//!   Registered in [`heap_roots`]'s per-thread, growable sub-pool working
//!   set.
//!
//! Neither kind is reachable by scanning managed pages, so the collector
//! walks both root tables at the start of every mark pass (spec.md §4.9).

pub mod heap_roots;
pub mod stack_roots;

use std::cell::Cell;

thread_local! {
    /// Address of a stack-local byte sampled once when the thread's
    /// mutator record is created. `TrackedCell` construction classifies
    /// itself as a stack root when its own address is within
    /// `MaxStackOffset` bytes of this probe (spec.md §4.5) — a cheap stand-
    /// in for walking the actual stack frame, since the collector never
    /// needs exact frame boundaries, only "is this on a stack".
    static STACK_PROBE: Cell<usize> = Cell::new(0);
}

/// Record this thread's current stack depth as the probe address. Called
/// once when a mutator record is installed (spec.md §4.7).
pub fn init_stack_probe() {
    let probe_local: u8 = 0;
    let addr = &probe_local as *const u8 as usize;
    STACK_PROBE.with(|p| p.set(addr));
}

/// Whether `addr` is within `max_stack_offset` bytes of this thread's
/// stack probe. Returns `false` if the probe has never been set (e.g. a
/// thread that allocates without going through mutator setup).
pub fn is_stack_address(addr: usize, max_stack_offset: usize) -> bool {
    STACK_PROBE.with(|p| {
        let probe = p.get();
        if probe == 0 {
            return false;
        }
        let distance = if addr >= probe {
            addr - probe
        } else {
            probe - addr
        };
        distance <= max_stack_offset
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_zero_until_initialised() {
        // a fresh thread never calls init_stack_probe
        std::thread::spawn(|| {
            assert!(!is_stack_address(0x1000, 4096));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn addresses_near_the_probe_classify_as_stack() {
        std::thread::spawn(|| {
            init_stack_probe();
            let local = 0u8;
            let addr = &local as *const u8 as usize;
            assert!(is_stack_address(addr, 4096));
            assert!(!is_stack_address(addr.wrapping_add(10 * 1024 * 1024), 4096));
        })
        .join()
        .unwrap();
    }
}
