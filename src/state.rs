//! The per-slot `State` byte (spec.md §3) and the collector's aging policy
//! over it — the "time-graded reachability hint" that stands in for a
//! classical write barrier (spec.md §4.8, §9).

use std::sync::atomic::{AtomicU8, Ordering};

/// Free slot.
pub const UNUSED: u8 = 255;
/// Reserved by a thread pool but not yet constructed. Any value strictly
/// between `ATOMIC_REACHABLE` and `UNUSED` is a reserved slot; the spec
/// allows a range here so a reservation can itself carry an age.
pub const RESERVED_MAX: u8 = 254;
/// Construction failed; never destroyed, never swept.
pub const BAD_ALLOC: u8 = 253;
/// Written via an atomic pointer op; ages by time at the "atomic" rate.
pub const ATOMIC_REACHABLE: u8 = 252;
/// Written via an ordinary tracked-pointer op; ages by time at the
/// "ordinary" rate.
pub const REACHABLE: u8 = 1;
/// Constructed and not recently written.
pub const USED: u8 = 0;

/// A single slot's state, transparently a `u8` so it lines up with the
/// `AtomicU8` array `PageHeader` stores per spec.md §3. A newtype rather
/// than a Rust `enum`: the aging pass (spec.md §4.9 step 2) needs ordered
/// numeric subtraction on the raw byte, which an `enum` discriminant would
/// only award by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct State(pub u8);

impl State {
    pub const UNUSED: State = State(UNUSED);
    pub const BAD_ALLOC: State = State(BAD_ALLOC);
    pub const ATOMIC_REACHABLE: State = State(ATOMIC_REACHABLE);
    pub const REACHABLE: State = State(REACHABLE);
    pub const USED: State = State(USED);

    #[inline]
    pub fn reserved(age: u8) -> State {
        debug_assert!(age <= RESERVED_MAX - ATOMIC_REACHABLE - 1);
        State(RESERVED_MAX - age)
    }

    #[inline]
    pub fn is_unused(self) -> bool {
        self.0 == UNUSED
    }

    #[inline]
    pub fn is_reserved(self) -> bool {
        self.0 > ATOMIC_REACHABLE && self.0 < UNUSED
    }

    #[inline]
    pub fn is_bad_alloc(self) -> bool {
        self.0 == BAD_ALLOC
    }

    /// Treated as reachable for the current cycle regardless of whether the
    /// pointing slot has been scanned yet (spec.md §4.8).
    #[inline]
    pub fn is_reachable_hint(self) -> bool {
        self.0 >= REACHABLE && self.0 <= ATOMIC_REACHABLE
    }

    #[inline]
    pub fn is_registrable(self) -> bool {
        !self.is_unused()
    }

    /// Age this state towards `Used` by `ordinary_steps`/`atomic_steps` age
    /// units, per spec.md §4.9 step 2. Only `Reachable`/`AtomicReachable`
    /// states age; everything else (`Used`, `BadAlloc`, `Unused`, reserved)
    /// is left untouched.
    #[inline]
    pub fn aged(self, ordinary_steps: u8, atomic_steps: u8) -> State {
        if self.0 == REACHABLE {
            let step = ordinary_steps.max(1);
            State(self.0.saturating_sub(step).max(USED))
        } else if self.0 > REACHABLE && self.0 <= ATOMIC_REACHABLE {
            let next = self.0.saturating_sub(atomic_steps.max(1));
            if next <= REACHABLE {
                State::USED
            } else {
                State(next)
            }
        } else {
            self
        }
    }
}

/// An `AtomicU8`-backed `State` cell, one per slot in a page.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: State) -> Self {
        StateCell(AtomicU8::new(initial.0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, state: State, order: Ordering) {
        self.0.store(state.0, order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: State,
        new: State,
        success: Ordering,
        failure: Ordering,
    ) -> Result<State, State> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(State)
            .map_err(State)
    }
}
