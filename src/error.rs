//! Error types for every fallible boundary in the collector (spec.md §7).

use thiserror::Error;

/// Errors surfaced by the allocation path and collector lifecycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GcError {
    /// The OS refused to back a new region or block (`mmap` failed).
    #[error("failed to map {requested} bytes of managed heap")]
    AllocationExhausted {
        requested: usize,
        #[source]
        source: std::io::Error,
    },
    /// A type's constructor ran to completion with a thrown/propagated error.
    /// The slot has already been tagged `BadAlloc` by the time this is
    /// returned; the memory is leaked by design (spec.md §7, §9).
    #[error("constructor failed for value at {slot:#x}, slot marked BadAlloc")]
    ConstructionFailed { slot: usize },
    /// More than `MaxTypeNumber` distinct types have been registered by this
    /// process. Spec.md §7 allows either a fatal assertion or a catchable
    /// error; this crate always returns the catchable form.
    #[error("type table exhausted: more than {max} distinct types registered")]
    TypeTableOverflow { max: u32 },
    /// An environment-supplied tunable failed to parse.
    #[error("invalid value for tunable {name}: {value:?}")]
    Config {
        name: &'static str,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
    /// Diagnostic only (spec.md §7 "Recursive-allocation-deadlock
    /// detection"): never returned to a caller, since the collector's
    /// response is to silently skip a cycle, not to surface an error.
    /// Kept as a typed variant so `collector.rs` can log a structured
    /// message via this error's `Display` impl instead of a bespoke
    /// string.
    #[error("thread stalled on recursive allocation at slot {pointer:#x}")]
    RecursiveAllocStalled { pointer: usize },
}
