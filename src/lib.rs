//! A concurrent, tracing garbage collector for host languages that expose
//! explicit managed-pointer values. Mutator (application) threads allocate
//! tracked objects and mutate pointer fields through lock-free fast paths;
//! a single background collector thread concurrently reclaims unreachable
//! objects via tri-colour mark/sweep, using a time-graded per-slot state
//! field in place of a classical write barrier.
//!
//! This crate is the reclamation engine and its allocation substrate. The
//! smart-pointer ergonomics a host language would expose to user code
//! (assignment operators, casts, cloning, type-registration macros) are
//! thin adapters meant to be built on top of the contracts in [`tracked`]
//! and [`collector`].

mod block;
mod config;
mod error;
mod finalize;
mod large_object;
mod mutator;
mod object_pool;
mod page;
mod page_meta;
mod pool;
mod roots;
mod state;
mod type_info;
mod util;

pub mod collector;
pub mod tracked;

pub use config::GcConfig;
pub use error::GcError;
pub use tracked::{base_address_of, make_tracked, metadata_of, TrackedCell};
pub use type_info::{registry as type_registry, DestroyFn, TypeMetadata};
