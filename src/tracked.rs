//! Tracked-pointer cells and the public construction/mutation surface
//! (spec.md §4.7, §4.8, §6).
//!
//! Grounded on the teacher's `jl_gc_setmark`/concurrent marking writes in
//! `gc2.rs` and the external-interface table in spec.md §6. A
//! `TrackedCell<T>` is the one primitive the host language's smart-pointer
//! layer (out of scope per spec.md §1 Non-goals) would be built from: it
//! holds one managed pointer and knows how to classify and register itself
//! as a root exactly once, at construction.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::warn;

use crate::config::GcConfig;
use crate::error::GcError;
use crate::mutator::{self, Mutator};
use crate::page::Page;
use crate::page_meta::PageHeader;
use crate::roots::is_stack_address;
use crate::state::State;
use crate::type_info::{self, TypeMetadata};

/// How a given `TrackedCell` was classified at construction (spec.md
/// §4.5). Only `Stack`/`Heap` cells are registered in a root table;
/// `Embedded` cells are reached by the collector scanning their owning
/// object's `pointer_offsets` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    Embedded,
    Stack,
    Heap,
}

/// A single tracked-pointer slot. `T` is a zero-sized marker for the
/// pointee type; the collector only ever operates on the untyped slot
/// address and the pointee's `TypeMetadata`.
///
/// `repr(C)` pins `slot` at offset 0: the collector's transitive mark
/// (`collector.rs`) walks a type's `pointer_offsets` generically, reading
/// each one as a raw `AtomicPtr<()>` word with no knowledge of `T` — that
/// only works if the discovered offset (the whole cell's address) is also
/// the offset of the word it stores.
#[repr(C)]
pub struct TrackedCell<T> {
    slot: AtomicPtr<()>,
    kind: RootKind,
    _marker: PhantomData<T>,
}

// Safety: the slot is an `AtomicPtr`; classification (`kind`) is fixed at
// construction and never mutated afterwards.
unsafe impl<T> Send for TrackedCell<T> {}
unsafe impl<T> Sync for TrackedCell<T> {}

impl<T> TrackedCell<T> {
    /// Build a cell holding `initial` (possibly null) and classify it as a
    /// root or embedded field (spec.md §4.7):
    /// 1. If a discovery frame is open and `cell_addr` falls inside it,
    ///    it's an embedded field — record the offset, no root
    ///    registration.
    /// 2. Otherwise, classify by proximity to this thread's stack probe
    ///    (spec.md §4.5) as a stack or heap root, and register it in the
    ///    corresponding table.
    ///
    /// `cell_addr` must be the address this cell will actually live at
    /// once placed (its final field address, or its stack slot's
    /// address) — Rust gives no general way to recover that address from
    /// inside a by-value constructor, so callers that place the cell via
    /// `std::ptr::write` into a field must pass that field's address
    /// explicitly, as `make_tracked`'s caller-supplied closures do.
    pub fn new(cell_addr: *const (), initial: *mut T, config: &GcConfig) -> Self {
        let addr = cell_addr as usize;

        if type_info::try_register_field(addr) {
            return TrackedCell {
                slot: AtomicPtr::new(initial as *mut ()),
                kind: RootKind::Embedded,
                _marker: PhantomData,
            };
        }

        let kind = if is_stack_address(addr, config.max_stack_offset) {
            mutator::current()
                .stack_roots
                .borrow_mut()
                .register(addr as *const ());
            RootKind::Stack
        } else {
            mutator::current()
                .heap_roots
                .borrow_mut()
                .register(addr as *const ());
            RootKind::Heap
        };

        TrackedCell {
            slot: AtomicPtr::new(initial as *mut ()),
            kind,
            _marker: PhantomData,
        }
    }

    fn address(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// Ordinary (non-atomic) store (spec.md §4.8): write the pointer, then
    /// raise the pointee's state to `Reachable`. A single aging step
    /// suffices because an ordinary store already carries the release
    /// fence the collector's mark pass synchronises with.
    pub fn store(&self, value: *mut T) {
        self.slot.store(value as *mut (), Ordering::Release);
        mark_reachable(value as *const u8, State::REACHABLE);
    }

    pub fn load(&self) -> *mut T {
        self.slot.load(Ordering::Acquire) as *mut T
    }

    /// Atomic store used for concurrent publication (spec.md §4.8):
    /// raises the pointee to `AtomicReachable`, a longer-lived hint, since
    /// there is no accompanying release-ordered program point the
    /// collector's mark pass can rely on having already observed.
    pub fn store_atomic(&self, value: *mut T) {
        self.slot.store(value as *mut (), Ordering::SeqCst);
        mark_reachable(value as *const u8, State::ATOMIC_REACHABLE);
    }

    pub fn load_atomic(&self) -> *mut T {
        self.slot.load(Ordering::SeqCst) as *mut T
    }

    pub fn exchange(&self, value: *mut T) -> *mut T {
        let old = self.slot.swap(value as *mut (), Ordering::SeqCst);
        mark_reachable(value as *const u8, State::ATOMIC_REACHABLE);
        old as *mut T
    }

    pub fn compare_exchange(&self, current: *mut T, new: *mut T) -> Result<*mut T, *mut T> {
        match self.slot.compare_exchange(
            current as *mut (),
            new as *mut (),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(old) => {
                mark_reachable(new as *const u8, State::ATOMIC_REACHABLE);
                Ok(old as *mut T)
            }
            Err(old) => Err(old as *mut T),
        }
    }
}

impl<T> Drop for TrackedCell<T> {
    fn drop(&mut self) {
        let addr = self.address();
        match self.kind {
            RootKind::Embedded => {}
            RootKind::Stack => mutator::current().stack_roots.borrow_mut().unregister(addr),
            RootKind::Heap => mutator::current().heap_roots.borrow_mut().unregister(addr),
        }
    }
}

/// Look up the `PageHeader` backing the page that contains `ptr` (spec.md
/// §6 `base_address_of`/`metadata_of` support). `ptr` must point somewhere
/// inside a page that has already been handed to an allocator (i.e. its
/// back-pointer word holds a `PageHeader`, not a `Block`).
fn header_of(ptr: *const u8) -> *mut PageHeader {
    let page = Page::base_of(ptr);
    unsafe { (*page).back_ptr() as *mut PageHeader }
}

/// The base (slot-start) address of the object `ptr` points into.
pub fn base_address_of(ptr: *const u8) -> *const u8 {
    let header = header_of(ptr);
    unsafe { (*header).base_address_of(ptr) }
}

/// The `TypeMetadata` of the object `ptr` points into.
pub fn metadata_of(ptr: *const u8) -> &'static TypeMetadata {
    let header = header_of(ptr);
    let meta = unsafe { (*header).type_meta.load(Ordering::Acquire) };
    unsafe { &*meta }
}

fn mark_reachable(ptr: *const u8, state: State) {
    if ptr.is_null() {
        return;
    }
    let header = header_of(ptr);
    if header.is_null() {
        warn!("store to untracked pointer {:p}, ignoring", ptr);
        return;
    }
    let idx = unsafe { (*header).index_of(ptr) };
    unsafe { (*header).set_state(idx, state) };
}

/// Construct a tracked object of `meta`'s type in place (spec.md §4.7):
///
/// 1. Allocate a slot through this thread's mutator record.
/// 2. Mark it `Reserved` so a concurrent mark pass does not treat
///    uninitialised bytes as a valid object.
/// 3. Open a pointer-offset discovery frame over the slot's byte range.
/// 4. Run `construct`, which initialises the object in place (including
///    any embedded `TrackedCell` fields, which self-register against the
///    open discovery frame).
/// 5. On success: close the frame, publish the discovered offsets (first
///    writer wins), mark the slot `Used`, return the pointer.
/// 6. On failure: abandon the frame, mark the slot `BadAlloc` (the memory
///    is permanently leaked — spec.md §7/§9 — since a destructor has not
///    run and the bytes may be partially initialised), return
///    `GcError::ConstructionFailed`.
pub fn make_tracked<T>(
    meta: &'static TypeMetadata,
    construct: impl FnOnce(*mut T) -> Result<(), GcError>,
) -> Result<*mut T, GcError> {
    crate::collector::ensure_started();
    let mutator: std::sync::Arc<Mutator> = mutator::current();
    let slot = mutator.alloc(meta)?;
    let header = header_of(slot);
    let idx = unsafe { (*header).index_of(slot) };
    unsafe { (*header).set_state(idx, State::reserved(0)) };

    // spec.md §4.9 step 1 "recursive-allocation-deadlock detection": the
    // collector watches this value across cycles to tell a constructor
    // that is itself recursively allocating (and hasn't progressed) from
    // ordinary concurrent allocation.
    mutator.begin_recursive_alloc_watch(slot);

    type_info::begin_discovery(slot, meta.object_size);
    let result = match construct(slot as *mut T) {
        Ok(()) => {
            let offsets = type_info::end_discovery();
            type_info::publish_if_unset(meta, offsets);
            unsafe { (*header).set_state(idx, State::USED) };
            Ok(slot as *mut T)
        }
        Err(_) => {
            type_info::abort_discovery();
            unsafe { (*header).set_state(idx, State::BAD_ALLOC) };
            Err(GcError::ConstructionFailed { slot: slot as usize })
        }
    };
    mutator.end_recursive_alloc_watch();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_info::{registry, DestroyFn};
    use std::any::TypeId;

    unsafe fn noop_destroy(_p: *mut u8) {}

    #[repr(C)]
    struct Node {
        value: u64,
        next: TrackedCell<Node>,
    }

    fn node_meta() -> &'static TypeMetadata {
        registry()
            .get_or_register(
                TypeId::of::<Node>(),
                "Node",
                std::mem::size_of::<Node>(),
                4,
                noop_destroy as DestroyFn,
            )
            .unwrap()
    }

    #[test]
    fn make_tracked_constructs_and_discovers_offsets() {
        std::thread::spawn(|| {
            let meta = node_meta();
            let config = GcConfig::default();
            let ptr = make_tracked::<Node>(meta, |p| {
                unsafe {
                    (*p).value = 7;
                    let field_addr = &(*p).next as *const TrackedCell<Node> as *const ();
                    std::ptr::write(
                        &mut (*p).next as *mut TrackedCell<Node>,
                        TrackedCell::new(field_addr, ptr::null_mut(), &config),
                    );
                }
                Ok(())
            })
            .unwrap();

            assert_eq!(unsafe { (*ptr).value }, 7);
            let offsets = meta.pointer_offsets().expect("offsets published");
            let expected = unsafe {
                (&(*ptr).next as *const TrackedCell<Node> as usize) - (ptr as usize)
            };
            assert_eq!(offsets, &[expected][..]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn failed_construction_marks_slot_bad_alloc_and_is_reported() {
        std::thread::spawn(|| {
            let meta = registry()
                .get_or_register(
                    TypeId::of::<(Node, u8)>(),
                    "NodeFailing",
                    std::mem::size_of::<Node>(),
                    4,
                    noop_destroy as DestroyFn,
                )
                .unwrap();
            let err = make_tracked::<Node>(meta, |_p| {
                Err(GcError::ConstructionFailed { slot: 0 })
            })
            .unwrap_err();
            assert!(matches!(err, GcError::ConstructionFailed { .. }));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn store_raises_pointee_to_reachable() {
        std::thread::spawn(|| {
            let meta = registry()
                .get_or_register(
                    TypeId::of::<(Node, u16)>(),
                    "NodeStore",
                    std::mem::size_of::<Node>(),
                    4,
                    noop_destroy as DestroyFn,
                )
                .unwrap();
            let config = GcConfig::default();
            let a = make_tracked::<Node>(meta, |p| {
                unsafe {
                    (*p).value = 1;
                    let field_addr = &(*p).next as *const TrackedCell<Node> as *const ();
                    std::ptr::write(
                        &mut (*p).next as *mut TrackedCell<Node>,
                        TrackedCell::new(field_addr, ptr::null_mut(), &config),
                    );
                }
                Ok(())
            })
            .unwrap();
            let b = make_tracked::<Node>(meta, |p| {
                unsafe {
                    (*p).value = 2;
                    let field_addr = &(*p).next as *const TrackedCell<Node> as *const ();
                    std::ptr::write(
                        &mut (*p).next as *mut TrackedCell<Node>,
                        TrackedCell::new(field_addr, ptr::null_mut(), &config),
                    );
                }
                Ok(())
            })
            .unwrap();

            let header = header_of(b as *const u8);
            let idx = unsafe { (*header).index_of(b as *const u8) };
            unsafe { (*header).set_state(idx, State::USED) };

            unsafe { (*a).next.store(b) };
            assert_eq!(unsafe { (*header).state_of(idx) }, State::REACHABLE);
        })
        .join()
        .unwrap();
    }
}
