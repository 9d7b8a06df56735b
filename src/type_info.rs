//! C9 — per-type metadata and pointer-offset discovery (spec.md §3, §4.6).
//!
//! The collector never has compile-time knowledge of a managed type's
//! layout (the host language is dynamically typed); instead, the byte
//! offsets of a type's tracked-pointer fields are *discovered* the first
//! time an instance is constructed, by recording the address of every
//! `TrackedCell` whose own address falls inside the object's byte range
//! while that range is open on a thread-local stack (teacher's approach
//! has no direct analogue — Julia's compiler emits layout tables instead —
//! this module is new code written in the teacher's idiom: CAS-published,
//! process-lifetime metadata, same as `JlDatatype`/`JlDatatypeLayout` in
//! `c_interface.rs`).

use std::any::TypeId;
use std::cell::RefCell;
use std::ops::Range;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::config::MAX_TYPE_NUMBER;
use crate::error::GcError;

/// A destructor for a concrete managed type, called with a pointer to the
/// start of the object's storage.
pub type DestroyFn = unsafe fn(*mut u8);

/// Per-type, process-lifetime descriptor (spec.md §3 "Type Metadata").
pub struct TypeMetadata {
    pub id: TypeId,
    pub name: &'static str,
    pub object_size: usize,
    pub object_count_per_page: usize,
    pub destroy: DestroyFn,
    /// `null` until the first successful construction publishes it.
    pointer_offsets: AtomicPtr<Vec<usize>>,
    /// Unique, process-lifetime index for this type (spec.md §3, "Mutator
    /// Record"), used to key a mutator's per-type allocator cache.
    pub type_index: u32,
}

impl TypeMetadata {
    /// Offsets of this type's tracked-pointer fields, or `None` if no
    /// instance has completed construction yet.
    pub fn pointer_offsets(&self) -> Option<&[usize]> {
        let ptr = self.pointer_offsets.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Publish a freshly-discovered offset list with a single-try CAS.
    /// Concurrent losers free their vector (spec.md §4.6).
    fn publish_offsets(&self, offsets: Vec<usize>) {
        let boxed = Box::into_raw(Box::new(offsets));
        match self.pointer_offsets.compare_exchange(
            std::ptr::null_mut(),
            boxed,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(_) => {
                // someone else published first; drop our copy
                unsafe { drop(Box::from_raw(boxed)) };
            }
        }
    }
}

/// Global registry of `TypeMetadata`, one entry per distinct type ever
/// constructed, created lazily and kept for the process lifetime (spec.md
/// §4.6 lifecycle).
pub struct TypeRegistry {
    entries: Mutex<Vec<&'static TypeMetadata>>,
    next_index: AtomicU32,
}

impl TypeRegistry {
    fn new() -> Self {
        TypeRegistry {
            entries: Mutex::new(Vec::new()),
            next_index: AtomicU32::new(0),
        }
    }

    /// Look up (or create and register) the metadata for `id`.
    pub fn get_or_register(
        &self,
        id: TypeId,
        name: &'static str,
        object_size: usize,
        object_count_per_page: usize,
        destroy: DestroyFn,
    ) -> Result<&'static TypeMetadata, GcError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.iter().find(|m| m.id == id) {
            return Ok(existing);
        }
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        if index >= MAX_TYPE_NUMBER {
            return Err(GcError::TypeTableOverflow {
                max: MAX_TYPE_NUMBER,
            });
        }
        let meta: &'static TypeMetadata = Box::leak(Box::new(TypeMetadata {
            id,
            name,
            object_size,
            object_count_per_page,
            destroy,
            pointer_offsets: AtomicPtr::new(std::ptr::null_mut()),
            type_index: index,
        }));
        entries.push(meta);
        Ok(meta)
    }
}

pub fn registry() -> &'static TypeRegistry {
    static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(TypeRegistry::new)
}

/// One open "under construction" byte range, per spec.md §4.6
/// `alloc_state`. Frames nest (e.g. constructing an array runs the
/// discovery procedure once per element).
struct AllocFrame {
    range: Range<usize>,
    offsets: Vec<usize>,
}

thread_local! {
    static ALLOC_STACK: RefCell<Vec<AllocFrame>> = RefCell::new(Vec::new());
}

/// Open a discovery frame for an object about to be constructed at `obj`.
pub fn begin_discovery(obj: *const u8, size: usize) {
    ALLOC_STACK.with(|stack| {
        stack.borrow_mut().push(AllocFrame {
            range: (obj as usize)..(obj as usize + size),
            offsets: Vec::new(),
        });
    });
}

/// Close the innermost discovery frame, returning the sorted, de-duplicated
/// byte offsets of every `TrackedCell` that registered inside its range.
pub fn end_discovery() -> Vec<usize> {
    ALLOC_STACK.with(|stack| {
        let mut frame = stack
            .borrow_mut()
            .pop()
            .expect("end_discovery without matching begin_discovery");
        frame.offsets.sort_unstable();
        frame.offsets.dedup();
        frame.offsets
    })
}

/// Abandon the innermost discovery frame without returning offsets
/// (construction failed — spec.md §4.7 step 5 "restore alloc_state").
pub fn abort_discovery() {
    ALLOC_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
}

/// If a discovery frame is open and `cell_addr` falls inside its range,
/// record the offset and report `true` (the cell is an embedded field, not
/// a root). Otherwise report `false`.
pub fn try_register_field(cell_addr: usize) -> bool {
    ALLOC_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        if let Some(frame) = stack.last_mut() {
            if frame.range.contains(&cell_addr) {
                frame.offsets.push(cell_addr - frame.range.start);
                return true;
            }
        }
        false
    })
}

/// Publish pointer offsets for `meta` if nobody has done so yet. Called
/// once, right after a type's first successful construction completes
/// (spec.md §4.7 step 6).
pub fn publish_if_unset(meta: &TypeMetadata, offsets: Vec<usize>) {
    if meta.pointer_offsets().is_none() {
        meta.publish_offsets(offsets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy;
    unsafe fn destroy_dummy(_p: *mut u8) {}

    #[test]
    fn registry_assigns_stable_increasing_indices() {
        let reg = TypeRegistry::new();
        let a = reg
            .get_or_register(TypeId::of::<Dummy>(), "Dummy", 8, 100, destroy_dummy)
            .unwrap();
        let b = reg
            .get_or_register(TypeId::of::<Dummy>(), "Dummy", 8, 100, destroy_dummy)
            .unwrap();
        assert_eq!(a.type_index, b.type_index);
    }

    #[test]
    fn registry_rejects_overflow() {
        struct Marker;
        let reg = TypeRegistry::new();
        for i in 0..MAX_TYPE_NUMBER {
            // use distinct TypeIds by faking through a generic wrapper is
            // awkward in a unit test; instead drive next_index directly via
            // repeated registration of genuinely distinct zero-sized types
            // is not feasible without a macro, so we just exercise the
            // counter logic through the index bound directly.
            let _ = i;
        }
        reg.next_index.store(MAX_TYPE_NUMBER, Ordering::SeqCst);
        let err = reg.get_or_register(TypeId::of::<Marker>(), "Marker", 8, 1, destroy_dummy);
        assert!(matches!(err, Err(GcError::TypeTableOverflow { .. })));
    }

    #[test]
    fn discovery_frame_collects_only_in_range_offsets() {
        begin_discovery(0x1000 as *const u8, 64);
        assert!(try_register_field(0x1008));
        assert!(try_register_field(0x1030));
        assert!(!try_register_field(0x2000)); // outside the range
        let offsets = end_discovery();
        assert_eq!(offsets, vec![0x08, 0x30]);
    }

    #[test]
    fn discovery_frame_sorts_and_dedups() {
        begin_discovery(0x1000 as *const u8, 64);
        try_register_field(0x1030);
        try_register_field(0x1008);
        try_register_field(0x1008);
        let offsets = end_discovery();
        assert_eq!(offsets, vec![0x08, 0x30]);
    }

    #[test]
    fn abort_discovery_discards_the_frame() {
        begin_discovery(0x1000 as *const u8, 64);
        try_register_field(0x1008);
        abort_discovery();
        // no frame left, so a fresh field registration outside of any
        // range reports false rather than panicking
        assert!(!try_register_field(0x1008));
    }

    #[test]
    fn publish_is_idempotent() {
        let meta = TypeMetadata {
            id: TypeId::of::<Dummy>(),
            name: "Dummy",
            object_size: 8,
            object_count_per_page: 10,
            destroy: destroy_dummy,
            pointer_offsets: AtomicPtr::new(std::ptr::null_mut()),
            type_index: 0,
        };
        publish_if_unset(&meta, vec![8, 16]);
        publish_if_unset(&meta, vec![0]); // should be ignored
        assert_eq!(meta.pointer_offsets(), Some(&[8usize, 16][..]));
    }
}
