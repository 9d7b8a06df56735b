//! Scenario E — shutdown quiescence (spec.md §8). Kept in its own test
//! binary: `collector::request_shutdown` flips a process-global, one-way
//! abort flag, which would otherwise stop collection for every other test
//! sharing this process.

use std::any::TypeId;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crucible_gc::{collector, make_tracked, type_registry, DestroyFn, GcConfig, TrackedCell, TypeMetadata};

#[repr(C)]
struct Node {
    value: u64,
    next: TrackedCell<Node>,
}

fn build_node(meta: &'static TypeMetadata, config: &GcConfig, value: u64) -> *mut Node {
    make_tracked::<Node>(meta, |p| {
        unsafe {
            (*p).value = value;
            let field_addr = &(*p).next as *const TrackedCell<Node> as *const ();
            ptr::write(
                &mut (*p).next as *mut TrackedCell<Node>,
                TrackedCell::new(field_addr, ptr::null_mut(), config),
            );
        }
        Ok(())
    })
    .unwrap()
}

fn make_root(config: &GcConfig) -> Box<TrackedCell<Node>> {
    let mut boxed: Box<MaybeUninit<TrackedCell<Node>>> = Box::new(MaybeUninit::uninit());
    let addr = boxed.as_ptr() as *const ();
    unsafe {
        boxed
            .as_mut_ptr()
            .write(TrackedCell::new(addr, ptr::null_mut(), config));
        std::mem::transmute(boxed)
    }
}

struct MarkerE;
static DESTROYED_E: AtomicUsize = AtomicUsize::new(0);
unsafe fn destroy_e(_p: *mut u8) {
    DESTROYED_E.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn abort_drains_to_quiescence_within_the_finalisation_budget() {
    let meta = type_registry()
        .get_or_register(
            TypeId::of::<(Node, MarkerE)>(),
            "ScenarioENode",
            std::mem::size_of::<Node>(),
            4,
            destroy_e as DestroyFn,
        )
        .unwrap();
    let config = GcConfig::default();

    {
        let root = make_root(&config);
        let a = build_node(meta, &config, 1);
        let b = build_node(meta, &config, 2);
        unsafe {
            (*a).next.store(b);
            (*b).next.store(a);
        }
        root.store_atomic(a);
        // root drops at the end of this block, unrooting the whole cycle.
    }

    collector::request_shutdown();

    // give the background collector thread room to run its bounded
    // finalisation tail (at most `MAX_FINALISATION_CYCLES` cycles).
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while DESTROYED_E.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(
        DESTROYED_E.load(Ordering::SeqCst),
        2,
        "both unrooted nodes must be destroyed during the shutdown tail"
    );
}
