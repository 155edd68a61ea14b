//! Structural invariants that must hold after arbitrary interleavings of
//! allocation and collection.

use kiln_gc::api::{self, ALLOC_PINNED};
use kiln_gc::heap::with_heap;
use kiln_gc::{test_util, DescBuilder, GcConfig, TypeDesc, MIN_OBJECT_SIZE};

fn begin() -> impl Drop {
    let guard = test_util::serial();
    test_util::reset_with(GcConfig {
        heap_reserve: 8 << 20,
        handle_capacity: 256,
        min_segment_pages: 1,
    });
    test_util::set_stack_scan_enabled(false);
    guard
}

const STRONG: u32 = 1;

fn churn(descs: &[&'static TypeDesc], rounds: usize, keep_every: usize) -> Vec<*mut u8> {
    let mut kept = Vec::new();
    for i in 0..rounds {
        let d = descs[i % descs.len()];
        let p = unsafe { api::alloc_object_fast(d) };
        assert!(!p.is_null());
        if i % keep_every == 0 {
            api::handle_alloc(p, STRONG);
            kept.push(p);
        }
    }
    kept
}

#[test]
fn segments_stay_walkable_through_collection_cycles() {
    let _gc = begin();
    let descs = [
        DescBuilder::object(24).build(),
        DescBuilder::object(56).build(),
        DescBuilder::object(200).build(),
    ];

    for _ in 0..4 {
        churn(&descs, 300, 7);
        assert!(with_heap(|h| h.verify_walkable()));
        api::collect();
        assert!(with_heap(|h| h.verify_walkable()));
    }
}

#[test]
fn no_object_is_marked_after_collection() {
    let _gc = begin();
    let descs = [
        DescBuilder::object(32).build(),
        DescBuilder::object(96).build(),
    ];
    let kept = churn(&descs, 100, 3);

    api::collect();
    for p in kept {
        assert!(!unsafe { kiln_gc::object::is_marked(p) });
    }
}

#[test]
fn bounding_box_covers_every_live_object() {
    let _gc = begin();
    let descs = [
        DescBuilder::object(40).build(),
        DescBuilder::object(512).build(),
    ];
    let kept = churn(&descs, 200, 5);
    let pinned = unsafe { api::alloc_with_flags(descs[0], 0, ALLOC_PINNED) };
    api::handle_alloc(pinned, 2);

    api::collect();
    let (min, max) = with_heap(|h| h.bounds());
    assert!(min < max);
    for p in kept.iter().chain(std::iter::once(&pinned)) {
        let addr = *p as usize;
        assert!(min <= addr && addr < max);
    }
}

#[test]
fn reclaimed_space_returns_through_the_free_lists() {
    let _gc = begin();
    let d = DescBuilder::object(64).build();

    // keep, drop, keep, drop... leaves interior holes that must be listed.
    let mut dropped = Vec::new();
    for i in 0..40 {
        let p = unsafe { api::alloc_object_fast(d) };
        if i % 2 == 0 {
            api::handle_alloc(p, STRONG);
        } else {
            dropped.push(p);
        }
    }
    // A kept tail so every hole is interior; a trailing hole would be
    // reclaimed by bump rollback instead of the lists.
    let tail = unsafe { api::alloc_object_fast(d) };
    api::handle_alloc(tail, STRONG);
    api::collect();

    let free_bytes = with_heap(|h| h.free_list_bytes());
    assert_eq!(free_bytes, dropped.len() * 64);
    for p in &dropped {
        assert!(with_heap(|h| h.free_list_contains(*p as usize)));
    }
}

#[test]
fn empty_multi_page_segments_go_back_to_the_page_source() {
    let _gc = begin();
    // Objects big enough to force multi-page segments.
    let d = DescBuilder::object(3 * 4096).build();
    let before = with_heap(|h| h.segment_counts().0);
    for _ in 0..4 {
        assert!(!unsafe { api::alloc_object_fast(d) }.is_null());
    }
    assert!(with_heap(|h| h.segment_counts().0) >= before + 4);

    api::collect();
    // All four segments emptied and, being multi-page, were returned.
    assert_eq!(with_heap(|h| h.segment_counts().0), before);
}

#[test]
fn allocation_failure_is_a_null_not_a_crash() {
    let _gc = begin();
    let d = DescBuilder::array(16, 1).build();
    // Larger than the whole reserve.
    let p = unsafe { api::alloc_array(d, 16 << 20) };
    assert!(p.is_null());
    // The heap stays usable.
    let ok = unsafe { api::alloc_object_fast(DescBuilder::object(32).build()) };
    assert!(!ok.is_null());
}

#[test]
fn minimum_block_size_covers_the_free_block_header() {
    assert_eq!(MIN_OBJECT_SIZE, 24);
}

#[test]
fn collection_is_idempotent_on_a_quiet_heap() {
    let _gc = begin();
    let d = DescBuilder::object(32).build();
    let a = unsafe { api::alloc_object_fast(d) };
    api::handle_alloc(a, STRONG);

    api::collect();
    let counts = with_heap(|h| h.segment_counts());
    assert_eq!(api::collect(), 0);
    assert_eq!(with_heap(|h| h.segment_counts()), counts);
    assert_eq!(api::handle_get(api::handle_alloc(a, STRONG)), a);
}
