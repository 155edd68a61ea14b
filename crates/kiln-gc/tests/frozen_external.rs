//! Frozen-segment semantics and externally managed heap sweeping.

use std::sync::atomic::{AtomicUsize, Ordering};

use kiln_gc::api;
use kiln_gc::heap::with_heap;
use kiln_gc::{test_util, DescBuilder, GcConfig};
use page_alloc::{PageKind, PAGE_SIZE};

fn begin() -> impl Drop {
    let guard = test_util::serial();
    test_util::reset_with(GcConfig {
        heap_reserve: 4 << 20,
        handle_capacity: 64,
        min_segment_pages: 1,
    });
    test_util::set_stack_scan_enabled(false);
    guard
}

const STRONG: u32 = 1;

/// A pre-initialized read-only region the way the compiler would emit it:
/// leaked, outside the managed heap.
fn frozen_region(len: usize) -> &'static mut [u8] {
    Vec::leak(vec![0xC3u8; len])
}

#[test]
fn marking_stops_cleanly_at_frozen_targets() {
    let _gc = begin();
    let region = frozen_region(256);
    let frozen_addr = region.as_ptr() as usize;
    let id = api::frozen_register(region.as_mut_ptr(), 256, 256, 256);
    assert_ne!(id, 0);

    // A live object whose only reference field points into the frozen
    // segment.
    let node = DescBuilder::object(32).with_pointer_spans(&[(16, 1)]).build();
    let a = unsafe { api::alloc_object_fast(node) };
    unsafe { a.add(16).cast::<usize>().write(frozen_addr + 16) };
    let root = api::handle_alloc(a, STRONG);

    let freed = api::collect();
    assert_eq!(freed, 0);
    assert_eq!(api::handle_get(root), a);

    // The collector never touched the frozen bytes and never listed them.
    assert!(region.iter().all(|b| *b == 0xC3));
    assert!(with_heap(|h| !h.free_list_contains(frozen_addr)));
    assert!(with_heap(|h| h.frozen_contains(frozen_addr + 16)));
}

#[test]
fn frozen_update_extends_the_recognized_range() {
    let _gc = begin();
    let region = frozen_region(4096);
    let base = region.as_ptr() as usize;
    let id = api::frozen_register(region.as_mut_ptr(), 1024, 4096, 4096);

    assert!(with_heap(|h| h.frozen_contains(base + 512)));
    assert!(with_heap(|h| !h.frozen_contains(base + 2048)));

    api::frozen_update(id, 4096, 4096);
    assert!(with_heap(|h| h.frozen_contains(base + 2048)));
}

static EXT_FREED: AtomicUsize = AtomicUsize::new(0);

fn ext_free(_obj: *mut u8) {
    EXT_FREED.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn external_heap_pages_are_swept_by_page_kind() {
    let _gc = begin();
    EXT_FREED.store(0, Ordering::Relaxed);
    let d = DescBuilder::object(64).build();

    let (dead, live) = with_heap(|h| {
        h.register_descriptor(d);
        assert!(h.register_external_heap(PageKind::ExternalSmall, ext_free));

        let dead = h.alloc_external_pages(PageKind::ExternalSmall, 1).unwrap();
        let live = h.alloc_external_pages(PageKind::ExternalSmall, 1).unwrap();
        // The external heap formats its own object headers.
        unsafe {
            kiln_gc::object::init_header(dead.as_ptr(), d, 0);
            kiln_gc::object::init_header(live.as_ptr(), d, 0);
        }
        (dead.as_ptr(), live.as_ptr())
    });

    test_util::register_test_root(live);
    api::collect();

    // The unreferenced external object went through the registered hook;
    // the rooted one survived untouched.
    assert_eq!(EXT_FREED.load(Ordering::Relaxed), 1);
    assert!(!unsafe { kiln_gc::object::is_marked(live) });
    let _ = dead;
}

#[test]
fn raw_page_objects_live_and_die_by_the_page_map() {
    let _gc = begin();
    let d = DescBuilder::array(16, 1).build();

    let live = unsafe { api::alloc_with_flags(d, PAGE_SIZE as u32, api::ALLOC_RAW) };
    let dead = unsafe { api::alloc_with_flags(d, PAGE_SIZE as u32, api::ALLOC_RAW) };
    assert_eq!(live as usize % PAGE_SIZE, 0);
    test_util::register_test_root(live);

    let freed = api::collect();
    assert!(freed >= 1);
    assert!(with_heap(|h| {
        h.verify_walkable()
    }));
    // The dead run's pages went back to the source; the live one kept its
    // tag.
    assert_eq!(
        with_heap(|h| h.page_kind_of(dead as usize)),
        PageKind::Free
    );
    assert_eq!(
        with_heap(|h| h.page_kind_of(live as usize)),
        PageKind::RawObject
    );
}
