//! The sweep engine.
//!
//! Walks every segment linearly from `start` to `bump`, concatenating
//! adjacent dead objects and stale free blocks into runs. A run flushed
//! mid-segment becomes one free block; a run reaching the bump cursor
//! rolls the cursor back instead. Regular-chain runs feed the size-class
//! lists; pinned-chain runs are formatted in place but never listed. Raw
//! and externally managed heap pages are swept through the page-kind map.

use std::ptr::NonNull;

use page_alloc::{PageKind, PAGE_SIZE};

use crate::heap::GcHeap;
use crate::object::{self, FreeBlock};
use crate::segment::Segment;

/// Byte and object counts produced by one sweep.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub objects_surviving: usize,
    pub bytes_surviving: usize,
}

/// Sweep both segment chains and the page-map heaps. Survivors come out
/// unmarked; the free lists are rebuilt from scratch.
pub(crate) fn sweep_heap(heap: &mut GcHeap) -> SweepStats {
    let mut stats = SweepStats::default();

    let regular: Vec<NonNull<Segment>> = heap.regular.iter().collect();
    for seg in regular {
        // SAFETY: chain nodes are live segments.
        unsafe { sweep_segment(heap, seg, true, &mut stats) };
    }

    let pinned: Vec<NonNull<Segment>> = heap.pinned.iter().collect();
    for seg in pinned {
        // SAFETY: chain nodes are live segments.
        unsafe { sweep_segment(heap, seg, false, &mut stats) };
    }

    sweep_page_heaps(heap, &mut stats);
    stats
}

/// Linear walk of one segment.
///
/// # Safety
///
/// `seg` must be a live segment of `heap`.
unsafe fn sweep_segment(
    heap: &mut GcHeap,
    mut seg: NonNull<Segment>,
    to_free_lists: bool,
    stats: &mut SweepStats,
) {
    // SAFETY: per contract.
    let (start, bump) = {
        let s = unsafe { seg.as_ref() };
        (s.start(), s.bump())
    };
    let sentinel = object::free_sentinel();

    let mut cursor = start;
    let mut run_start: *mut u8 = std::ptr::null_mut();
    let mut run_size = 0usize;
    let mut used = 0usize;
    let mut free_bytes = 0usize;

    let mut flush = |run_start: &mut *mut u8,
                     run_size: &mut usize,
                     heap: &mut GcHeap,
                     free_bytes: &mut usize| {
        if run_start.is_null() {
            return;
        }
        debug_assert!(*run_size >= object::MIN_OBJECT_SIZE);
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: the run covers formerly allocated bytes of this segment.
        unsafe {
            if to_free_lists {
                heap.free_lists
                    .insert(NonNull::new_unchecked(*run_start), *run_size as u32);
            } else {
                object::format_free_block(*run_start, *run_size as u32, std::ptr::null_mut());
            }
        }
        *free_bytes += *run_size;
        *run_start = std::ptr::null_mut();
        *run_size = 0;
    };

    while cursor < bump {
        // SAFETY: cursor stays on entry boundaries inside the walkable
        // interval, except across corrupted cells which advance word-wise.
        let word = unsafe { object::header_word(cursor) };

        if word == sentinel {
            // A stale free block from before this collection; fold it in.
            // SAFETY: sentinel-headed entries are formatted free blocks.
            let size = unsafe { (*cursor.cast::<FreeBlock>()).size } as usize;
            if run_start.is_null() {
                run_start = cursor;
            }
            run_size += size;
            // SAFETY: size keeps the cursor inside the payload.
            cursor = unsafe { cursor.add(size) };
            continue;
        }

        let d = word & !1;
        if d == 0 || heap.is_gc_address(d) || !heap.is_known_descriptor(d) {
            // Neither a valid object nor a free block; a descriptor can
            // never point into the heap, and every real one was seen at
            // allocation. Forward progress only: flush the run and step
            // one word.
            flush(&mut run_start, &mut run_size, heap, &mut free_bytes);
            #[cfg(feature = "tracing")]
            tracing::warn!(addr = cursor as usize, "corrupt_heap_cell");
            // SAFETY: one word forward stays within the payload.
            cursor = unsafe { cursor.add(object::WORD) };
            continue;
        }

        // SAFETY: a validated header implies a readable size.
        let size = unsafe { object::object_size(cursor) };
        if word & 1 != 0 {
            flush(&mut run_start, &mut run_size, heap, &mut free_bytes);
            // SAFETY: live object header.
            unsafe { object::unmark(cursor) };
            used += size;
            stats.objects_surviving += 1;
            stats.bytes_surviving += size;
        } else {
            if run_start.is_null() {
                run_start = cursor;
            }
            run_size += size;
            stats.objects_freed += 1;
            stats.bytes_freed += size;
        }
        // SAFETY: size keeps the cursor inside the payload.
        cursor = unsafe { cursor.add(size) };
    }

    // A run reaching the cursor's end rolls the bump back instead of
    // leaving a trailing free block.
    let mut new_bump = bump;
    if !run_start.is_null() {
        // SAFETY: run_start + run_size is the current cursor position.
        if unsafe { run_start.add(run_size) } >= bump {
            new_bump = run_start;
        } else {
            flush(&mut run_start, &mut run_size, heap, &mut free_bytes);
        }
    }

    // SAFETY: new_bump is an entry boundary of the walk.
    unsafe { seg.as_mut().set_swept_state(new_bump, used, free_bytes) };
}

/// Sweep whole-page-run objects and externally managed heap pages by
/// scanning the page-kind map.
fn sweep_page_heaps(heap: &mut GcHeap, stats: &mut SweepStats) {
    let snapshot: Vec<(usize, PageKind)> = heap
        .pages
        .pages()
        .filter(|(_, kind)| {
            matches!(
                kind,
                PageKind::RawObject
                    | PageKind::ExternalSmall
                    | PageKind::ExternalMedium
                    | PageKind::ExternalLarge
            )
        })
        .collect();

    for (base, kind) in snapshot {
        let obj = base as *mut u8;
        // SAFETY: head pages of these kinds carry an object header at
        // their base, written at allocation time.
        if unsafe { object::is_marked(obj) } {
            // SAFETY: as above.
            unsafe { object::unmark(obj) };
            stats.objects_surviving += 1;
            // SAFETY: as above.
            stats.bytes_surviving += unsafe { object::object_size(obj) };
            continue;
        }
        match kind {
            PageKind::RawObject => {
                // SAFETY: base is the head of a raw object run.
                let pages = heap.pages.free(unsafe { NonNull::new_unchecked(obj) });
                stats.objects_freed += 1;
                stats.bytes_freed += pages * PAGE_SIZE;
            }
            _ => {
                if let Some(free) = heap.external.for_kind(kind) {
                    // SAFETY: the external heap registered this hook for
                    // exactly these pages.
                    unsafe { free(obj) };
                    stats.objects_freed += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::DescBuilder;
    use crate::heap::{GcConfig, Space};
    use crate::object::{is_marked, mark};

    fn heap() -> GcHeap {
        GcHeap::new(GcConfig {
            heap_reserve: 128 * PAGE_SIZE,
            handle_capacity: 64,
            min_segment_pages: 1,
        })
        .expect("failed to reserve test heap")
    }

    #[test]
    fn dead_objects_become_free_blocks_or_rollback() {
        let mut h = heap();
        let d = DescBuilder::object(32).build();
        let a = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let b = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let c = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();

        // Keep b, drop a and c.
        unsafe { mark(b.as_ptr()) };
        let stats = sweep_heap(&mut h);

        assert_eq!(stats.objects_freed, 2);
        assert_eq!(stats.objects_surviving, 1);
        assert!(!unsafe { is_marked(b.as_ptr()) });
        // a became a listed free block; c was trailing and rolled back.
        assert!(unsafe { h.free_lists.contains(a.as_ptr() as usize) });
        assert!(!unsafe { h.free_lists.contains(c.as_ptr() as usize) });
        assert!(h.verify_walkable());
    }

    #[test]
    fn adjacent_dead_objects_coalesce_into_one_run() {
        let mut h = heap();
        let d = DescBuilder::object(32).build();
        let a = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let _b = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let _c = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let keep = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();

        unsafe { mark(keep.as_ptr()) };
        let stats = sweep_heap(&mut h);

        assert_eq!(stats.objects_freed, 3);
        // One 96-byte block, not three 32-byte blocks.
        assert_eq!(unsafe { h.free_lists.total_bytes() }, 96);
        assert!(unsafe { h.free_lists.contains(a.as_ptr() as usize) });
        assert!(h.verify_walkable());
    }

    #[test]
    fn whole_dead_segment_rolls_bump_to_start() {
        let mut h = heap();
        let d = DescBuilder::object(48).build();
        for _ in 0..8 {
            unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        }
        let stats = sweep_heap(&mut h);
        assert_eq!(stats.objects_freed, 8);
        assert_eq!(unsafe { h.free_lists.total_bytes() }, 0);
        let seg = h.regular.iter().next().unwrap();
        let seg = unsafe { seg.as_ref() };
        assert_eq!(seg.bump(), seg.start());
    }

    #[test]
    fn pinned_runs_stay_off_the_free_lists() {
        let mut h = heap();
        let d = DescBuilder::object(32).build();
        let a = unsafe { h.allocate(d, 0, Space::Pinned) }.unwrap();
        let b = unsafe { h.allocate(d, 0, Space::Pinned) }.unwrap();

        unsafe { mark(b.as_ptr()) };
        let stats = sweep_heap(&mut h);

        assert_eq!(stats.objects_freed, 1);
        assert!(!unsafe { h.free_lists.contains(a.as_ptr() as usize) });
        // The dead space is still walkable as an in-place free block.
        assert!(unsafe { object::is_free_block(a.as_ptr()) });
        assert!(h.verify_walkable());
    }

    #[test]
    fn dead_raw_objects_return_their_pages() {
        let mut h = heap();
        let d = DescBuilder::array(16, 1).build();
        let free_before = h.pages.free_page_count();
        let a = unsafe { h.allocate(d, 2 * PAGE_SIZE as u32, Space::Raw) }.unwrap();
        assert!(h.pages.free_page_count() < free_before);

        let stats = sweep_heap(&mut h);
        assert_eq!(stats.objects_freed, 1);
        assert_eq!(h.pages.free_page_count(), free_before);
        assert_eq!(h.pages.kind_of(a.as_ptr() as usize), PageKind::Free);
    }

    #[test]
    fn marked_raw_objects_survive_unmarked() {
        let mut h = heap();
        let d = DescBuilder::array(16, 1).build();
        let a = unsafe { h.allocate(d, PAGE_SIZE as u32, Space::Raw) }.unwrap();
        unsafe { mark(a.as_ptr()) };

        let stats = sweep_heap(&mut h);
        assert_eq!(stats.objects_freed, 0);
        assert!(!unsafe { is_marked(a.as_ptr()) });
        assert_eq!(
            h.pages.run_kind_of(a.as_ptr() as usize),
            PageKind::RawObject
        );
    }

    #[test]
    fn corrupt_header_advances_one_word() {
        let mut h = heap();
        let d = DescBuilder::object(32).build();
        let a = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let b = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();
        let keep = unsafe { h.allocate(d, 0, Space::Regular) }.unwrap();

        // Smash a's header with a pointer into the heap itself: no valid
        // descriptor can live there.
        unsafe {
            a.as_ptr().cast::<usize>().write(b.as_ptr() as usize);
            mark(b.as_ptr());
            mark(keep.as_ptr());
        }
        let stats = sweep_heap(&mut h);
        // b and keep survive; the wrecked cell is skipped, not counted.
        assert_eq!(stats.objects_surviving, 2);
        assert!(!unsafe { is_marked(b.as_ptr()) });
    }
}
