//! Stop-the-world collection.
//!
//! `collect` runs the full cycle under the global heap lock with
//! interrupts masked: clear the free lists, mark from conservative and
//! handle roots, settle dependent handles to a fixpoint, null dead weak
//! targets, sweep every space, reorder the chains, and recompute the heap
//! bounds. Nothing inside the cycle blocks.

pub(crate) mod mark;
pub(crate) mod sweep;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::handles::{HandleKind, HandleSlot};
use crate::heap::{self, Candidate, GcHeap, Space};
use crate::interrupts;
use crate::metrics::{self, GcMetrics};
use crate::object;
use crate::roots;

use mark::Marker;

// ============================================================================
// Collection trigger
// ============================================================================

/// Heap snapshot handed to the collection condition.
#[derive(Debug, Clone, Copy)]
pub struct CollectInfo {
    /// Objects allocated since the last collection finished.
    pub allocs_since_collect: usize,
    /// Bytes allocated since the last collection finished.
    pub bytes_since_collect: usize,
    /// Total bytes currently held in heap segments.
    pub heap_bytes: usize,
}

/// Decides whether the allocator should collect before growing the heap.
pub type CollectCondition = fn(&CollectInfo) -> bool;

/// Collect before growth once a meaningful amount of allocation happened
/// since the previous cycle.
#[must_use]
pub fn default_collect_condition(info: &CollectInfo) -> bool {
    info.bytes_since_collect > 1024 * 1024
}

static COLLECT_CONDITION: Mutex<CollectCondition> = Mutex::new(default_collect_condition);
static IN_COLLECT: AtomicBool = AtomicBool::new(false);

/// Install the function deciding when the allocator collects before
/// growing the heap.
pub fn set_collect_condition(f: CollectCondition) {
    *COLLECT_CONDITION.lock() = f;
}

/// Whether a collection is currently running.
#[must_use]
pub fn is_collecting() -> bool {
    IN_COLLECT.load(Ordering::Acquire)
}

pub(crate) fn should_collect_before_grow(heap: &GcHeap) -> bool {
    if is_collecting() {
        return false;
    }
    let info = CollectInfo {
        allocs_since_collect: heap.allocs_since_collect(),
        bytes_since_collect: heap.bytes_since_collect(),
        heap_bytes: heap.heap_bytes(),
    };
    (*COLLECT_CONDITION.lock())(&info)
}

// ============================================================================
// Registered roots
// ============================================================================

static TEST_ROOTS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Register a single root address for marking. Deterministic substitute
/// for conservative stack scanning in tests.
pub fn register_test_root(ptr: *const u8) {
    TEST_ROOTS.lock().push(ptr as usize);
}

/// Drop all registered test roots.
pub fn clear_test_roots() {
    TEST_ROOTS.lock().clear();
}

pub(crate) fn test_roots_snapshot() -> Vec<usize> {
    TEST_ROOTS.lock().clone()
}

// ============================================================================
// Collection
// ============================================================================

/// Run one full collection on the global heap. Returns the number of
/// objects freed; zero when the heap is uninitialized or a collection is
/// already running.
pub fn collect() -> usize {
    heap::try_with_heap(collect_locked).unwrap_or(0)
}

/// The collection cycle, entered with the heap lock held.
pub(crate) fn collect_locked(heap: &mut GcHeap) -> usize {
    if IN_COLLECT.swap(true, Ordering::AcqRel) {
        return 0;
    }
    let started = Instant::now();
    let _masked = interrupts::disable();
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("collect").entered();

    heap.free_lists.clear();

    let marked = {
        let mut marker = Marker::new(heap);
        roots::scan_roots(&mut marker);
        settle_dependent_handles(&mut marker);
        marker.marked_count()
    };
    #[cfg(feature = "tracing")]
    tracing::debug!(marked, "mark_done");

    clear_dead_handles(heap);

    let stats = sweep::sweep_heap(heap);
    #[cfg(feature = "tracing")]
    tracing::debug!(
        freed = stats.objects_freed,
        bytes = stats.bytes_freed,
        "sweep_done"
    );

    heap.reorder_segments(Space::Regular);
    heap.reorder_segments(Space::Pinned);
    heap.recompute_bounds();
    heap.reset_alloc_counters();

    metrics::record_metrics(GcMetrics {
        duration: started.elapsed(),
        bytes_reclaimed: stats.bytes_freed,
        bytes_surviving: stats.bytes_surviving,
        objects_reclaimed: stats.objects_freed,
        objects_surviving: stats.objects_surviving,
        total_collections: 0,
    });

    IN_COLLECT.store(false, Ordering::Release);
    stats.objects_freed
}

/// Dependent handles to a fixpoint: a secondary becomes a root exactly
/// when its primary has been proven live, and marking the secondary can
/// make further primaries live.
fn settle_dependent_handles(marker: &mut Marker<'_>) {
    loop {
        let pairs: Vec<(usize, usize)> = marker
            .heap()
            .handles
            .occupied()
            .filter(|(_, kind)| *kind == HandleKind::Dependent)
            .map(|(slot, _)| {
                // SAFETY: occupied slots are live table entries.
                let s = unsafe { &*slot.as_ptr() };
                (s.target as usize, s.extra as usize)
            })
            .collect();

        let before = marker.marked_count();
        for (primary, secondary) in pairs {
            if secondary != 0 && marker.is_live(primary) {
                marker.consider(secondary);
            }
        }
        marker.drain();
        if marker.marked_count() == before {
            return;
        }
    }
}

/// Null the targets of weak handles whose referent went unmarked, and
/// both fields of dependent handles whose primary went unmarked.
fn clear_dead_handles(heap: &mut GcHeap) {
    let slots: Vec<(NonNull<HandleSlot>, HandleKind)> = heap.handles.occupied().collect();
    for (slot, kind) in slots {
        // SAFETY: occupied slots are live table entries; the table is
        // exclusively ours under &mut.
        let s = unsafe { &mut *slot.as_ptr() };
        let dead = match heap.classify_candidate(s.target as usize) {
            // SAFETY: classified object starts have readable headers.
            Candidate::Object(obj) => !unsafe { object::is_marked(obj.as_ptr()) },
            Candidate::Frozen => false,
            // A weak target outside the managed spaces is never cleared.
            Candidate::Reject => false,
        };
        if !dead {
            continue;
        }
        match kind {
            HandleKind::Weak => s.target = std::ptr::null_mut(),
            HandleKind::Dependent => {
                s.target = std::ptr::null_mut();
                s.extra = std::ptr::null_mut();
            }
            HandleKind::Strong | HandleKind::Pinned => {
                // Strong and pinned targets were roots; an unmarked one
                // can only mean the slot was written mid-cycle. Leave it.
            }
        }
    }
}
