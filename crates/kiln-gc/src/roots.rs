//! Root discovery.
//!
//! Three root sources feed the marker: registered static-root regions
//! (module statics emitted by the compiler, plus test roots), the handle
//! table's strong and pinned projections, and the conservative scan of
//! the current stack and spilled registers. Dependent-handle secondaries
//! are not roots here; they join during the fixpoint pass once their
//! primaries are proven live.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::gc::mark::Marker;
use crate::handles::HandleKind;
use crate::object::WORD;
use crate::stack;

static STACK_SCAN_ENABLED: AtomicBool = AtomicBool::new(true);

/// Toggle the conservative stack scan. A kernel embedding whose scheduler
/// reports per-thread extents replaces the current-stack scan with
/// registered regions; tests disable it for deterministic death
/// expectations.
pub fn set_stack_scan_enabled(enabled: bool) {
    STACK_SCAN_ENABLED.store(enabled, Ordering::Release);
}

#[must_use]
pub fn stack_scan_enabled() -> bool {
    STACK_SCAN_ENABLED.load(Ordering::Acquire)
}

/// Feed every pointer-aligned word of `[start, start + len)` to the
/// marker as a candidate.
fn scan_region(marker: &mut Marker<'_>, start: usize, len: usize) {
    let mut current = (start + WORD - 1) & !(WORD - 1);
    let end = start + len;
    while current + WORD <= end {
        // SAFETY: registered root regions are live statics.
        let word = unsafe { (current as *const usize).read() };
        marker.consider(word);
        current += WORD;
    }
}

/// Run every root source and drain the marker.
pub(crate) fn scan_roots(marker: &mut Marker<'_>) {
    for (start, len) in marker.heap().static_roots().to_vec() {
        scan_region(marker, start, len);
    }

    for addr in crate::gc::test_roots_snapshot() {
        marker.consider(addr);
    }

    let handle_targets: Vec<usize> = marker
        .heap()
        .handles
        .occupied()
        .filter(|(_, kind)| matches!(kind, HandleKind::Strong | HandleKind::Pinned))
        // SAFETY: occupied slots are live table entries.
        .map(|(slot, _)| unsafe { (*slot.as_ptr()).target } as usize)
        .collect();
    for target in handle_targets {
        marker.consider(target);
    }

    if stack_scan_enabled() {
        // SAFETY: we run on the mutator's thread with the heap lock held
        // and interrupts masked; no frame below mutates the heap.
        unsafe {
            stack::spill_registers_and_scan(|word| marker.consider(word));
        }
    }

    marker.drain();
}
