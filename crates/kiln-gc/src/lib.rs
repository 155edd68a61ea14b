//! Stop-the-world mark-sweep heap for an ahead-of-time compiled managed
//! kernel runtime.
//!
//! The heap serves a managed language runtime on a single CPU with
//! globally maskable interrupts. Objects carry their type descriptor in
//! the header word, with bit 0 doubling as the mark flag; collection is
//! one bounded stop-the-world cycle: mark from conservative and handle
//! roots, null dead weak handles, sweep every space back onto
//! size-classed free lists, reorder the segment chains, and return empty
//! segments to the page source.
//!
//! # Spaces
//!
//! - **Regular**: bump-plus-free-list segments, the default.
//! - **Pinned**: a separate chain whose objects never move and whose dead
//!   space is reclaimed only at the bump cursor.
//! - **Raw**: whole page runs for large buffers, swept via the page map.
//! - **Frozen**: compiler-emitted read-only regions, registered but never
//!   collected.
//!
//! # Quick start
//!
//! ```no_run
//! use kiln_gc::{gc_init, GcConfig, DescBuilder};
//!
//! gc_init(GcConfig::default()).expect("heap reservation failed");
//!
//! let point = DescBuilder::object(32).build();
//! let p = unsafe { kiln_gc::api::alloc_object_fast(point) };
//! assert!(!p.is_null());
//!
//! let freed = kiln_gc::collect();
//! let _ = freed;
//! ```

pub mod api;
pub mod desc;
pub mod frozen;
pub mod gc;
pub mod handles;
pub mod heap;
pub mod interrupts;
mod metrics;
mod roots;
mod stack;

/// Object header codec; public so runtime glue and tests can inspect the
/// documented layout.
pub mod object;

pub mod freelist;
pub mod segment;

pub use desc::{DescBuilder, PtrSpan, TypeDesc};
pub use frozen::FrozenId;
pub use gc::{
    collect, default_collect_condition, is_collecting, set_collect_condition, CollectCondition,
    CollectInfo,
};
pub use handles::{HandleKind, HandleSlot};
pub use heap::{gc_init, is_initialized, GcConfig, GcHeap, Space};
pub use metrics::{last_gc_metrics, GcMetrics};
pub use object::{MIN_OBJECT_SIZE, WORD};

#[doc(hidden)]
pub mod test_util {
    //! Deterministic helpers for collection tests.

    use parking_lot::{Mutex, MutexGuard};

    pub use crate::gc::{clear_test_roots, register_test_root};
    pub use crate::roots::{set_stack_scan_enabled, stack_scan_enabled};

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that touch the global heap.
    #[must_use]
    pub fn serial() -> MutexGuard<'static, ()> {
        TEST_LOCK.lock()
    }

    /// Reset all global collector state: fresh heap, no test roots.
    pub fn reset() {
        reset_with(crate::GcConfig::default())
    }

    /// Reset with explicit parameters.
    pub fn reset_with(config: crate::GcConfig) {
        crate::heap::reinit_for_testing(config);
        clear_test_roots();
    }
}
