//! Collection metrics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Duration of the last collection.
    pub duration: Duration,
    /// Bytes reclaimed.
    pub bytes_reclaimed: usize,
    /// Bytes surviving.
    pub bytes_surviving: usize,
    /// Objects reclaimed.
    pub objects_reclaimed: usize,
    /// Objects surviving.
    pub objects_surviving: usize,
    /// Collections since process start.
    pub total_collections: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// All-zero metrics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::from_secs(0),
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            total_collections: 0,
        }
    }
}

static LAST_METRICS: Mutex<GcMetrics> = Mutex::new(GcMetrics::new());
static TOTAL_COLLECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Metrics of the last collection.
#[must_use]
pub fn last_gc_metrics() -> GcMetrics {
    *LAST_METRICS.lock()
}

/// Record one finished collection.
pub(crate) fn record_metrics(mut metrics: GcMetrics) {
    metrics.total_collections = TOTAL_COLLECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    *LAST_METRICS.lock() = metrics;
}
