use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Session counters, updated by the driver and read by the binary.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub windows_fetched: AtomicU64,
    /// `(metric, window)` pairs skipped after a transient failure.
    pub windows_skipped: AtomicU64,
    pub observations_normalized: AtomicU64,
    pub observations_dropped: AtomicU64,
    pub normalization_errors: AtomicU64,
    pub duplicates: AtomicU64,
    pub divergences: AtomicU64,
    pub flush_successes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub points_written: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub permanent_failures: AtomicU64,
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            windows_fetched: get(&self.windows_fetched),
            windows_skipped: get(&self.windows_skipped),
            observations_normalized: get(&self.observations_normalized),
            observations_dropped: get(&self.observations_dropped),
            normalization_errors: get(&self.normalization_errors),
            duplicates: get(&self.duplicates),
            divergences: get(&self.divergences),
            flush_successes: get(&self.flush_successes),
            flush_failures: get(&self.flush_failures),
            points_written: get(&self.points_written),
            retries_exhausted: get(&self.retries_exhausted),
            permanent_failures: get(&self.permanent_failures),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub windows_fetched: u64,
    pub windows_skipped: u64,
    pub observations_normalized: u64,
    pub observations_dropped: u64,
    pub normalization_errors: u64,
    pub duplicates: u64,
    pub divergences: u64,
    pub flush_successes: u64,
    pub flush_failures: u64,
    pub points_written: u64,
    pub retries_exhausted: u64,
    pub permanent_failures: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "windows fetched={} skipped={}, observations normalized={} dropped={}, \
             normalization errors={}, duplicates={} divergences={}, \
             flushes ok={} failed={}, points written={}, \
             retries exhausted={}, permanent failures={}",
            self.windows_fetched,
            self.windows_skipped,
            self.observations_normalized,
            self.observations_dropped,
            self.normalization_errors,
            self.duplicates,
            self.divergences,
            self.flush_successes,
            self.flush_failures,
            self.points_written,
            self.retries_exhausted,
            self.permanent_failures
        )
    }
}
