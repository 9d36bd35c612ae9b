use crate::buffer::merge_buffer::FlushUnit;
use crate::sink::error::StoreError;
use crate::sink::Store;
use crate::types::metric::Metric;
use crate::types::observation::{Observation, TimeRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Points = BTreeMap<(Metric, DateTime<Utc>), f64>;

/// In-process store keyed by `(metric, timestamp)`, for dry runs and tests.
///
/// Write and health failures can be injected to exercise retention paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    points: Mutex<Points>,
    writes: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_probes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_points(observations: impl IntoIterator<Item = Observation>) -> Self {
        let store = Self::default();
        if let Ok(mut points) = store.points.lock() {
            points.extend(observations.into_iter().map(|o| (o.key(), o.value)));
        }
        store
    }

    /// Makes the next `n` upserts fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` health probes fail.
    pub fn fail_next_probes(&self, n: usize) {
        self.failing_probes.store(n, Ordering::SeqCst);
    }

    /// Successful upserts so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Points {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn observations(&self, metric: Metric) -> Vec<Observation> {
        self.snapshot()
            .into_iter()
            .filter(|((m, _), _)| *m == metric)
            .map(|((m, ts), v)| Observation::new(m, ts, v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.lock().map(|p| p.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Rejected(format!(
                "injected failure for {} points of {}",
                unit.len(),
                unit.metric
            )));
        }
        let mut points = self
            .points
            .lock()
            .map_err(|_| StoreError::Rejected("memory store poisoned".to_string()))?;
        for observation in &unit.observations {
            points.insert((unit.metric, observation.timestamp), observation.value);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(unit.len())
    }

    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError> {
        let points = self
            .points
            .lock()
            .map_err(|_| StoreError::Rejected("memory store poisoned".to_string()))?;
        Ok(points.keys().any(|(_, ts)| range.contains(*ts)))
    }

    async fn health(&self) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_probes) {
            return Err(StoreError::Unhealthy("injected probe failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn unit() -> FlushUnit {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        FlushUnit::new(
            Metric::Temperature,
            (0..24)
                .map(|h| Observation::new(Metric::Temperature, t0 + TimeDelta::hours(h), h as f64))
                .collect(),
        )
    }

    #[tokio::test]
    async fn flushing_twice_yields_identical_state() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let unit = unit();

        store.upsert(&unit).await?;
        let once = store.snapshot();
        store.upsert(&unit).await?;
        let twice = store.snapshot();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 24);
        assert_eq!(store.write_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn injected_write_failure_leaves_state_untouched() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.upsert(&unit()).await.is_err());
        assert!(store.is_empty());
        store.upsert(&unit()).await?;
        assert_eq!(store.len(), 24);
        Ok(())
    }

    #[tokio::test]
    async fn coverage_reflects_stored_range() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let jan = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap(),
        );
        assert!(!store.has_coverage(jan).await?);
        store.upsert(&unit()).await?;
        assert!(store.has_coverage(jan).await?);
        let feb = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap(),
        );
        assert!(!store.has_coverage(feb).await?);
        Ok(())
    }
}
