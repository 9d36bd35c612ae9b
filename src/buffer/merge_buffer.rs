use crate::buffer::threshold::FlushThreshold;
use crate::types::metric::Metric;
use crate::types::observation::{Observation, TimeRange};
use chrono::{DateTime, Datelike, Utc};
use log::warn;
use std::collections::{btree_map::Entry, BTreeMap, HashMap};
use tokio::time::Instant;

/// Immutable copy of one metric's buffered observations, written to the
/// store as a single unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushUnit {
    pub metric: Metric,
    /// Sorted by ascending timestamp, one entry per timestamp.
    pub observations: Vec<Observation>,
}

impl FlushUnit {
    pub fn new(metric: Metric, mut observations: Vec<Observation>) -> Self {
        observations.sort_by_key(|o| o.timestamp);
        observations.dedup_by_key(|o| o.timestamp);
        Self {
            metric,
            observations,
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn range(&self) -> Option<TimeRange> {
        let first = self.observations.first()?;
        let last = self.observations.last()?;
        Some(TimeRange::new(first.timestamp, last.timestamp))
    }
}

/// What a single [`MergeBuffer::insert`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Timestamps seen for the first time.
    pub inserted: usize,
    /// Re-sent observations identical to the buffered ones.
    pub duplicates: usize,
    /// Re-sent timestamps carrying a different value; the incoming value was kept.
    pub divergences: usize,
}

#[derive(Debug, Default)]
struct MetricSeries {
    points: BTreeMap<DateTime<Utc>, f64>,
    windows: usize,
    first_insert: Option<Instant>,
}

impl MetricSeries {
    fn crosses_month(&self) -> bool {
        match (self.points.keys().next(), self.points.keys().next_back()) {
            (Some(first), Some(last)) => {
                (first.year(), first.month()) != (last.year(), last.month())
            }
            _ => false,
        }
    }
}

/// Per-metric accumulation of observations across windows.
///
/// Each metric's series is kept sorted with at most one value per timestamp.
/// Overlapping windows re-send boundary timestamps; an identical value is a
/// no-op, a different value replaces the buffered one and is counted as a
/// divergence.
#[derive(Debug)]
pub struct MergeBuffer {
    series: HashMap<Metric, MetricSeries>,
    threshold: FlushThreshold,
    duplicates: u64,
    divergences: u64,
}

impl Default for MergeBuffer {
    fn default() -> Self {
        Self::new(FlushThreshold::default())
    }
}

impl MergeBuffer {
    pub fn new(threshold: FlushThreshold) -> Self {
        Self {
            series: HashMap::new(),
            threshold,
            duplicates: 0,
            divergences: 0,
        }
    }

    pub fn threshold(&self) -> &FlushThreshold {
        &self.threshold
    }

    /// Merges one window's observations into the metric's series.
    ///
    /// Every call counts as one window towards [`FlushThreshold::max_windows`],
    /// even when `observations` is empty.
    pub fn insert<I>(&mut self, metric: Metric, observations: I) -> InsertSummary
    where
        I: IntoIterator<Item = Observation>,
    {
        let series = self.series.entry(metric).or_default();
        let mut summary = InsertSummary::default();

        for observation in observations {
            match series.points.entry(observation.timestamp) {
                Entry::Vacant(slot) => {
                    slot.insert(observation.value);
                    summary.inserted += 1;
                }
                Entry::Occupied(mut slot) => {
                    let previous = *slot.get();
                    if previous == observation.value {
                        summary.duplicates += 1;
                    } else {
                        warn!(
                            "Divergent {} value at {}: buffered {} replaced by {}",
                            metric, observation.timestamp, previous, observation.value
                        );
                        slot.insert(observation.value);
                        summary.divergences += 1;
                    }
                }
            }
        }

        series.windows += 1;
        if series.first_insert.is_none() && !series.points.is_empty() {
            series.first_insert = Some(Instant::now());
        }
        self.duplicates += summary.duplicates as u64;
        self.divergences += summary.divergences as u64;
        summary
    }

    pub fn should_flush(&self, metric: Metric) -> bool {
        let Some(series) = self.series.get(&metric) else {
            return false;
        };
        if series.points.is_empty() {
            return false;
        }
        let t = &self.threshold;
        t.max_windows.is_some_and(|max| series.windows >= max)
            || t.max_points.is_some_and(|max| series.points.len() >= max)
            || t
                .max_age
                .zip(series.first_insert)
                .is_some_and(|(max, since)| since.elapsed() >= max)
            || (t.month_boundary && series.crosses_month())
    }

    /// Copies the metric's buffered observations without clearing them.
    pub fn snapshot(&self, metric: Metric) -> Option<FlushUnit> {
        let series = self.series.get(&metric)?;
        if series.points.is_empty() {
            return None;
        }
        let observations = series
            .points
            .iter()
            .map(|(ts, value)| Observation::new(metric, *ts, *value))
            .collect();
        Some(FlushUnit {
            metric,
            observations,
        })
    }

    /// Removes the points of a successfully flushed unit.
    ///
    /// Points replaced after the snapshot was taken are kept for the next
    /// flush. Returns the number of points removed.
    pub fn acknowledge(&mut self, unit: &FlushUnit) -> usize {
        let Some(series) = self.series.get_mut(&unit.metric) else {
            return 0;
        };
        let mut removed = 0;
        for observation in &unit.observations {
            if series.points.get(&observation.timestamp) == Some(&observation.value) {
                series.points.remove(&observation.timestamp);
                removed += 1;
            }
        }
        series.windows = 0;
        series.first_insert = (!series.points.is_empty()).then(Instant::now);
        removed
    }

    /// Value buffered for `metric` at exactly `timestamp`.
    pub fn get(&self, metric: Metric, timestamp: DateTime<Utc>) -> Option<f64> {
        self.series.get(&metric)?.points.get(&timestamp).copied()
    }

    pub fn observations(&self, metric: Metric) -> Vec<Observation> {
        self.snapshot(metric)
            .map(|unit| unit.observations)
            .unwrap_or_default()
    }

    /// Metrics holding at least one point, in stable order.
    pub fn pending_metrics(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .series
            .iter()
            .filter(|(_, s)| !s.points.is_empty())
            .map(|(m, _)| *m)
            .collect();
        metrics.sort();
        metrics
    }

    pub fn len(&self, metric: Metric) -> usize {
        self.series.get(&metric).map_or(0, |s| s.points.len())
    }

    pub fn total_len(&self) -> usize {
        self.series.values().map(|s| s.points.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Windows inserted for `metric` since its last flush.
    pub fn windows(&self, metric: Metric) -> usize {
        self.series.get(&metric).map_or(0, |s| s.windows)
    }

    /// Identical re-sent observations seen over the buffer's lifetime.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Timestamp collisions with differing values seen over the buffer's lifetime.
    pub fn divergences(&self) -> u64 {
        self.divergences
    }
}
