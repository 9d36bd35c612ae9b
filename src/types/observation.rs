use crate::types::metric::Metric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One measured value of a metric at an instant.
///
/// Identified by `(metric, timestamp)`. A later observation with the same key
/// supersedes an earlier one, it is never merged with it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
}

impl Observation {
    pub fn new(metric: Metric, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            metric,
            value,
        }
    }

    pub fn key(&self) -> (Metric, DateTime<Utc>) {
        (self.metric, self.timestamp)
    }
}

/// Inclusive time range `[start, end]` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ranges_touching_at_an_edge_overlap() {
        let a = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(),
        );
        let b = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap(),
        );
        let c = TimeRange::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 2, 0, 0, 0).unwrap(),
        );
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(a.contains(a.end));
    }
}
