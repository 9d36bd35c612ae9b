use std::time::Duration;

/// Limits after which a metric's buffer is due for a flush.
///
/// A limit left at `None` (or `false`) is not checked. An empty buffer is never due.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushThreshold {
    /// Windows inserted since the last flush.
    pub max_windows: Option<usize>,
    /// Distinct buffered timestamps.
    pub max_points: Option<usize>,
    /// Time since the first insert after the last flush.
    pub max_age: Option<Duration>,
    /// Flush once the buffered range spans two calendar months (UTC).
    pub month_boundary: bool,
}

impl Default for FlushThreshold {
    fn default() -> Self {
        Self {
            max_windows: Some(4),
            max_points: None,
            max_age: None,
            month_boundary: false,
        }
    }
}

impl FlushThreshold {
    /// Due after every insert.
    pub fn immediate() -> Self {
        Self {
            max_windows: Some(1),
            max_points: None,
            max_age: None,
            month_boundary: false,
        }
    }

    pub fn with_max_windows(mut self, windows: Option<usize>) -> Self {
        self.max_windows = windows;
        self
    }

    pub fn with_max_points(mut self, points: Option<usize>) -> Self {
        self.max_points = points;
        self
    }

    pub fn with_max_age(mut self, age: Option<Duration>) -> Self {
        self.max_age = age;
        self
    }

    pub fn with_month_boundary(mut self, enabled: bool) -> Self {
        self.month_boundary = enabled;
        self
    }
}
