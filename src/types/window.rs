use crate::types::observation::TimeRange;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The window ends at its anchor: `[anchor - span, anchor]`.
    Backward,
    /// The window starts at its anchor: `[anchor, anchor + span]`.
    Forward,
}

/// The time range of one fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub anchor: DateTime<Utc>,
    pub span: TimeDelta,
    pub direction: Direction,
}

impl Window {
    pub fn backward(anchor: DateTime<Utc>, span: TimeDelta) -> Self {
        Self {
            anchor,
            span,
            direction: Direction::Backward,
        }
    }

    pub fn forward(anchor: DateTime<Utc>, span: TimeDelta) -> Self {
        Self {
            anchor,
            span,
            direction: Direction::Forward,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        match self.direction {
            Direction::Backward => self.anchor - self.span,
            Direction::Forward => self.anchor,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self.direction {
            Direction::Backward => self.anchor,
            Direction::Forward => self.anchor + self.span,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start(), self.end())
    }

    /// Span in whole days, rounded up. Never less than one.
    pub fn span_days(&self) -> i64 {
        let secs = self.span.num_seconds().max(1);
        ((secs + 86_399) / 86_400).max(1)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            self.start().format("%Y-%m-%dT%H:%MZ"),
            self.end().format("%Y-%m-%dT%H:%MZ")
        )
    }
}
