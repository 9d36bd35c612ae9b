//! Computes the windows the driver requests, walking backward for a backfill
//! and forward for an incremental poll.

use crate::types::window::Window;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Window span must be positive, got {0}")]
    NonPositiveSpan(TimeDelta),

    #[error("Incremental window must cover a positive range (lookback {lookback}, lookahead {lookahead})")]
    EmptyIncrementalRange {
        lookback: TimeDelta,
        lookahead: TimeDelta,
    },
}

/// Lazy sequence of backward windows.
///
/// The anchor starts at the start anchor and moves back by `span` after each
/// window, stopping once it is at or before `stop`. The last window may reach
/// past `stop`; it is not truncated.
#[derive(Debug, Clone)]
pub struct BackwardPlan {
    next_anchor: Option<DateTime<Utc>>,
    stop: DateTime<Utc>,
    span: TimeDelta,
}

impl BackwardPlan {
    pub fn new(
        start_anchor: DateTime<Utc>,
        stop: DateTime<Utc>,
        span: TimeDelta,
    ) -> Result<Self, PlanError> {
        if span <= TimeDelta::zero() {
            return Err(PlanError::NonPositiveSpan(span));
        }
        Ok(Self {
            next_anchor: Some(start_anchor),
            stop,
            span,
        })
    }

    pub fn stop(&self) -> DateTime<Utc> {
        self.stop
    }

    pub fn span(&self) -> TimeDelta {
        self.span
    }

    /// Windows still to be produced.
    pub fn remaining(&self) -> usize {
        let Some(anchor) = self.next_anchor else {
            return 0;
        };
        if anchor <= self.stop {
            return 0;
        }
        let distance = (anchor - self.stop).num_milliseconds();
        let span = self.span.num_milliseconds().max(1);
        ((distance + span - 1) / span) as usize
    }
}

impl Iterator for BackwardPlan {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let anchor = self.next_anchor.filter(|a| *a > self.stop)?;
        self.next_anchor = anchor.checked_sub_signed(self.span);
        Some(Window::backward(anchor, self.span))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BackwardPlan {}

/// The single window re-issued on every poll tick: `[now - lookback, now + lookahead]`.
pub fn incremental_window(
    now: DateTime<Utc>,
    lookback: TimeDelta,
    lookahead: TimeDelta,
) -> Result<Window, PlanError> {
    let span = lookback + lookahead;
    if lookback < TimeDelta::zero() || lookahead < TimeDelta::zero() || span <= TimeDelta::zero() {
        return Err(PlanError::EmptyIncrementalRange {
            lookback,
            lookahead,
        });
    }
    Ok(Window::forward(now - lookback, span))
}
