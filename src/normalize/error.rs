use crate::types::metric::Metric;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("Expected {expected} in {metric} payload, found {found}")]
    UnexpectedShape {
        metric: Metric,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Record {index} of {metric} payload is neither an object nor a [timestamp, value] pair")]
    MalformedRecord { metric: Metric, index: usize },

    #[error("Series '{field}' missing from {metric} payload")]
    MissingSeries { metric: Metric, field: String },

    #[error("Series length mismatch in {metric} payload: {times} timestamps, {values} values")]
    LengthMismatch {
        metric: Metric,
        times: usize,
        values: usize,
    },
}
