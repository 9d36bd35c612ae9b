use crate::fetch::error::FetchError;
use crate::planner::PlanError;
use crate::sink::error::StoreError;
use crate::types::metric::Metric;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Destination not ready after {attempts} attempt(s)")]
    ReadinessTimeout {
        attempts: u32,
        #[source]
        last: StoreError,
    },

    #[error("Permanent fetch failure for {metric} at window {window}")]
    PermanentFetch {
        metric: Metric,
        window: String,
        #[source]
        source: FetchError,
    },

    #[error("Failed to persist buffered {metric} observations")]
    Persistence {
        metric: Metric,
        #[source]
        source: StoreError,
    },

    #[error("Coverage query against the destination failed")]
    Coverage(#[source] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Stopped before the destination became ready")]
    Cancelled,
}
