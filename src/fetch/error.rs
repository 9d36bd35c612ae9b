use crate::types::metric::Metric;
use thiserror::Error;

/// How the driver should treat a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Retries exhausted on a network error or retryable status. Skip the window.
    Transient,
    /// Not worth retrying: 4xx, malformed request, unsupported metric.
    Permanent,
    /// The response arrived but its body is not JSON. Handled like a bad payload.
    InvalidBody,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Invalid request for {metric}: {reason}")]
    InvalidRequest { metric: Metric, reason: String },

    #[error("Source does not provide metric '{0}'")]
    UnsupportedMetric(Metric),

    #[error("Network request failed for {url} after {attempts} attempt(s)")]
    Network {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP request failed for {url} with status {status} after {attempts} attempt(s)")]
    RetriesExhausted {
        url: String,
        status: reqwest::StatusCode,
        attempts: u32,
    },

    #[error("HTTP request failed for {url} with status {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Response body from {url} is not valid JSON")]
    InvalidBody {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Network { .. } | FetchError::RetriesExhausted { .. } => {
                FetchErrorKind::Transient
            }
            FetchError::InvalidBody { .. } => FetchErrorKind::InvalidBody,
            FetchError::Client(_)
            | FetchError::InvalidRequest { .. }
            | FetchError::UnsupportedMetric(_)
            | FetchError::HttpStatus { .. } => FetchErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FetchErrorKind::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == FetchErrorKind::Permanent
    }
}
