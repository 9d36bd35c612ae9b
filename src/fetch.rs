//! Retrieves one raw payload per `(metric, window)`.

pub mod error;
pub mod http_fetcher;
pub mod retry;
pub mod source;

use crate::fetch::error::FetchError;
use crate::normalize::PayloadShape;
use crate::types::metric::Metric;
use crate::types::window::Window;
use async_trait::async_trait;

/// A decoded response body and the shape it should be normalized with.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub body: serde_json::Value,
    pub shape: PayloadShape,
}

#[async_trait]
pub trait Fetch: Send + Sync {
    /// Name of the upstream source, used to tag stored points.
    fn source_name(&self) -> &str;

    fn supports(&self, metric: Metric) -> bool;

    /// Issues the request for one metric and window. Network I/O only.
    async fn fetch(&self, metric: Metric, window: &Window) -> Result<RawPayload, FetchError>;
}
