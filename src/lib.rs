mod buffer;
mod config;
mod derive;
mod driver;
mod error;
mod fetch;
mod normalize;
mod planner;
mod sink;
mod types;
mod utils;

#[cfg(test)]
mod test_support;

pub use error::IngestError;

pub use types::metric::{Metric, UnknownMetric};
pub use types::observation::{Observation, TimeRange};
pub use types::window::{Direction, Window};

pub use planner::{incremental_window, BackwardPlan, PlanError};

pub use fetch::error::{FetchError, FetchErrorKind};
pub use fetch::http_fetcher::HttpFetcher;
pub use fetch::retry::RetryPolicy;
pub use fetch::source::{AnySource, ChartsSource, ForecastSource, Source, SourceRequest};
pub use fetch::{Fetch, RawPayload};

pub use normalize::error::NormalizeError;
pub use normalize::timestamp::parse_timestamp;
pub use normalize::{normalize, Normalized, PayloadShape};

pub use buffer::merge_buffer::{FlushUnit, InsertSummary, MergeBuffer};
pub use buffer::threshold::FlushThreshold;

pub use sink::error::StoreError;
pub use sink::flusher::Flusher;
pub use sink::influx_store::InfluxStore;
pub use sink::memory_store::MemoryStore;
pub use sink::parquet_store::ParquetStore;
pub use sink::{AnyStore, Store};

pub use derive::{derive_wind_chill, wind_chill};

pub use driver::error::DriverError;
pub use driver::readiness::{await_ready, Ready, ReadinessPolicy};
pub use driver::state::DriverState;
pub use driver::stats::{IngestStats, StatsSnapshot};
pub use driver::{BackfillReport, BackfillSettings, Driver, PollOutcome, PollSettings};

pub use crate::config::error::ConfigError;
pub use crate::config::{
    BackfillConfig, DeriveConfig, DestinationConfig, DestinationKind, IngestConfig, PollConfig,
    SourceConfig, SourceKind,
};

pub use utils::default_data_dir;
