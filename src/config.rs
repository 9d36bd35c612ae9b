//! Runtime configuration, resolved once at startup from an optional TOML file
//! and `INGEST_*` environment variables.
//!
//! Nested keys use a double underscore in the environment, for example
//! `INGEST_DESTINATION__TOKEN` or `INGEST_POLL__INTERVAL_SECS`.

pub mod error;

use crate::buffer::threshold::FlushThreshold;
use crate::config::error::ConfigError;
use crate::driver::readiness::ReadinessPolicy;
use crate::driver::{BackfillSettings, PollSettings};
use crate::fetch::http_fetcher::HttpFetcher;
use crate::fetch::retry::RetryPolicy;
use crate::fetch::source::{AnySource, ChartsSource, ForecastSource, Source};
use crate::sink::influx_store::InfluxStore;
use crate::sink::memory_store::MemoryStore;
use crate::sink::parquet_store::ParquetStore;
use crate::sink::AnyStore;
use crate::types::metric::Metric;
use crate::utils::default_data_dir;
use ::config::{Config, Environment, File};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "INGEST";

/// Past days the Open-Meteo forecast endpoint answers for.
const FORECAST_HISTORY_DAYS: i64 = 92;
const CHARTS_HISTORY_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Charts,
    #[default]
    Forecast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Required for the charts source. The forecast source defaults to Open-Meteo.
    pub base_url: Option<String>,
    /// Value of the `source` tag on stored points.
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub metrics: Vec<Metric>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub timeout_secs: u64,
    /// Static query parameters sent to the charts source.
    pub params: BTreeMap<String, String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            base_url: None,
            name: None,
            latitude: 48.1351,
            longitude: 11.5820,
            metrics: Metric::FETCHABLE.to_vec(),
            user_agent: None,
            referer: None,
            timeout_secs: 15,
            params: BTreeMap::from([("dark".to_string(), "0".to_string())]),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Influx,
    #[default]
    Parquet,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    pub url: String,
    pub token: Option<String>,
    pub org: Option<String>,
    pub bucket: Option<String>,
    pub measurement: String,
    /// Extra tags. `source=<source name>` is added unless set here.
    pub tags: BTreeMap<String, String>,
    /// Parquet root directory. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub flush_retries: u32,
    pub flush_retry_delay_ms: u64,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            kind: DestinationKind::default(),
            url: "http://localhost:8086".to_string(),
            token: None,
            org: None,
            bucket: None,
            measurement: "weather".to_string(),
            tags: BTreeMap::new(),
            path: None,
            timeout_secs: 30,
            flush_retries: 1,
            flush_retry_delay_ms: 500,
        }
    }
}

/// A `0` limit disables that flush trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub span_days: i64,
    /// Defaults to what the configured source can serve: 92 days for the
    /// forecast source, 365 for the charts source.
    pub history_days: Option<i64>,
    /// Overrides `history_days` when set.
    pub stop: Option<DateTime<Utc>>,
    pub politeness_ms: u64,
    pub flush_every_windows: usize,
    pub flush_max_points: usize,
    pub flush_max_age_secs: u64,
    pub flush_on_month_boundary: bool,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            span_days: 7,
            history_days: None,
            stop: None,
            politeness_ms: 1_500,
            flush_every_windows: 4,
            flush_max_points: 0,
            flush_max_age_secs: 0,
            flush_on_month_boundary: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub lookback_hours: i64,
    pub lookahead_hours: i64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            lookback_hours: 24,
            lookahead_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeriveConfig {
    pub wind_chill: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub retry: RetryPolicy,
    pub backfill: BackfillConfig,
    pub poll: PollConfig,
    pub readiness: ReadinessPolicy,
    pub derive: DeriveConfig,
    /// Requests allowed in flight against the source at once.
    pub max_in_flight: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            destination: DestinationConfig::default(),
            retry: RetryPolicy::default(),
            backfill: BackfillConfig::default(),
            poll: PollConfig::default(),
            readiness: ReadinessPolicy::default(),
            derive: DeriveConfig::default(),
            max_in_flight: 2,
        }
    }
}

fn limit<T: Default + PartialEq>(value: T) -> Option<T> {
    (value != T::default()).then_some(value)
}

impl IngestConfig {
    /// Reads `path` (if given), then the environment, and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: IngestConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.metrics.is_empty() {
            return Err(ConfigError::invalid("source.metrics", "no metrics configured"));
        }
        if let Some(derived) = self.source.metrics.iter().find(|m| m.is_derived()) {
            return Err(ConfigError::invalid(
                "source.metrics",
                format!("'{}' is derived, enable it under [derive]", derived),
            ));
        }
        if self.source.kind == SourceKind::Charts && self.source.base_url.is_none() {
            return Err(ConfigError::invalid(
                "source.base_url",
                "required for the charts source",
            ));
        }
        if self.source.timeout_secs == 0 {
            return Err(ConfigError::invalid("source.timeout_secs", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::invalid("max_in_flight", "must be at least 1"));
        }
        if self.backfill.span_days <= 0 {
            return Err(ConfigError::invalid("backfill.span_days", "must be positive"));
        }
        if self.history_days() <= 0 && self.backfill.stop.is_none() {
            return Err(ConfigError::invalid(
                "backfill.history_days",
                "must be positive unless backfill.stop is set",
            ));
        }
        if self.poll.interval_secs == 0 {
            return Err(ConfigError::invalid("poll.interval_secs", "must be positive"));
        }
        if self.poll.lookback_hours < 0
            || self.poll.lookahead_hours < 0
            || self.poll.lookback_hours + self.poll.lookahead_hours == 0
        {
            return Err(ConfigError::invalid(
                "poll",
                "lookback_hours and lookahead_hours must be non-negative and not both zero",
            ));
        }
        if self.readiness.attempts == 0 {
            return Err(ConfigError::invalid("readiness.attempts", "must be at least 1"));
        }
        if self.destination.kind == DestinationKind::Influx {
            for (field, value) in [
                ("destination.token", &self.destination.token),
                ("destination.org", &self.destination.org),
                ("destination.bucket", &self.destination.bucket),
            ] {
                if value.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::invalid(field, "required for InfluxDB"));
                }
            }
        }
        Ok(())
    }

    pub fn history_days(&self) -> i64 {
        self.backfill.history_days.unwrap_or(match self.source.kind {
            SourceKind::Forecast => FORECAST_HISTORY_DAYS,
            SourceKind::Charts => CHARTS_HISTORY_DAYS,
        })
    }

    pub fn threshold(&self) -> FlushThreshold {
        FlushThreshold {
            max_windows: limit(self.backfill.flush_every_windows),
            max_points: limit(self.backfill.flush_max_points),
            max_age: limit(self.backfill.flush_max_age_secs).map(Duration::from_secs),
            month_boundary: self.backfill.flush_on_month_boundary,
        }
    }

    pub fn backfill_settings(&self) -> BackfillSettings {
        BackfillSettings {
            enabled: self.backfill.enabled,
            span: TimeDelta::days(self.backfill.span_days),
            history: TimeDelta::days(self.history_days()),
            stop: self.backfill.stop,
            politeness: Duration::from_millis(self.backfill.politeness_ms),
            threshold: self.threshold(),
        }
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll.interval_secs),
            lookback: TimeDelta::hours(self.poll.lookback_hours),
            lookahead: TimeDelta::hours(self.poll.lookahead_hours),
        }
    }

    pub fn build_source(&self) -> Result<AnySource, ConfigError> {
        let source = &self.source;
        Ok(match source.kind {
            SourceKind::Charts => {
                let base_url = source.base_url.clone().ok_or_else(|| {
                    ConfigError::invalid("source.base_url", "required for the charts source")
                })?;
                AnySource::Charts(
                    ChartsSource::builder()
                        .base_url(base_url)
                        .maybe_name(source.name.clone())
                        .extra_params(source.params.clone())
                        .build(),
                )
            }
            SourceKind::Forecast => AnySource::Forecast(
                ForecastSource::builder()
                    .latitude(source.latitude)
                    .longitude(source.longitude)
                    .maybe_base_url(source.base_url.clone())
                    .maybe_name(source.name.clone())
                    .build(),
            ),
        })
    }

    pub fn build_fetcher(&self) -> Result<HttpFetcher<AnySource>, ConfigError> {
        Ok(HttpFetcher::builder()
            .source(self.build_source()?)
            .retry(self.retry.clone())
            .max_in_flight(self.max_in_flight)
            .timeout(Duration::from_secs(self.source.timeout_secs))
            .maybe_user_agent(self.source.user_agent.clone())
            .maybe_referer(self.source.referer.clone())
            .build()?)
    }

    /// Parquet root: the configured path, or the platform data directory.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.destination.path {
            Some(path) => Ok(path.clone()),
            None => default_data_dir().ok_or(ConfigError::NoDataDir),
        }
    }

    /// The configured destination. `source_name` fills the default `source` tag.
    pub fn build_store(&self, source_name: &str) -> Result<AnyStore, ConfigError> {
        let dest = &self.destination;
        Ok(match dest.kind {
            DestinationKind::Influx => {
                let mut tags = dest.tags.clone();
                tags.entry("source".to_string())
                    .or_insert_with(|| source_name.to_string());
                AnyStore::Influx(
                    InfluxStore::builder()
                        .url(dest.url.clone())
                        .token(dest.token.clone().unwrap_or_default())
                        .org(dest.org.clone().unwrap_or_default())
                        .bucket(dest.bucket.clone().unwrap_or_default())
                        .measurement(dest.measurement.clone())
                        .tags(tags)
                        .timeout(Duration::from_secs(dest.timeout_secs))
                        .build()?,
                )
            }
            DestinationKind::Parquet => AnyStore::Parquet(ParquetStore::new(self.data_dir()?)),
            DestinationKind::Memory => AnyStore::Memory(MemoryStore::new()),
        })
    }

    /// Source and store together, as the binary wires them.
    pub fn build_pipeline(&self) -> Result<(HttpFetcher<AnySource>, AnyStore), ConfigError> {
        let fetcher = self.build_fetcher()?;
        let store = self.build_store(fetcher.source().name())?;
        Ok((fetcher, store))
    }
}
