use crate::buffer::merge_buffer::FlushUnit;
use crate::sink::error::StoreError;
use crate::sink::Store;
use crate::types::observation::TimeRange;
use async_trait::async_trait;
use bon::bon;
use chrono::{SecondsFormat, TimeDelta};
use log::debug;
use polars::prelude::{CsvReadOptions, DataType, SerReader};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

const VALUE_COLUMN: &str = "_value";

/// InfluxDB v2 destination.
///
/// Points are written as line protocol at millisecond precision. Influx
/// identifies a point by measurement, tag set, field and timestamp, so a
/// rewrite of the same unit overwrites in place.
pub struct InfluxStore {
    client: Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
    measurement: String,
    tags: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[bon]
impl InfluxStore {
    #[builder]
    pub fn new(
        #[builder(into)] url: String,
        #[builder(into)] token: String,
        #[builder(into)] org: String,
        #[builder(into)] bucket: String,
        #[builder(into, default = "weather".to_string())] measurement: String,
        #[builder(default)] tags: BTreeMap<String, String>,
        #[builder(default = Duration::from_secs(30))] timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token,
            org,
            bucket,
            measurement,
            tags,
        })
    }
}

impl InfluxStore {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    /// Renders a unit as line protocol, one line per observation.
    pub fn line_protocol(&self, unit: &FlushUnit) -> String {
        let mut series_key = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            series_key.push(',');
            series_key.push_str(&escape_tag(key));
            series_key.push('=');
            series_key.push_str(&escape_tag(value));
        }
        let field = escape_tag(unit.metric.field_name());

        let mut body = String::new();
        for observation in &unit.observations {
            body.push_str(&format!(
                "{} {}={} {}\n",
                series_key,
                field,
                format_float(observation.value),
                observation.timestamp.timestamp_millis()
            ));
        }
        body
    }

    fn coverage_query(&self, range: TimeRange) -> String {
        // `range` excludes its stop bound.
        let stop = range.end + TimeDelta::seconds(1);
        format!(
            "from(bucket: \"{}\")\n  |> range(start: {}, stop: {})\n  |> filter(fn: (r) => r._measurement == \"{}\")\n  |> count()\n  |> limit(n: 1)",
            escape_flux_string(&self.bucket),
            range.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            stop.to_rfc3339_opts(SecondsFormat::Secs, true),
            escape_flux_string(&self.measurement),
        )
    }

    async fn error_for(url: &str, response: reqwest::Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        StoreError::HttpStatus {
            url: url.to_string(),
            status,
            body,
        }
    }
}

#[async_trait]
impl Store for InfluxStore {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        if unit.is_empty() {
            return Ok(0);
        }
        let url = format!("{}/api/v2/write", self.url);
        let response = self
            .client
            .post(&url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(AUTHORIZATION, self.auth_header())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(self.line_protocol(unit))
            .send()
            .await
            .map_err(|e| StoreError::NetworkRequest(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(Self::error_for(&url, response).await);
        }
        debug!("Wrote {} {} points to bucket {}", unit.len(), unit.metric, self.bucket);
        Ok(unit.len())
    }

    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError> {
        let url = format!("{}/api/v2/query", self.url);
        let response = self
            .client
            .post(&url)
            .query(&[("org", self.org.as_str())])
            .header(AUTHORIZATION, self.auth_header())
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(self.coverage_query(range))
            .send()
            .await
            .map_err(|e| StoreError::NetworkRequest(url.clone(), e))?;

        if !response.status().is_success() {
            return Err(Self::error_for(&url, response).await);
        }
        let csv = response
            .text()
            .await
            .map_err(|e| StoreError::NetworkRequest(url.clone(), e))?;
        parse_count_csv(&csv).map_err(|reason| StoreError::UnexpectedResponse { url, reason })
    }

    async fn health(&self) -> Result<(), StoreError> {
        let url = format!("{}/health", self.url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::NetworkRequest(url.clone(), e))?;
        if !response.status().is_success() {
            return Err(StoreError::Unhealthy(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| StoreError::NetworkRequest(url.clone(), e))?;
        if health.status != "pass" {
            return Err(StoreError::Unhealthy(format!(
                "status '{}': {}",
                health.status,
                health.message.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// Whether an annotated or plain Flux CSV result holds a positive count.
///
/// An empty body means the query matched no series. Fails when rows are
/// present but no `_value` column can be read.
fn parse_count_csv(csv: &str) -> Result<bool, String> {
    // Tables are separated by blank lines; annotation rows start with '#'.
    let rows: Vec<&str> = csv
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .collect();
    if rows.is_empty() {
        return Ok(false);
    }

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .into_reader_with_file_handle(Cursor::new(rows.join("\n").into_bytes()))
        .finish()
        .map_err(|e| format!("unreadable query result: {}", e))?;

    let counts = df
        .column(VALUE_COLUMN)
        .map_err(|_| "query result has no _value column".to_string())?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .map_err(|e| format!("_value is not numeric: {}", e))?;
    let counts = counts
        .f64()
        .map_err(|e| format!("_value is not numeric: {}", e))?;
    // Repeated table headers cast to null.
    let any_positive = counts.into_iter().flatten().any(|count| count > 0.0);
    Ok(any_positive)
}

fn format_float(value: f64) -> String {
    // Line protocol reads integers without an `i` suffix as floats.
    format!("{}", value)
}

fn escape_measurement(value: &str) -> String {
    value.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_flux_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
