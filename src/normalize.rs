//! Converts source payloads into ordered [`Observation`] sequences.
//!
//! Two payload shapes are understood:
//!
//! * [`PayloadShape::Records`]: an array of records, each carrying its own
//!   timestamp and value, either as an object (`{"t": 1736920800000, "v": 4.2}`)
//!   or as a `[timestamp, value]` pair.
//! * [`PayloadShape::Columns`]: a struct of arrays where one time series aligns
//!   positionally with a value series
//!   (`{"hourly": {"time": [...], "temperature_2m": [...]}}`).
//!
//! Missing or null values are dropped and counted, never coerced to zero.

pub mod error;
pub mod timestamp;

use crate::normalize::error::NormalizeError;
use crate::normalize::timestamp::parse_timestamp;
use crate::types::metric::Metric;
use crate::types::observation::Observation;
use log::debug;
use serde_json::{Map, Value};

/// Where the timestamps and values live inside a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadShape {
    Records {
        /// Object key holding the record array. `None` when the payload is the array.
        container: Option<String>,
        time_field: String,
        value_field: String,
    },
    Columns {
        /// Object key holding the parallel arrays. `None` when they sit at the top level.
        container: Option<String>,
        time_field: String,
        value_field: String,
    },
}

/// Result of normalizing one payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    /// Observations sorted by ascending timestamp.
    pub observations: Vec<Observation>,
    /// Entries dropped because the value was missing, null or not a finite number.
    pub dropped_values: usize,
    /// Entries dropped because the timestamp could not be read.
    pub dropped_timestamps: usize,
}

impl Normalized {
    pub fn dropped(&self) -> usize {
        self.dropped_values + self.dropped_timestamps
    }

    fn push(&mut self, metric: Metric, time: &Value, value: Option<&Value>) {
        let Some(timestamp) = parse_timestamp(time) else {
            self.dropped_timestamps += 1;
            return;
        };
        match value.and_then(numeric_value) {
            Some(v) => self.observations.push(Observation::new(metric, timestamp, v)),
            None => self.dropped_values += 1,
        }
    }
}

pub fn normalize(
    payload: &Value,
    metric: Metric,
    shape: &PayloadShape,
) -> Result<Normalized, NormalizeError> {
    let mut out = match shape {
        PayloadShape::Records {
            container,
            time_field,
            value_field,
        } => normalize_records(
            resolve_container(payload, container.as_deref(), metric)?,
            metric,
            time_field,
            value_field,
        )?,
        PayloadShape::Columns {
            container,
            time_field,
            value_field,
        } => {
            let root = resolve_container(payload, container.as_deref(), metric)?;
            let Value::Object(columns) = root else {
                return Err(NormalizeError::UnexpectedShape {
                    metric,
                    expected: "an object of parallel arrays",
                    found: value_kind(root),
                });
            };
            normalize_columns(columns, metric, time_field, value_field)?
        }
    };

    out.observations.sort_by_key(|o| o.timestamp);
    if out.dropped() > 0 {
        debug!(
            "Normalized {} {} observations, dropped {} null values and {} bad timestamps",
            out.observations.len(),
            metric,
            out.dropped_values,
            out.dropped_timestamps
        );
    }
    Ok(out)
}

fn resolve_container<'a>(
    payload: &'a Value,
    container: Option<&str>,
    metric: Metric,
) -> Result<&'a Value, NormalizeError> {
    let Some(key) = container else {
        return Ok(payload);
    };
    match payload {
        Value::Object(map) => map.get(key).ok_or_else(|| NormalizeError::MissingSeries {
            metric,
            field: key.to_string(),
        }),
        other => Err(NormalizeError::UnexpectedShape {
            metric,
            expected: "an object",
            found: value_kind(other),
        }),
    }
}

fn normalize_records(
    payload: &Value,
    metric: Metric,
    time_field: &str,
    value_field: &str,
) -> Result<Normalized, NormalizeError> {
    let records = match payload {
        Value::Array(records) => records,
        // An empty window is sometimes answered with `null`.
        Value::Null => return Ok(Normalized::default()),
        other => {
            return Err(NormalizeError::UnexpectedShape {
                metric,
                expected: "an array of records",
                found: value_kind(other),
            })
        }
    };

    let mut out = Normalized {
        observations: Vec::with_capacity(records.len()),
        ..Default::default()
    };
    for (index, record) in records.iter().enumerate() {
        match record {
            Value::Object(fields) => {
                let time = fields.get(time_field).unwrap_or(&Value::Null);
                out.push(metric, time, fields.get(value_field));
            }
            Value::Array(pair) if pair.len() >= 2 => out.push(metric, &pair[0], pair.get(1)),
            _ => return Err(NormalizeError::MalformedRecord { metric, index }),
        }
    }
    Ok(out)
}

fn normalize_columns(
    columns: &Map<String, Value>,
    metric: Metric,
    time_field: &str,
    value_field: &str,
) -> Result<Normalized, NormalizeError> {
    let times = series(columns, metric, time_field)?;
    let values = series(columns, metric, value_field)?;
    if times.len() != values.len() {
        return Err(NormalizeError::LengthMismatch {
            metric,
            times: times.len(),
            values: values.len(),
        });
    }

    let mut out = Normalized {
        observations: Vec::with_capacity(times.len()),
        ..Default::default()
    };
    for (time, value) in times.iter().zip(values) {
        out.push(metric, time, Some(value));
    }
    Ok(out)
}

fn series<'a>(
    columns: &'a Map<String, Value>,
    metric: Metric,
    field: &str,
) -> Result<&'a Vec<Value>, NormalizeError> {
    match columns.get(field) {
        Some(Value::Array(values)) => Ok(values),
        Some(other) => Err(NormalizeError::UnexpectedShape {
            metric,
            expected: "an array series",
            found: value_kind(other),
        }),
        None => Err(NormalizeError::MissingSeries {
            metric,
            field: field.to_string(),
        }),
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
