//! Defines the weather metrics the ingester knows about and how each one is
//! addressed by the sources and the destination store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single weather quantity tracked as its own time series.
///
/// Every metric is addressed three ways: by its chart endpoint key (also used
/// for parsing, display and configuration), by the hourly variable of the
/// forecast API, and by the field name written to the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    /// Air temperature in °C.
    Temperature,
    /// Wind speed in km/h.
    Wind,
    /// Precipitation in mm.
    Rain,
    /// Air pressure at mean sea level in hPa.
    Pressure,
    /// Sunshine duration.
    Sunshine,
    /// Perceived temperature, derived from [`Metric::Temperature`] and [`Metric::Wind`].
    /// Never fetched from a source.
    WindChill,
}

impl Metric {
    /// The metrics that can be requested from a source.
    pub const FETCHABLE: [Metric; 5] = [
        Metric::Temperature,
        Metric::Wind,
        Metric::Rain,
        Metric::Pressure,
        Metric::Sunshine,
    ];

    pub const ALL: [Metric; 6] = [
        Metric::Temperature,
        Metric::Wind,
        Metric::Rain,
        Metric::Pressure,
        Metric::Sunshine,
        Metric::WindChill,
    ];

    pub fn endpoint_key(&self) -> &'static str {
        match self {
            Metric::Temperature => "temp",
            Metric::Wind => "wind",
            Metric::Rain => "rain",
            Metric::Pressure => "press",
            Metric::Sunshine => "sun",
            Metric::WindChill => "windchill",
        }
    }

    /// Hourly variable name on the forecast API, `None` for derived metrics.
    pub fn forecast_variable(&self) -> Option<&'static str> {
        match self {
            Metric::Temperature => Some("temperature_2m"),
            Metric::Wind => Some("wind_speed_10m"),
            Metric::Rain => Some("precipitation"),
            Metric::Pressure => Some("pressure_msl"),
            Metric::Sunshine => Some("sunshine_duration"),
            Metric::WindChill => None,
        }
    }

    /// Field name used when writing to the destination store.
    pub fn field_name(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Wind => "wind_speed",
            Metric::Rain => "rain",
            Metric::Pressure => "pressure",
            Metric::Sunshine => "sunshine",
            Metric::WindChill => "wind_chill",
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self, Metric::WindChill)
    }
}

/// Allows formatting a `Metric` using its endpoint key.
///
/// # Examples
///
/// ```
/// use weather_ingest::Metric;
///
/// assert_eq!(Metric::Pressure.to_string(), "press");
/// assert_eq!("temp".parse::<Metric>().unwrap(), Metric::Temperature);
/// ```
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown metric '{0}'")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        Metric::ALL
            .into_iter()
            .find(|m| m.endpoint_key() == key || m.field_name() == key)
            .ok_or(UnknownMetric(s.to_string()))
    }
}

impl TryFrom<String> for Metric {
    type Error = UnknownMetric;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(value: Metric) -> Self {
        value.endpoint_key().to_string()
    }
}
