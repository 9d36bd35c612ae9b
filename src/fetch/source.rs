//! Source APIs: how a `(metric, window)` pair becomes an HTTP request, and
//! which payload shape comes back.

use crate::fetch::error::FetchError;
use crate::normalize::PayloadShape;
use crate::types::metric::Metric;
use crate::types::window::Window;
use bon::bon;
use std::collections::BTreeMap;

/// A GET request before it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

pub trait Source: Send + Sync {
    /// Short identifier, used as the `source` tag in the store.
    fn name(&self) -> &str;

    fn supports(&self, metric: Metric) -> bool;

    fn request(&self, metric: Metric, window: &Window) -> Result<SourceRequest, FetchError>;

    fn shape(&self, metric: Metric) -> PayloadShape;
}

/// Chart API serving one array of `{t, v}` records per metric endpoint.
///
/// `GET {base}/{metric}?{until}=<window end, unix ms>&{days}=<span in days>`
#[derive(Debug, Clone)]
pub struct ChartsSource {
    name: String,
    base_url: String,
    until_param: String,
    days_param: String,
    extra_params: BTreeMap<String, String>,
    time_field: String,
    value_field: String,
}

#[bon]
impl ChartsSource {
    #[builder]
    pub fn new(
        #[builder(into)] base_url: String,
        #[builder(into, default = "charts".to_string())] name: String,
        #[builder(into, default = "bis".to_string())] until_param: String,
        #[builder(into, default = "tage".to_string())] days_param: String,
        #[builder(default = BTreeMap::from([("dark".to_string(), "0".to_string())]))]
        extra_params: BTreeMap<String, String>,
        #[builder(into, default = "t".to_string())] time_field: String,
        #[builder(into, default = "v".to_string())] value_field: String,
    ) -> Self {
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            until_param,
            days_param,
            extra_params,
            time_field,
            value_field,
        }
    }
}

impl Source for ChartsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, metric: Metric) -> bool {
        !metric.is_derived()
    }

    fn request(&self, metric: Metric, window: &Window) -> Result<SourceRequest, FetchError> {
        if !self.supports(metric) {
            return Err(FetchError::UnsupportedMetric(metric));
        }
        let mut query = vec![
            (
                self.until_param.clone(),
                window.end().timestamp_millis().to_string(),
            ),
            (self.days_param.clone(), window.span_days().to_string()),
        ];
        query.extend(
            self.extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Ok(SourceRequest {
            url: format!("{}/{}", self.base_url, metric.endpoint_key()),
            query,
        })
    }

    fn shape(&self, _metric: Metric) -> PayloadShape {
        PayloadShape::Records {
            container: None,
            time_field: self.time_field.clone(),
            value_field: self.value_field.clone(),
        }
    }
}

/// Forecast API answering hourly variables as parallel arrays.
///
/// `GET {base}/forecast?latitude=&longitude=&hourly=<variable>&start_date=&end_date=`
#[derive(Debug, Clone)]
pub struct ForecastSource {
    name: String,
    base_url: String,
    latitude: f64,
    longitude: f64,
}

#[bon]
impl ForecastSource {
    #[builder]
    pub fn new(
        latitude: f64,
        longitude: f64,
        #[builder(into, default = "https://api.open-meteo.com/v1".to_string())] base_url: String,
        #[builder(into, default = "open_meteo".to_string())] name: String,
    ) -> Self {
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            latitude,
            longitude,
        }
    }
}

impl Source for ForecastSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, metric: Metric) -> bool {
        metric.forecast_variable().is_some()
    }

    fn request(&self, metric: Metric, window: &Window) -> Result<SourceRequest, FetchError> {
        let variable = metric
            .forecast_variable()
            .ok_or(FetchError::UnsupportedMetric(metric))?;
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude)
        {
            return Err(FetchError::InvalidRequest {
                metric,
                reason: format!(
                    "coordinates out of range ({}, {})",
                    self.latitude, self.longitude
                ),
            });
        }
        let date = |dt: chrono::DateTime<chrono::Utc>| dt.format("%Y-%m-%d").to_string();
        Ok(SourceRequest {
            url: format!("{}/forecast", self.base_url),
            query: vec![
                ("latitude".to_string(), self.latitude.to_string()),
                ("longitude".to_string(), self.longitude.to_string()),
                ("hourly".to_string(), variable.to_string()),
                ("timezone".to_string(), "UTC".to_string()),
                ("start_date".to_string(), date(window.start())),
                ("end_date".to_string(), date(window.end())),
            ],
        })
    }

    fn shape(&self, metric: Metric) -> PayloadShape {
        PayloadShape::Columns {
            container: Some("hourly".to_string()),
            time_field: "time".to_string(),
            value_field: metric.forecast_variable().unwrap_or_default().to_string(),
        }
    }
}

/// Either source, as selected by configuration.
#[derive(Debug, Clone)]
pub enum AnySource {
    Charts(ChartsSource),
    Forecast(ForecastSource),
}

impl Source for AnySource {
    fn name(&self) -> &str {
        match self {
            AnySource::Charts(s) => s.name(),
            AnySource::Forecast(s) => s.name(),
        }
    }

    fn supports(&self, metric: Metric) -> bool {
        match self {
            AnySource::Charts(s) => s.supports(metric),
            AnySource::Forecast(s) => s.supports(metric),
        }
    }

    fn request(&self, metric: Metric, window: &Window) -> Result<SourceRequest, FetchError> {
        match self {
            AnySource::Charts(s) => s.request(metric, window),
            AnySource::Forecast(s) => s.request(metric, window),
        }
    }

    fn shape(&self, metric: Metric) -> PayloadShape {
        match self {
            AnySource::Charts(s) => s.shape(metric),
            AnySource::Forecast(s) => s.shape(metric),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn window() -> Window {
        Window::backward(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            TimeDelta::days(7),
        )
    }

    #[test]
    fn charts_request_uses_window_end_and_days() -> Result<(), FetchError> {
        let source = ChartsSource::builder()
            .base_url("https://charts.example/api/charts/")
            .build();
        let request = source.request(Metric::Pressure, &window())?;
        assert_eq!(request.url, "https://charts.example/api/charts/press");
        assert_eq!(
            request.query,
            vec![
                ("bis".to_string(), "1740787200000".to_string()),
                ("tage".to_string(), "7".to_string()),
                ("dark".to_string(), "0".to_string()),
            ]
        );
        assert!(matches!(
            source.shape(Metric::Pressure),
            PayloadShape::Records { .. }
        ));
        Ok(())
    }

    #[test]
    fn charts_rejects_derived_metric() {
        let source = ChartsSource::builder().base_url("http://x").build();
        assert!(matches!(
            source.request(Metric::WindChill, &window()),
            Err(FetchError::UnsupportedMetric(Metric::WindChill))
        ));
    }

    #[test]
    fn forecast_request_covers_window_dates() -> Result<(), FetchError> {
        let source = ForecastSource::builder()
            .latitude(48.1351)
            .longitude(11.582)
            .build();
        let request = source.request(Metric::Temperature, &window())?;
        assert_eq!(request.url, "https://api.open-meteo.com/v1/forecast");
        let get = |key: &str| {
            request
                .query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("hourly"), Some("temperature_2m"));
        assert_eq!(get("start_date"), Some("2025-02-22"));
        assert_eq!(get("end_date"), Some("2025-03-01"));
        assert_eq!(get("timezone"), Some("UTC"));
        Ok(())
    }

    #[test]
    fn forecast_rejects_bad_coordinates() {
        let source = ForecastSource::builder()
            .latitude(123.0)
            .longitude(0.0)
            .build();
        let err = source.request(Metric::Wind, &window()).unwrap_err();
        assert!(err.is_permanent());
    }
}
