use crate::fetch::error::FetchError;
use crate::fetch::retry::RetryPolicy;
use crate::fetch::source::Source;
use crate::fetch::{Fetch, RawPayload};
use crate::types::metric::Metric;
use crate::types::window::Window;
use async_trait::async_trait;
use bon::bon;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Reliable GET against a [`Source`]: bounded retries with exponential
/// backoff, and a shared semaphore capping requests in flight.
pub struct HttpFetcher<S> {
    client: Client,
    source: S,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
}

#[bon]
impl<S: Source> HttpFetcher<S> {
    #[builder]
    pub fn new(
        source: S,
        #[builder(default)] retry: RetryPolicy,
        #[builder(default = 2)] max_in_flight: usize,
        #[builder(default = Duration::from_secs(15))] timeout: Duration,
        #[builder(into)] user_agent: Option<String>,
        #[builder(into)] referer: Option<String>,
        // Shared between fetchers that hit the same upstream.
        limiter: Option<Arc<Semaphore>>,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = referer {
            let value =
                HeaderValue::from_str(&referer).map_err(|e| FetchError::Client(e.to_string()))?;
            headers.insert(REFERER, value);
        }
        let client = Client::builder()
            .user_agent(user_agent.unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            source,
            retry,
            limiter: limiter.unwrap_or_else(|| Arc::new(Semaphore::new(max_in_flight.max(1)))),
        })
    }
}

impl<S: Source> HttpFetcher<S> {
    pub fn source(&self) -> &S {
        &self.source
    }

    async fn get_json(&self, metric: Metric, url: Url) -> Result<serde_json::Value, FetchError> {
        let max_attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| FetchError::Client("request limiter closed".to_string()))?;

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<serde_json::Value>().await {
                            Ok(body) => return Ok(body),
                            Err(e) if e.is_decode() => {
                                return Err(FetchError::InvalidBody {
                                    url: url.to_string(),
                                    source: e,
                                });
                            }
                            Err(e) if attempt >= max_attempts => {
                                return Err(FetchError::Network {
                                    url: url.to_string(),
                                    attempts: attempt,
                                    source: e,
                                });
                            }
                            Err(e) => warn!(
                                "Reading {} body from {} failed (attempt {}/{}): {}",
                                metric, url, attempt, max_attempts, e
                            ),
                        }
                    } else {
                        if !self.retry.is_retryable_status(status) {
                            warn!("HTTP error for {}: {}", url, status);
                            return Err(FetchError::HttpStatus {
                                url: url.to_string(),
                                status,
                            });
                        }
                        if attempt >= max_attempts {
                            return Err(FetchError::RetriesExhausted {
                                url: url.to_string(),
                                status,
                                attempts: attempt,
                            });
                        }
                        warn!(
                            "{} for {} returned {} (attempt {}/{})",
                            metric, url, status, attempt, max_attempts
                        );
                    }
                }
                Err(e) if e.is_builder() => {
                    return Err(FetchError::InvalidRequest {
                        metric,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(FetchError::Network {
                            url: url.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!(
                        "{} request to {} failed (attempt {}/{}): {}",
                        metric, url, attempt, max_attempts, e
                    );
                }
            }

            drop(permit);
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
    }
}

#[async_trait]
impl<S: Source> Fetch for HttpFetcher<S> {
    fn source_name(&self) -> &str {
        self.source.name()
    }

    fn supports(&self, metric: Metric) -> bool {
        self.source.supports(metric)
    }

    async fn fetch(&self, metric: Metric, window: &Window) -> Result<RawPayload, FetchError> {
        let request = self.source.request(metric, window)?;
        let url = Url::parse_with_params(&request.url, &request.query).map_err(|e| {
            FetchError::InvalidRequest {
                metric,
                reason: format!("malformed URL '{}': {}", request.url, e),
            }
        })?;
        debug!("Requesting {} for window {}", metric, window);
        let body = self.get_json(metric, url).await?;
        Ok(RawPayload {
            body,
            shape: self.source.shape(metric),
        })
    }
}
