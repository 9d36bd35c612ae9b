//! Orchestrates the planner, fetcher, normalizer, buffer and flusher for a
//! backfill followed by periodic incremental polling.

pub mod error;
pub mod readiness;
pub mod state;
pub mod stats;

use crate::buffer::merge_buffer::MergeBuffer;
use crate::buffer::threshold::FlushThreshold;
use crate::derive::derive_wind_chill;
use crate::driver::error::DriverError;
use crate::driver::readiness::{await_ready, Ready, ReadinessPolicy};
use crate::driver::state::DriverState;
use crate::driver::stats::{add, IngestStats};
use crate::fetch::error::{FetchError, FetchErrorKind};
use crate::fetch::{Fetch, RawPayload};
use crate::normalize::normalize;
use crate::planner::{incremental_window, BackwardPlan};
use crate::sink::flusher::Flusher;
use crate::sink::Store;
use crate::types::metric::Metric;
use crate::types::observation::TimeRange;
use crate::types::window::Window;
use bon::bon;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSettings {
    /// Whether [`Driver::run`] checks coverage and backfills an empty store.
    pub enabled: bool,
    pub span: TimeDelta,
    /// How far back from now the history reaches when `stop` is unset.
    pub history: TimeDelta,
    pub stop: Option<DateTime<Utc>>,
    /// Pause between successive windows.
    pub politeness: Duration,
    pub threshold: FlushThreshold,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            span: TimeDelta::days(7),
            history: TimeDelta::days(365),
            stop: None,
            politeness: Duration::from_millis(1_500),
            threshold: FlushThreshold::default(),
        }
    }
}

impl BackfillSettings {
    pub fn stop_for(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.stop.unwrap_or(now - self.history)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub lookback: TimeDelta,
    pub lookahead: TimeDelta,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            lookback: TimeDelta::days(1),
            lookahead: TimeDelta::zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub windows: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { written: usize, failed: usize },
    /// The previous tick was still running.
    Skipped,
}

pub struct Driver<F, S> {
    fetcher: F,
    flusher: Flusher<S>,
    buffer: Mutex<MergeBuffer>,
    metrics: Vec<Metric>,
    backfill: BackfillSettings,
    poll: PollSettings,
    readiness: ReadinessPolicy,
    derive_wind_chill: bool,
    stats: Arc<IngestStats>,
    state: watch::Sender<DriverState>,
    cancel: CancellationToken,
    tick: Mutex<()>,
}

#[bon]
impl<F: Fetch, S: Store> Driver<F, S> {
    #[builder]
    pub fn new(
        fetcher: F,
        store: S,
        #[builder(default = Metric::FETCHABLE.to_vec())] metrics: Vec<Metric>,
        #[builder(default)] backfill: BackfillSettings,
        #[builder(default)] poll: PollSettings,
        #[builder(default)] readiness: ReadinessPolicy,
        #[builder(default)] derive_wind_chill: bool,
        #[builder(default = 1)] flush_retries: u32,
        #[builder(default = Duration::from_millis(500))] flush_retry_delay: Duration,
        #[builder(default)] cancel: CancellationToken,
    ) -> Self {
        let mut metrics: Vec<Metric> = metrics
            .into_iter()
            .filter(|metric| {
                let usable = !metric.is_derived() && fetcher.supports(*metric);
                if !usable {
                    warn!("{} does not provide '{}', ignoring it", fetcher.source_name(), metric);
                }
                usable
            })
            .collect();
        metrics.sort();
        metrics.dedup();

        let (state, _) = watch::channel(DriverState::Bootstrapping);
        Self {
            fetcher,
            flusher: Flusher::new(store, flush_retries, flush_retry_delay),
            buffer: Mutex::new(MergeBuffer::new(backfill.threshold)),
            metrics,
            backfill,
            poll,
            readiness,
            derive_wind_chill,
            stats: Arc::new(IngestStats::default()),
            state,
            cancel,
            tick: Mutex::new(()),
        }
    }
}

impl<F: Fetch, S: Store> Driver<F, S> {
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &S {
        self.flusher.store()
    }

    /// Points currently buffered for `metric`.
    pub async fn buffered(&self, metric: Metric) -> usize {
        self.buffer.lock().await.len(metric)
    }

    fn set_state(&self, state: DriverState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Driver state {} -> {}", previous, state);
        }
    }

    /// Sleeps for `delay`. Returns `false` if cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    pub async fn ready(&self) -> Result<Ready, DriverError> {
        await_ready(self.flusher.store(), &self.readiness, &self.cancel).await
    }

    /// Whether the destination lacks data for the configured history.
    pub async fn needs_backfill(&self, now: DateTime<Utc>) -> Result<bool, DriverError> {
        self.set_state(DriverState::Bootstrapping);
        let range = TimeRange::new(self.backfill.stop_for(now), now);
        let covered = self
            .flusher
            .store()
            .has_coverage(range)
            .await
            .map_err(DriverError::Coverage)?;
        if covered {
            info!(
                "{} already holds data since {}, skipping backfill",
                self.flusher.store().name(),
                range.start
            );
        } else {
            info!(
                "{} holds no data since {}, backfill required",
                self.flusher.store().name(),
                range.start
            );
        }
        Ok(!covered)
    }

    /// Fetches every metric for one window and merges the results into the
    /// buffer. Returns the permanent failures.
    async fn ingest_window(&self, window: &Window) -> Vec<(Metric, FetchError)> {
        let requests = self.metrics.iter().map(|&metric| async move {
            (metric, self.fetcher.fetch(metric, window).await)
        });
        let results = join_all(requests).await;
        add(&self.stats.windows_fetched, 1);

        let mut permanent = Vec::new();
        for (metric, result) in results {
            match result {
                Ok(payload) => self.absorb(metric, window, &payload).await,
                Err(e) => match e.kind() {
                    FetchErrorKind::Transient => {
                        warn!("Skipping {} for window {}: {}", metric, window, e);
                        add(&self.stats.windows_skipped, 1);
                        add(&self.stats.retries_exhausted, 1);
                    }
                    FetchErrorKind::InvalidBody => {
                        warn!("Dropping {} data for window {}: {}", metric, window, e);
                        add(&self.stats.normalization_errors, 1);
                    }
                    FetchErrorKind::Permanent => {
                        error!("Permanent failure for {} at window {}: {}", metric, window, e);
                        add(&self.stats.permanent_failures, 1);
                        permanent.push((metric, e));
                    }
                },
            }
        }
        permanent
    }

    async fn absorb(&self, metric: Metric, window: &Window, payload: &RawPayload) {
        let normalized = match normalize(&payload.body, metric, &payload.shape) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("Dropping {} data for window {}: {}", metric, window, e);
                add(&self.stats.normalization_errors, 1);
                return;
            }
        };
        let count = normalized.observations.len();
        let dropped = normalized.dropped();
        add(&self.stats.observations_normalized, count);
        add(&self.stats.observations_dropped, dropped);

        let summary = self
            .buffer
            .lock()
            .await
            .insert(metric, normalized.observations);
        add(&self.stats.duplicates, summary.duplicates);
        add(&self.stats.divergences, summary.divergences);
        debug!(
            "{} window {}: {} new, {} duplicate, {} divergent, {} dropped",
            metric,
            window,
            summary.inserted,
            summary.duplicates,
            summary.divergences,
            dropped
        );
    }

    /// Flushes `metrics`, carrying on past failures. Returns the points
    /// written, or the first persistence error.
    async fn flush_metrics(
        &self,
        buffer: &mut MergeBuffer,
        mut metrics: Vec<Metric>,
    ) -> Result<usize, DriverError> {
        if self.derive_wind_chill
            && metrics
                .iter()
                .any(|m| matches!(m, Metric::Temperature | Metric::Wind))
        {
            let derived = derive_wind_chill(buffer);
            if !derived.is_empty() {
                buffer.insert(Metric::WindChill, derived);
            }
            // Temperature and wind leave the buffer together so every pair gets joined.
            for metric in [Metric::Temperature, Metric::Wind, Metric::WindChill] {
                if !metrics.contains(&metric) {
                    metrics.push(metric);
                }
            }
        }

        let mut written = 0;
        let mut first_error = None;
        for metric in metrics {
            match self.flusher.flush(buffer, metric).await {
                Ok(0) => {}
                Ok(n) => {
                    written += n;
                    add(&self.stats.flush_successes, 1);
                    add(&self.stats.points_written, n);
                }
                Err(source) => {
                    add(&self.stats.flush_failures, 1);
                    first_error.get_or_insert(DriverError::Persistence { metric, source });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn flush_due(&self) {
        let mut buffer = self.buffer.lock().await;
        let due: Vec<Metric> = buffer
            .pending_metrics()
            .into_iter()
            .filter(|m| buffer.should_flush(*m))
            .collect();
        if due.is_empty() {
            return;
        }
        if let Err(e) = self.flush_metrics(&mut buffer, due).await {
            warn!("{}, retrying at the next flush", e);
        }
    }

    /// Flushes every non-empty buffer.
    pub async fn flush_all(&self) -> Result<usize, DriverError> {
        let mut buffer = self.buffer.lock().await;
        let pending = buffer.pending_metrics();
        self.flush_metrics(&mut buffer, pending).await
    }

    /// Walks windows back from `start_anchor` until `stop`, flushing as
    /// buffers come due and once more at the end.
    ///
    /// A cancelled backfill flushes what it holds and reports `cancelled`.
    /// A permanent fetch failure flushes, then aborts in [`DriverState::Failed`].
    pub async fn backfill(
        &self,
        start_anchor: DateTime<Utc>,
        stop: DateTime<Utc>,
    ) -> Result<BackfillReport, DriverError> {
        let plan = BackwardPlan::new(start_anchor, stop, self.backfill.span)?;
        let total = plan.len();
        self.set_state(DriverState::Backfilling);
        info!(
            "Backfilling {} window(s) from {} back to {}",
            total, start_anchor, stop
        );

        let mut processed = 0;
        let mut cancelled = false;
        for window in plan {
            if processed > 0 && !self.pause(self.backfill.politeness).await {
                cancelled = true;
                break;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let permanent = self.ingest_window(&window).await;
            processed += 1;

            if let Some((metric, source)) = permanent.into_iter().next() {
                if let Err(e) = self.flush_all().await {
                    error!("Could not persist buffered data before aborting: {}", e);
                }
                self.set_state(DriverState::Failed);
                return Err(DriverError::PermanentFetch {
                    metric,
                    window: window.to_string(),
                    source,
                });
            }

            self.flush_due().await;
            info!("Backfill window {}/{} done: {}", processed, total, window);
        }

        match self.flush_all().await {
            Ok(written) => info!("Final backfill flush wrote {} points", written),
            Err(e) => {
                self.set_state(DriverState::Failed);
                return Err(e);
            }
        }

        if cancelled {
            info!("Backfill stopped after {} of {} window(s)", processed, total);
            self.set_state(DriverState::Stopped);
        } else {
            self.set_state(DriverState::Waiting);
        }
        Ok(BackfillReport {
            windows: processed,
            cancelled,
        })
    }

    /// One incremental tick: fetch the window around `now` and flush at once.
    ///
    /// Permanent failures and write failures are logged and left for the
    /// next tick. A tick requested while another runs is skipped.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollOutcome, DriverError> {
        let Ok(_guard) = self.tick.try_lock() else {
            warn!("Previous poll tick still running, skipping this one");
            return Ok(PollOutcome::Skipped);
        };
        let window = incremental_window(now, self.poll.lookback, self.poll.lookahead)?;
        self.set_state(DriverState::Polling);

        let permanent = self.ingest_window(&window).await;
        if !permanent.is_empty() {
            warn!(
                "{} metric(s) failed permanently this tick, waiting for the next one",
                permanent.len()
            );
        }

        let written = match self.flush_all().await {
            Ok(written) => written,
            Err(e) => {
                warn!("{}, keeping buffered data for the next tick", e);
                0
            }
        };
        self.set_state(DriverState::Waiting);
        Ok(PollOutcome::Completed {
            written,
            failed: permanent.len(),
        })
    }

    /// Polls on a fixed period until cancelled. A running tick always
    /// completes its flush before the loop exits.
    pub async fn poll_loop(&self) {
        let period = self.poll.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Polling every {:?}", period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(Utc::now()).await {
                        error!("Poll tick failed: {}", e);
                    }
                }
            }
        }
        self.set_state(DriverState::Stopped);
    }

    /// Waits for the destination, backfills if it is empty and backfilling
    /// is enabled, then polls until cancelled.
    pub async fn run(&self) -> Result<(), DriverError> {
        self.set_state(DriverState::Bootstrapping);
        match self.ready().await {
            Ok(_) => {}
            Err(DriverError::Cancelled) => {
                self.set_state(DriverState::Stopped);
                return Ok(());
            }
            Err(e) => {
                self.set_state(DriverState::Failed);
                return Err(e);
            }
        }

        let now = Utc::now();
        if self.backfill.enabled && self.needs_backfill(now).await? {
            let report = self.backfill(now, self.backfill.stop_for(now)).await?;
            if report.cancelled {
                return Ok(());
            }
        }
        self.poll_loop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::wind_chill;
    use crate::normalize::PayloadShape;
    use crate::sink::memory_store::MemoryStore;
    use crate::types::observation::Observation;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike};
    use reqwest::StatusCode;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Failure {
        Transient,
        Permanent,
        /// A JSON body that matches no payload shape.
        Malformed,
        /// A body that is not JSON at all.
        NotJson,
    }

    /// Hourly data over every requested window, with scripted failures.
    #[derive(Default)]
    struct ScriptedFetcher {
        failures: HashMap<Metric, Failure>,
        calls: AtomicUsize,
        cancel_on_first_call: Option<CancellationToken>,
    }

    impl ScriptedFetcher {
        fn failing(metric: Metric, failure: Failure) -> Self {
            Self {
                failures: HashMap::from([(metric, failure)]),
                ..Default::default()
            }
        }

        fn value(metric: Metric, ts: DateTime<Utc>) -> f64 {
            match metric {
                Metric::Temperature => 0.0,
                Metric::Wind => 20.0,
                _ => ts.hour() as f64,
            }
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetcher {
        fn source_name(&self) -> &str {
            "scripted"
        }

        fn supports(&self, metric: Metric) -> bool {
            !metric.is_derived()
        }

        async fn fetch(&self, metric: Metric, window: &Window) -> Result<RawPayload, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(token) = &self.cancel_on_first_call {
                    token.cancel();
                }
            }
            let url = format!("http://scripted/{}", metric.endpoint_key());
            match self.failures.get(&metric) {
                Some(Failure::Transient) => {
                    return Err(FetchError::RetriesExhausted {
                        url,
                        status: StatusCode::SERVICE_UNAVAILABLE,
                        attempts: 5,
                    })
                }
                Some(Failure::Permanent) => {
                    return Err(FetchError::HttpStatus {
                        url,
                        status: StatusCode::NOT_FOUND,
                    })
                }
                Some(Failure::NotJson) => {
                    let source = reqwest::Client::new()
                        .get("not a url")
                        .build()
                        .expect_err("invalid URL");
                    return Err(FetchError::InvalidBody { url, source });
                }
                Some(Failure::Malformed) => {
                    return Ok(RawPayload {
                        body: json!({"error": "maintenance"}),
                        shape: records_shape(),
                    })
                }
                None => {}
            }

            let range = window.range();
            let mut records = Vec::new();
            let mut ts = range.start;
            while ts <= range.end {
                records.push(json!({"t": ts.timestamp_millis(), "v": Self::value(metric, ts)}));
                ts += TimeDelta::hours(1);
            }
            Ok(RawPayload {
                body: json!(records),
                shape: records_shape(),
            })
        }
    }

    fn records_shape() -> PayloadShape {
        PayloadShape::Records {
            container: None,
            time_field: "t".to_string(),
            value_field: "v".to_string(),
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn backfill_settings() -> BackfillSettings {
        BackfillSettings {
            politeness: Duration::ZERO,
            ..Default::default()
        }
    }

    fn driver(
        fetcher: ScriptedFetcher,
        store: Arc<MemoryStore>,
    ) -> Driver<ScriptedFetcher, Arc<MemoryStore>> {
        Driver::builder()
            .fetcher(fetcher)
            .store(store)
            .backfill(backfill_settings())
            .flush_retries(0)
            .flush_retry_delay(Duration::ZERO)
            .build()
    }

    #[tokio::test]
    async fn transient_failure_skips_only_that_metric() {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(ScriptedFetcher::failing(Metric::Wind, Failure::Transient), store);
        let window = Window::backward(at(2025, 3, 1), TimeDelta::days(7));

        let permanent = driver.ingest_window(&window).await;

        assert!(permanent.is_empty());
        assert_eq!(driver.buffered(Metric::Wind).await, 0);
        for metric in [Metric::Temperature, Metric::Rain, Metric::Pressure, Metric::Sunshine] {
            assert_eq!(driver.buffered(metric).await, 169, "{metric}");
        }
        let stats = driver.stats().snapshot();
        assert_eq!(stats.windows_skipped, 1);
        assert_eq!(stats.retries_exhausted, 1);
    }

    #[tokio::test]
    async fn malformed_payload_drops_only_that_metric() {
        for failure in [Failure::Malformed, Failure::NotJson] {
            let store = Arc::new(MemoryStore::new());
            let driver = driver(ScriptedFetcher::failing(Metric::Pressure, failure), store);
            let window = Window::backward(at(2025, 3, 1), TimeDelta::days(7));

            let permanent = driver.ingest_window(&window).await;

            assert!(permanent.is_empty(), "{failure:?}");
            assert_eq!(driver.buffered(Metric::Pressure).await, 0, "{failure:?}");
            for metric in [Metric::Temperature, Metric::Wind, Metric::Rain, Metric::Sunshine] {
                assert_eq!(driver.buffered(metric).await, 169, "{failure:?} {metric}");
            }
            let stats = driver.stats().snapshot();
            assert_eq!(stats.normalization_errors, 1, "{failure:?}");
            assert_eq!(stats.windows_skipped, 0, "{failure:?}");
        }
    }

    #[tokio::test]
    async fn backfill_continues_past_malformed_payloads() -> Result<(), Box<dyn std::error::Error>>
    {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(
            ScriptedFetcher::failing(Metric::Rain, Failure::Malformed),
            store.clone(),
        );
        let now = at(2025, 3, 1);

        let report = driver.backfill(now, now - TimeDelta::days(14)).await?;

        assert_eq!(report, BackfillReport { windows: 2, cancelled: false });
        assert_eq!(driver.state(), DriverState::Waiting);
        assert!(store.observations(Metric::Rain).is_empty());
        assert_eq!(store.observations(Metric::Wind).len(), 2 * 168 + 1);
        assert_eq!(driver.stats().snapshot().normalization_errors, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_due_flush_is_retried_at_next_due_flush(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::builder()
            .fetcher(ScriptedFetcher::default())
            .store(store.clone())
            .metrics(vec![Metric::Pressure])
            .backfill(backfill_settings())
            .flush_retries(0)
            .flush_retry_delay(Duration::ZERO)
            .build();
        store.fail_next_writes(1);
        let now = at(2025, 3, 1);

        let report = driver.backfill(now, now - TimeDelta::days(56)).await?;

        assert_eq!(report.windows, 8);
        assert_eq!(driver.state(), DriverState::Waiting);
        // Window 4 fails, window 5 writes windows 1-5, the final flush writes 6-8.
        assert_eq!(store.write_count(), 2);
        let stats = driver.stats().snapshot();
        assert_eq!(stats.flush_failures, 1);
        assert_eq!(stats.flush_successes, 2);
        // The instant shared by windows 5 and 6 is written twice.
        assert_eq!(stats.points_written, 8 * 168 + 2);
        assert_eq!(store.observations(Metric::Pressure).len(), 8 * 168 + 1);
        assert_eq!(driver.buffered(Metric::Pressure).await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_final_flush_fails_the_backfill() {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::builder()
            .fetcher(ScriptedFetcher::default())
            .store(store.clone())
            .metrics(vec![Metric::Pressure])
            .backfill(backfill_settings())
            .flush_retries(0)
            .flush_retry_delay(Duration::ZERO)
            .build();
        store.fail_next_writes(1);
        let now = at(2025, 3, 1);

        let result = driver.backfill(now, now - TimeDelta::days(14)).await;

        assert!(matches!(
            result,
            Err(DriverError::Persistence { metric: Metric::Pressure, .. })
        ));
        assert_eq!(driver.state(), DriverState::Failed);
        assert!(store.is_empty());
        assert_eq!(driver.buffered(Metric::Pressure).await, 2 * 168 + 1);
    }

    #[tokio::test]
    async fn backfills_an_empty_store_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(ScriptedFetcher::default(), store.clone());
        let now = at(2025, 3, 1);
        let stop = at(2025, 1, 1);

        assert!(driver.needs_backfill(now).await?);
        let report = driver.backfill(now, stop).await?;

        assert_eq!(report, BackfillReport { windows: 9, cancelled: false });
        // Flushes after windows 4 and 8, then the final one, per metric.
        assert_eq!(store.write_count(), 3 * Metric::FETCHABLE.len());
        assert_eq!(driver.stats().snapshot().flush_successes, 15);
        assert_eq!(driver.state(), DriverState::Waiting);

        for metric in Metric::FETCHABLE {
            let stored = store.observations(metric);
            // 2024-12-28T00:00 through 2025-03-01T00:00, hourly.
            assert_eq!(stored.len(), 63 * 24 + 1, "{metric}");
            assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert!(stored[0].timestamp <= stop);
            assert_eq!(stored[stored.len() - 1].timestamp, now);
            assert_eq!(driver.buffered(metric).await, 0);
        }
        assert!(!driver.needs_backfill(now).await?);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_backfill_leaves_store_unchanged() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(ScriptedFetcher::default(), store.clone());

        driver.backfill(at(2025, 3, 1), at(2025, 2, 1)).await?;
        let first = store.snapshot();
        driver.backfill(at(2025, 3, 1), at(2025, 2, 1)).await?;
        assert_eq!(store.snapshot(), first);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_aborts_backfill_after_flushing() {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(
            ScriptedFetcher::failing(Metric::Rain, Failure::Permanent),
            store.clone(),
        );

        let result = driver.backfill(at(2025, 3, 1), at(2025, 1, 1)).await;

        assert!(matches!(
            result,
            Err(DriverError::PermanentFetch { metric: Metric::Rain, .. })
        ));
        assert_eq!(driver.state(), DriverState::Failed);
        assert_eq!(driver.fetcher.calls.load(Ordering::SeqCst), 5);
        assert_eq!(store.observations(Metric::Temperature).len(), 169);
        assert_eq!(driver.stats().snapshot().permanent_failures, 1);
    }

    #[tokio::test]
    async fn permanent_failure_while_polling_waits_for_next_tick(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(
            ScriptedFetcher::failing(Metric::Sunshine, Failure::Permanent),
            store.clone(),
        );

        let outcome = driver.poll_once(at(2025, 3, 1)).await?;

        assert!(matches!(outcome, PollOutcome::Completed { failed: 1, .. }));
        assert_eq!(driver.state(), DriverState::Waiting);
        assert_eq!(store.observations(Metric::Temperature).len(), 25);
        assert!(store.observations(Metric::Sunshine).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failed_flush_is_retried_on_next_tick() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(ScriptedFetcher::default(), store.clone());
        store.fail_next_writes(Metric::FETCHABLE.len());

        let outcome = driver.poll_once(at(2025, 3, 1)).await?;
        assert_eq!(outcome, PollOutcome::Completed { written: 0, failed: 0 });
        assert!(store.is_empty());
        assert_eq!(driver.buffered(Metric::Pressure).await, 25);

        driver.poll_once(at(2025, 3, 1) + TimeDelta::hours(1)).await?;
        assert_eq!(driver.buffered(Metric::Pressure).await, 0);
        assert_eq!(store.observations(Metric::Pressure).len(), 26);

        let stats = driver.stats().snapshot();
        assert_eq!(stats.flush_failures, 5);
        assert_eq!(stats.flush_successes, 5);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() -> Result<(), DriverError> {
        let store = Arc::new(MemoryStore::new());
        let driver = driver(ScriptedFetcher::default(), store.clone());

        let _running = driver.tick.lock().await;
        assert_eq!(driver.poll_once(at(2025, 3, 1)).await?, PollOutcome::Skipped);
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_backfill_flushes_and_stops() -> Result<(), DriverError> {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let fetcher = ScriptedFetcher {
            cancel_on_first_call: Some(cancel.clone()),
            ..Default::default()
        };
        let driver = Driver::builder()
            .fetcher(fetcher)
            .store(store.clone())
            .backfill(BackfillSettings {
                politeness: Duration::from_secs(3600),
                ..Default::default()
            })
            .cancel(cancel)
            .build();

        let report = driver.backfill(at(2025, 3, 1), at(2025, 1, 1)).await?;

        assert_eq!(report, BackfillReport { windows: 1, cancelled: true });
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(store.observations(Metric::Rain).len(), 169);
        Ok(())
    }

    #[tokio::test]
    async fn derives_wind_chill_on_flush() -> Result<(), Box<dyn std::error::Error>> {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::builder()
            .fetcher(ScriptedFetcher::default())
            .store(store.clone())
            .metrics(vec![Metric::Temperature, Metric::Wind])
            .derive_wind_chill(true)
            .build();

        driver.poll_once(at(2025, 3, 1)).await?;

        let chill = store.observations(Metric::WindChill);
        assert_eq!(chill.len(), 25);
        let expected = (wind_chill(0.0, 20.0) * 10.0).round() / 10.0;
        assert!(chill.iter().all(|o| o.value == expected));
        assert!(store.observations(Metric::Rain).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn existing_coverage_skips_backfill() -> Result<(), DriverError> {
        let now = at(2025, 3, 1);
        let store = Arc::new(MemoryStore::with_points([Observation::new(
            Metric::Temperature,
            now - TimeDelta::days(30),
            4.0,
        )]));
        let driver = driver(ScriptedFetcher::default(), store);
        assert!(!driver.needs_backfill(now).await?);
        Ok(())
    }

    #[tokio::test]
    async fn derived_metrics_are_not_fetched() {
        let driver = Driver::builder()
            .fetcher(ScriptedFetcher::default())
            .store(Arc::new(MemoryStore::new()))
            .metrics(vec![Metric::WindChill, Metric::Rain, Metric::Rain])
            .build();
        assert_eq!(driver.metrics().to_vec(), vec![Metric::Rain]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_ticks_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let driver = Driver::builder()
            .fetcher(ScriptedFetcher::default())
            .store(store.clone())
            .metrics(vec![Metric::Pressure])
            .poll(PollSettings {
                interval: Duration::from_secs(600),
                ..Default::default()
            })
            .build();
        let cancel = driver.cancellation_token();

        tokio::join!(driver.poll_loop(), async {
            tokio::time::sleep(Duration::from_secs(1_500)).await;
            cancel.cancel();
        });

        assert_eq!(driver.stats().snapshot().windows_fetched, 3);
        assert_eq!(driver.state(), DriverState::Stopped);
        assert!(!store.is_empty());
    }
}
