use crate::buffer::merge_buffer::{FlushUnit, MergeBuffer};
use crate::sink::error::StoreError;
use crate::sink::Store;
use crate::types::metric::Metric;
use log::{error, info, warn};
use std::time::Duration;

/// Writes buffered units to a [`Store`], clearing them from the buffer only
/// once the store has accepted them.
pub struct Flusher<S> {
    store: S,
    retries: u32,
    retry_delay: Duration,
}

impl<S: Store> Flusher<S> {
    /// `retries` immediate re-attempts follow a failed write.
    pub fn new(store: S, retries: u32, retry_delay: Duration) -> Self {
        Self {
            store,
            retries,
            retry_delay,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes one unit, retrying up to the configured count.
    pub async fn write(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.upsert(unit).await {
                Ok(written) => return Ok(written),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Writing {} {} points to {} failed (retry {}/{}): {}",
                        unit.len(),
                        unit.metric,
                        self.store.name(),
                        attempt,
                        self.retries,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        "Writing {} {} points to {} failed, keeping them buffered: {}",
                        unit.len(),
                        unit.metric,
                        self.store.name(),
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Snapshots `metric`, writes it and acknowledges it in the buffer.
    ///
    /// On failure the buffer is left as it was. Returns the points written.
    pub async fn flush(&self, buffer: &mut MergeBuffer, metric: Metric) -> Result<usize, StoreError> {
        let Some(unit) = buffer.snapshot(metric) else {
            return Ok(0);
        };
        let written = self.write(&unit).await?;
        buffer.acknowledge(&unit);
        if let Some(range) = unit.range() {
            info!(
                "Flushed {} {} points ({} .. {}) to {}",
                written,
                metric,
                range.start,
                range.end,
                self.store.name()
            );
        }
        Ok(written)
    }
}
