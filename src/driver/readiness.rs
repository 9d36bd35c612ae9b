use crate::driver::error::DriverError;
use crate::sink::Store;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fixed-interval probing of the destination before a session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_secs: 5,
        }
    }
}

impl ReadinessPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Proof that the destination answered its health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub attempts: u32,
}

/// Probes `store` until it is healthy, up to `policy.attempts` times.
pub async fn await_ready<S: Store + ?Sized>(
    store: &S,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Ready, DriverError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.health().await {
            Ok(()) => {
                info!("Destination {} is ready", store.name());
                return Ok(Ready { attempts: attempt });
            }
            Err(e) if attempt >= attempts => {
                return Err(DriverError::ReadinessTimeout {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                warn!(
                    "Destination {} not ready (attempt {}/{}): {}",
                    store.name(),
                    attempt,
                    attempts,
                    e
                );
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(DriverError::Cancelled),
            _ = tokio::time::sleep(policy.interval()) => {}
        }
    }
}
