use serde::Serialize;
use std::fmt;

/// Phase of an ingestion session, published on the driver's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    /// Waiting for the destination, then checking its coverage.
    Bootstrapping,
    Backfilling,
    /// Between poll ticks.
    Waiting,
    Polling,
    Stopped,
    /// A backfill aborted on a permanent failure.
    Failed,
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DriverState::Stopped | DriverState::Failed)
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Bootstrapping => "bootstrapping",
            DriverState::Backfilling => "backfilling",
            DriverState::Waiting => "waiting",
            DriverState::Polling => "polling",
            DriverState::Stopped => "stopped",
            DriverState::Failed => "failed",
        };
        f.write_str(name)
    }
}
