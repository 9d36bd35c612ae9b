use crate::config::error::ConfigError;
use crate::driver::error::DriverError;
use crate::fetch::error::FetchError;
use crate::normalize::error::NormalizeError;
use crate::planner::PlanError;
use crate::sink::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
