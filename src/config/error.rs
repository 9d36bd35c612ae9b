use crate::fetch::error::FetchError;
use crate::sink::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Could not determine a data directory, set destination.path")]
    NoDataDir,

    #[error(transparent)]
    Fetcher(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
