//! Destination stores and the flush path that writes buffered units to them.
//!
//! Every store upserts by `(metric, timestamp)`: writing the same
//! [`FlushUnit`] twice leaves the stored state unchanged.

pub mod error;
pub mod flusher;
pub mod influx_store;
pub mod memory_store;
pub mod parquet_store;

use crate::buffer::merge_buffer::FlushUnit;
use crate::sink::error::StoreError;
use crate::sink::influx_store::InfluxStore;
use crate::sink::memory_store::MemoryStore;
use crate::sink::parquet_store::ParquetStore;
use crate::types::observation::TimeRange;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Store: Send + Sync {
    fn name(&self) -> &str;

    /// Writes the whole unit or nothing. Returns the number of points written.
    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError>;

    /// Whether any point exists within `range`.
    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError>;

    /// Readiness probe.
    async fn health(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: Store + ?Sized> Store for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        (**self).upsert(unit).await
    }

    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError> {
        (**self).has_coverage(range).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        (**self).health().await
    }
}

/// Any of the built-in stores, as selected by configuration.
pub enum AnyStore {
    Influx(InfluxStore),
    Parquet(ParquetStore),
    Memory(MemoryStore),
}

#[async_trait]
impl Store for AnyStore {
    fn name(&self) -> &str {
        match self {
            AnyStore::Influx(s) => s.name(),
            AnyStore::Parquet(s) => s.name(),
            AnyStore::Memory(s) => s.name(),
        }
    }

    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        match self {
            AnyStore::Influx(s) => s.upsert(unit).await,
            AnyStore::Parquet(s) => s.upsert(unit).await,
            AnyStore::Memory(s) => s.upsert(unit).await,
        }
    }

    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError> {
        match self {
            AnyStore::Influx(s) => s.has_coverage(range).await,
            AnyStore::Parquet(s) => s.has_coverage(range).await,
            AnyStore::Memory(s) => s.has_coverage(range).await,
        }
    }

    async fn health(&self) -> Result<(), StoreError> {
        match self {
            AnyStore::Influx(s) => s.health().await,
            AnyStore::Parquet(s) => s.health().await,
            AnyStore::Memory(s) => s.health().await,
        }
    }
}
