use crate::buffer::merge_buffer::FlushUnit;
use crate::sink::error::StoreError;
use crate::sink::Store;
use crate::types::metric::Metric;
use crate::types::observation::{Observation, TimeRange};
use crate::utils::ensure_dir_exists;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use polars::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::task;

const TIMESTAMP_COLUMN: &str = "timestamp_ms";
const VALUE_COLUMN: &str = "value";
const WRITTEN_COLUMN: &str = "written_ns";

/// Writes each flush unit as one parquet file under `<root>/<metric>/`.
///
/// Files are named `<first_ms>_<last_ms>.parquet`, so rewriting a unit with
/// the same extent replaces its file. Files are written to a temporary path
/// in the same directory and renamed into place.
///
/// Every file carries the instant it was written. When extents overlap,
/// [`ParquetStore::load`] keeps the value from the most recent write.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
    last_write: Arc<AtomicI64>,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_write: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Write stamp in nanoseconds, strictly increasing within this store.
    fn next_write_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let previous = self
            .last_write
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metric_dir(&self, metric: Metric) -> PathBuf {
        self.root.join(metric.field_name())
    }

    fn file_name(range: TimeRange) -> String {
        format!(
            "{}_{}.parquet",
            range.start.timestamp_millis(),
            range.end.timestamp_millis()
        )
    }

    fn parse_file_name(path: &Path) -> Option<TimeRange> {
        let stem = path.file_name()?.to_str()?.strip_suffix(".parquet")?;
        let (start, end) = stem.split_once('_')?;
        let start = DateTime::<Utc>::from_timestamp_millis(start.parse().ok()?)?;
        let end = DateTime::<Utc>::from_timestamp_millis(end.parse().ok()?)?;
        Some(TimeRange::new(start, end))
    }

    /// Files stored for `metric` with their time extent, ordered by extent.
    pub async fn files(&self, metric: Metric) -> Result<Vec<(TimeRange, PathBuf)>, StoreError> {
        let dir = self.metric_dir(metric);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(dir, e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(dir.clone(), e))?
        {
            let path = entry.path();
            if let Some(range) = Self::parse_file_name(&path) {
                files.push((range, path));
            }
        }
        files.sort_by_key(|(range, _)| (range.start, range.end));
        Ok(files)
    }

    /// Reads back every stored observation of `metric`, sorted by timestamp.
    ///
    /// Where files overlap, the most recently written file wins.
    pub async fn load(&self, metric: Metric) -> Result<Vec<Observation>, StoreError> {
        let files = self.files(metric).await?;
        let paths: Vec<PathBuf> = files.into_iter().map(|(_, path)| path).collect();

        let points = task::spawn_blocking(move || {
            let mut stored = paths
                .iter()
                .map(|path| read_points(path))
                .collect::<Result<Vec<_>, _>>()?;
            stored.sort_by_key(|file| file.written);

            let mut points = BTreeMap::new();
            for file in stored {
                points.extend(file.points);
            }
            Ok::<_, StoreError>(points)
        })
        .await??;

        Ok(points
            .into_iter()
            .map(|(ts, value)| Observation::new(metric, ts, value))
            .collect())
    }
}

struct StoredFile {
    written: i64,
    points: Vec<(DateTime<Utc>, f64)>,
}

fn read_points(path: &Path) -> Result<StoredFile, StoreError> {
    let file = std::fs::File::open(path).map_err(|e| StoreError::Io(path.to_path_buf(), e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::ParquetRead(path.to_path_buf(), e))?;

    let read_err = |e| StoreError::ParquetRead(path.to_path_buf(), e);
    let timestamps = df
        .column(TIMESTAMP_COLUMN)
        .map_err(read_err)?
        .as_materialized_series()
        .i64()
        .map_err(read_err)?
        .clone();
    let values = df
        .column(VALUE_COLUMN)
        .map_err(read_err)?
        .as_materialized_series()
        .f64()
        .map_err(read_err)?
        .clone();

    let written = df
        .column(WRITTEN_COLUMN)
        .map_err(read_err)?
        .as_materialized_series()
        .i64()
        .map_err(read_err)?
        .get(0)
        .unwrap_or_default();

    let points = timestamps
        .into_iter()
        .zip(values.into_iter())
        .filter_map(|(ts, value)| {
            let ts = DateTime::<Utc>::from_timestamp_millis(ts?)?;
            Some((ts, value?))
        })
        .collect();
    Ok(StoredFile { written, points })
}

fn write_unit(dir: &Path, path: &Path, unit: &FlushUnit, written: i64) -> Result<(), StoreError> {
    let timestamps: Vec<i64> = unit
        .observations
        .iter()
        .map(|o| o.timestamp.timestamp_millis())
        .collect();
    let values: Vec<f64> = unit.observations.iter().map(|o| o.value).collect();

    let mut df = DataFrame::new(vec![
        Column::new(TIMESTAMP_COLUMN.into(), timestamps),
        Column::new(VALUE_COLUMN.into(), values),
        Column::new(WRITTEN_COLUMN.into(), vec![written; unit.len()]),
    ])
    .map_err(|e| StoreError::ParquetWrite(path.to_path_buf(), e))?;

    let mut temp_file =
        NamedTempFile::new_in(dir).map_err(|e| StoreError::Io(dir.to_path_buf(), e))?;
    ParquetWriter::new(temp_file.as_file_mut())
        .with_compression(ParquetCompression::Snappy)
        .finish(&mut df)
        .map_err(|e| StoreError::ParquetWrite(path.to_path_buf(), e))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::Io(path.to_path_buf(), e.error))?;
    Ok(())
}

#[async_trait]
impl Store for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    async fn upsert(&self, unit: &FlushUnit) -> Result<usize, StoreError> {
        let Some(range) = unit.range() else {
            return Ok(0);
        };
        let dir = self.metric_dir(unit.metric);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::DirCreation(dir.clone(), e))?;
        let path = dir.join(Self::file_name(range));

        let written = unit.len();
        let unit = unit.clone();
        let target = path.clone();
        let stamp = self.next_write_stamp();
        task::spawn_blocking(move || write_unit(&dir, &target, &unit, stamp)).await??;

        debug!("Wrote {} points to {}", written, path.display());
        Ok(written)
    }

    async fn has_coverage(&self, range: TimeRange) -> Result<bool, StoreError> {
        for metric in Metric::ALL {
            let files = self.files(metric).await?;
            if files.iter().any(|(extent, _)| extent.overlaps(&range)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn health(&self) -> Result<(), StoreError> {
        ensure_dir_exists(&self.root).await?;

        // Probe that the directory is writable.
        let root = self.root.clone();
        task::spawn_blocking(move || {
            NamedTempFile::new_in(&root)
                .map(drop)
                .map_err(|e| StoreError::Unhealthy(format!("{} is not writable: {}", root.display(), e)))
        })
        .await?
    }
}
