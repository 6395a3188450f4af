//! Composable test fixtures using rstest.
//!
//! ```text
//! memory_store
//!    └── parquet_store (migrated schema, InMemory backend)
//!           └── analytics (AnalyticsService over sample rows)
//! ```
//!
//! Plus scripted [`MetricsWriter`], [`PartitionManager`] and [`ObjectStore`]
//! doubles for the buffer, storage and retention tests.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOpts, PutOptions, PutPayload, PutResult,
};
use parking_lot::Mutex;
use rstest::fixture;
use tokio::sync::Semaphore;

use crate::config::{BufferConfig, ParquetConfig, ServerConfig};
use crate::model::{MetricRow, MetricStats, Tags};
use crate::schema::metrics_storage_schema;
use crate::storage::{BatchId, MetricsWriter, ParquetStore, PartitionManager};
use crate::QanError;

/// 2024-01-15T00:00:00Z
pub const DAY_START: i64 = 1_705_276_800;

/// Listener config on OS-assigned ports with short shutdown timings.
#[fixture]
pub fn server_config() -> ServerConfig {
    ServerConfig {
        grpc_addr: "127.0.0.1:0".parse().unwrap(),
        json_addr: "127.0.0.1:0".parse().unwrap(),
        debug_addr: "127.0.0.1:0".parse().unwrap(),
        shutdown_grace_ms: 200,
        hard_deadline_secs: 5,
        restart_initial_delay_ms: 10,
        restart_max_delay_ms: 100,
        max_recv_msg_bytes: 4 * 1024 * 1024,
    }
}

#[fixture]
pub fn buffer_config() -> BufferConfig {
    BufferConfig {
        window_secs: 1,
        max_open_buckets: 1_000,
        max_draining_windows: 2,
        flush_max_retries: 2,
        flush_initial_delay_ms: 10,
        flush_max_delay_ms: 100,
    }
}

#[fixture]
pub fn parquet_config() -> ParquetConfig {
    ParquetConfig {
        row_group_size: 1_000,
    }
}

#[fixture]
pub fn memory_store() -> Arc<dyn ObjectStore> {
    Arc::new(InMemory::new())
}

/// Parquet store over an in-memory backend using the current schema.
#[fixture]
pub fn parquet_store(
    memory_store: Arc<dyn ObjectStore>,
    parquet_config: ParquetConfig,
) -> Arc<ParquetStore> {
    Arc::new(
        ParquetStore::new(
            memory_store,
            "memory://",
            metrics_storage_schema(),
            &parquet_config,
        )
        .expect("failed to create parquet store"),
    )
}

/// A persisted row with the given identity and stats.
pub fn row(
    fingerprint: &str,
    period_start: i64,
    service_name: &str,
    metric: &str,
    num_queries: u64,
    stats: MetricStats,
) -> MetricRow {
    MetricRow {
        fingerprint: fingerprint.to_owned(),
        period_start,
        tags: Tags {
            service_name: service_name.to_owned(),
            database: "shop".to_owned(),
            schema: "public".to_owned(),
            username: "app".to_owned(),
            client_host: Some("10.0.0.1".to_owned()),
        },
        metric: metric.to_owned(),
        num_queries,
        stats,
    }
}

pub const fn stats(cnt: u64, sum: f64, min: f64, max: f64) -> MetricStats {
    MetricStats { cnt, sum, min, max }
}

/// Three query shapes over two services on one day.
///
/// | fingerprint | service | queries | query_time sum |
/// |-------------|---------|---------|----------------|
/// | aaa         | mysql-1 | 10      | 50.0           |
/// | bbb         | mysql-1 | 4       | 80.0           |
/// | ccc         | pg-1    | 2       | 2.0            |
pub fn sample_rows() -> Vec<MetricRow> {
    vec![
        row("aaa", DAY_START, "mysql-1", "query_time", 6, stats(6, 30.0, 1.0, 10.0)),
        row("aaa", DAY_START + 60, "mysql-1", "query_time", 4, stats(4, 20.0, 2.0, 8.0)),
        row("aaa", DAY_START, "mysql-1", "rows_sent", 6, stats(6, 600.0, 10.0, 200.0)),
        row("bbb", DAY_START, "mysql-1", "query_time", 4, stats(4, 80.0, 5.0, 40.0)),
        row("ccc", DAY_START, "pg-1", "query_time", 2, stats(2, 2.0, 0.5, 1.5)),
    ]
}

/// Records every insert it receives.
#[derive(Default)]
pub struct RecordingWriter {
    batches: Mutex<Vec<(BatchId, Vec<MetricRow>)>>,
}

impl RecordingWriter {
    pub fn rows(&self) -> Vec<MetricRow> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect()
    }

    pub fn inserts(&self) -> usize {
        self.batches.lock().len()
    }

    /// Batch id of every insert, in call order.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.batches.lock().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl MetricsWriter for RecordingWriter {
    async fn insert_batch(&self, batch: BatchId, rows: &[MetricRow]) -> Result<(), QanError> {
        self.batches.lock().push((batch, rows.to_vec()));
        Ok(())
    }
}

/// Fails every insert, recording the batch id of each attempt.
#[derive(Default)]
pub struct FailingWriter {
    attempts: Mutex<Vec<BatchId>>,
}

impl FailingWriter {
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempts.lock().len()).unwrap()
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl MetricsWriter for FailingWriter {
    async fn insert_batch(&self, batch: BatchId, _rows: &[MetricRow]) -> Result<(), QanError> {
        self.attempts.lock().push(batch);
        Err(QanError::Io(std::io::Error::other("storage unavailable")))
    }
}

/// Holds every insert until [`release`](Self::release) is called.
pub struct GatedWriter {
    gate: Semaphore,
    started: AtomicU32,
    inner: RecordingWriter,
}

impl Default for GatedWriter {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicU32::new(0),
            inner: RecordingWriter::default(),
        }
    }
}

impl GatedWriter {
    /// Let all pending and future inserts through.
    pub fn release(&self) {
        self.gate.add_permits(1_000);
    }

    /// Inserts that have been called, released or not.
    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<MetricRow> {
        self.inner.rows()
    }
}

#[async_trait]
impl MetricsWriter for GatedWriter {
    async fn insert_batch(&self, batch: BatchId, rows: &[MetricRow]) -> Result<(), QanError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        self.inner.insert_batch(batch, rows).await
    }
}

/// In-memory store whose first Parquet upload commits and then reports a
/// failure, like a write acknowledged by the backend but lost on the way
/// back to the client.
#[derive(Debug, Default)]
pub struct LostAckStore {
    inner: InMemory,
    tripped: AtomicBool,
}

impl fmt::Display for LostAckStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LostAckStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for LostAckStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        let result = self.inner.put_opts(location, payload, opts).await?;
        let parquet = location.extension() == Some("parquet");
        if parquet && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "LostAckStore",
                source: "connection reset after upload".into(),
            });
        }
        Ok(result)
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

/// Partition set with scripted drop failures.
#[derive(Default)]
pub struct ScriptedPartitions {
    present: Mutex<BTreeSet<NaiveDate>>,
    failing: BTreeSet<NaiveDate>,
    drop_calls: Mutex<Vec<NaiveDate>>,
}

impl ScriptedPartitions {
    pub fn new(present: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            present: Mutex::new(present.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Drops of `date` always fail.
    #[must_use]
    pub fn failing_on(mut self, date: NaiveDate) -> Self {
        self.failing.insert(date);
        self
    }

    pub fn present(&self) -> Vec<NaiveDate> {
        self.present.lock().iter().copied().collect()
    }

    pub fn drop_calls(&self) -> Vec<NaiveDate> {
        self.drop_calls.lock().clone()
    }
}

#[async_trait]
impl PartitionManager for ScriptedPartitions {
    async fn list_partitions(&self) -> Result<Vec<NaiveDate>, QanError> {
        Ok(self.present())
    }

    async fn drop_partition(&self, date: NaiveDate) -> Result<usize, QanError> {
        self.drop_calls.lock().push(date);
        if self.failing.contains(&date) {
            return Err(QanError::Io(std::io::Error::other("drop refused")));
        }
        Ok(usize::from(self.present.lock().remove(&date)))
    }
}
