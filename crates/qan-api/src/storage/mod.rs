//! Storage gateway: object store factory, partition layout and the traits
//! the buffer and the retention pruner write through.
//!
//! Rows are stored as Parquet using Hive-style date partitioning:
//!
//! ```text
//! metrics/date={YYYY-MM-DD}/{batch}.parquet
//! ```
//!
//! `{batch}` is the [`BatchId`] of the insert that wrote the file, so every
//! attempt at the same insert lands on the same object name.
//!
//! A partition is one `date=` directory. Dropping it deletes every object
//! below that prefix.

mod parquet_store;

pub use parquet_store::ParquetStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use object_store::limit::LimitStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use url::Url;

use crate::config::{PoolConfig, StorageConfig};
use crate::model::MetricRow;
use crate::schema::{METRICS_TABLE, PARTITION_COLUMN, PARTITION_DATE_FORMAT};
use crate::QanError;

/// Identity of one logical insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(ulid::Ulid);

impl BatchId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Batch insert of aggregated rows.
#[async_trait]
pub trait MetricsWriter: Send + Sync {
    /// Persist `rows` as batch `batch`.
    ///
    /// Repeating the call with the same id and rows replaces whatever an
    /// earlier attempt committed, so a retried batch is stored once.
    async fn insert_batch(&self, batch: BatchId, rows: &[MetricRow]) -> Result<(), QanError>;

    /// Persist `rows` as a new batch.
    async fn insert(&self, rows: &[MetricRow]) -> Result<(), QanError> {
        self.insert_batch(BatchId::new(), rows).await
    }
}

/// Partition enumeration and removal for retention.
#[async_trait]
pub trait PartitionManager: Send + Sync {
    /// Dates of all partitions currently present, ascending.
    async fn list_partitions(&self) -> Result<Vec<NaiveDate>, QanError>;

    /// Delete every object of one partition. Returns how many were removed.
    async fn drop_partition(&self, date: NaiveDate) -> Result<usize, QanError>;
}

/// Create an object store from configuration.
///
/// The store is wrapped in a [`LimitStore`] so no more than
/// `pool.max_open_conns` requests are in flight at once. For remote
/// backends the HTTP client keeps at most `pool.max_idle_conns` idle
/// connections per host.
///
/// # Errors
///
/// Returns an error if the object store cannot be created (e.g., invalid path,
/// missing credentials for cloud storage).
pub fn create_object_store(
    config: &StorageConfig,
    pool: &PoolConfig,
) -> Result<Arc<dyn ObjectStore>, QanError> {
    match config {
        StorageConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            let store = LocalFileSystem::new_with_prefix(path)?;
            Ok(Arc::new(LimitStore::new(store, pool.max_open_conns)))
        }
        StorageConfig::Memory => Ok(Arc::new(LimitStore::new(
            InMemory::new(),
            pool.max_open_conns,
        ))),
        #[cfg(feature = "s3")]
        StorageConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            force_path_style,
            allow_http,
        } => {
            use object_store::aws::AmazonS3Builder;
            use object_store::ClientOptions;

            let client = ClientOptions::new().with_pool_max_idle_per_host(pool.max_idle_conns);
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_client_options(client);

            if let Some(r) = region {
                builder = builder.with_region(r);
            }
            if let Some(ref ep) = endpoint {
                builder = builder.with_endpoint(ep);
            }
            if let Some(ref key) = access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(ref secret) = secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            if *force_path_style {
                builder = builder.with_virtual_hosted_style_request(false);
            }
            if *allow_http {
                builder = builder.with_allow_http(true);
            }

            let store = builder.build()?;
            if prefix.is_empty() {
                Ok(Arc::new(LimitStore::new(store, pool.max_open_conns)))
            } else {
                let store = object_store::prefix::PrefixStore::new(store, prefix.as_str());
                Ok(Arc::new(LimitStore::new(store, pool.max_open_conns)))
            }
        }
        #[cfg(not(feature = "s3"))]
        StorageConfig::S3 { .. } => Err(QanError::Config(
            "S3 storage requires the 's3' feature to be enabled".to_owned(),
        )),
    }
}

/// Get the base URL for DataFusion table registration.
///
/// - Local: absolute `file://` URL of the storage directory
/// - Memory: `memory://`
/// - S3: `s3://{bucket}`; the prefix is applied by the store itself
pub fn base_url(config: &StorageConfig) -> Result<String, QanError> {
    match config {
        StorageConfig::Local { path } => {
            let absolute = std::fs::canonicalize(path)?;
            let url = Url::from_directory_path(&absolute).map_err(|()| {
                QanError::Config(format!("invalid storage path: {}", absolute.display()))
            })?;
            Ok(url.as_str().trim_end_matches('/').to_owned())
        }
        StorageConfig::Memory => Ok("memory://".to_owned()),
        StorageConfig::S3 { bucket, .. } => Ok(format!("s3://{bucket}")),
    }
}

/// Check the store is reachable once at startup. A failure here is fatal.
pub async fn check_connectivity(store: &dyn ObjectStore) -> Result<(), QanError> {
    store.list_with_delimiter(None).await?;
    Ok(())
}

/// Directory prefix of the partition for `date`.
pub fn partition_prefix(date: NaiveDate) -> Path {
    Path::from(format!(
        "{METRICS_TABLE}/{PARTITION_COLUMN}={}",
        date.format(PARTITION_DATE_FORMAT)
    ))
}

/// File written by `batch` inside the partition for `date`.
pub fn partition_file_path(date: NaiveDate, batch: BatchId) -> Path {
    partition_prefix(date).child(format!("{batch}.parquet"))
}

/// Parse a `date=YYYY-MM-DD` path segment back into a date.
pub fn parse_partition_segment(segment: &str) -> Option<NaiveDate> {
    let value = segment.strip_prefix(PARTITION_COLUMN)?.strip_prefix('=')?;
    NaiveDate::parse_from_str(value, PARTITION_DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn partition_file_path_layout() {
        let batch = BatchId::new();
        let path = partition_file_path(date(2024, 1, 15), batch).to_string();

        assert_eq!(path, format!("metrics/date=2024-01-15/{batch}.parquet"));
    }

    #[test]
    fn same_batch_same_file() {
        let batch = BatchId::new();
        assert_eq!(
            partition_file_path(date(2024, 1, 15), batch),
            partition_file_path(date(2024, 1, 15), batch)
        );
        assert_ne!(
            partition_file_path(date(2024, 1, 15), batch),
            partition_file_path(date(2024, 1, 15), BatchId::new())
        );
    }

    #[test]
    fn partition_segment_roundtrip() {
        let prefix = partition_prefix(date(2024, 2, 29));
        let segment = prefix.parts().last().unwrap();

        assert_eq!(
            parse_partition_segment(segment.as_ref()),
            Some(date(2024, 2, 29))
        );
    }

    #[test]
    fn foreign_segments_ignored() {
        assert_eq!(parse_partition_segment("hour=12"), None);
        assert_eq!(parse_partition_segment("date=yesterday"), None);
        assert_eq!(parse_partition_segment("date2024-01-01"), None);
    }

    #[test]
    fn base_url_memory() {
        assert_eq!(base_url(&StorageConfig::Memory).unwrap(), "memory://");
    }

    #[test]
    fn base_url_s3_is_bucket_root() {
        let config = StorageConfig::S3 {
            bucket: "my-bucket".to_string(),
            prefix: "qan".to_string(),
            region: Some("eu-west-1".to_string()),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
            allow_http: false,
        };
        assert_eq!(base_url(&config).unwrap(), "s3://my-bucket");
    }

    #[test]
    fn base_url_local_is_absolute() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::Local {
            path: temp_dir.path().to_path_buf(),
        };

        let url = base_url(&config).unwrap();
        assert!(url.starts_with("file:///"));
        assert!(!url.ends_with('/'));
    }

    #[tokio::test]
    async fn create_local_store_is_reachable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::Local {
            path: temp_dir.path().join("nested"),
        };
        let store = create_object_store(&config, &PoolConfig::default()).unwrap();

        check_connectivity(store.as_ref()).await.unwrap();

        let path = Path::from("reachable.txt");
        store.put(&path, "hello".into()).await.unwrap();
        let bytes = store.get(&path).await.unwrap().bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }
}
