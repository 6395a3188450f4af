//! DataFusion query engine setup.
//!
//! Configures a DataFusion SessionContext with a ListingTable over the
//! `metrics` directory, with automatic Hive-style partition pruning on
//! `date`.

use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::{DataType, SchemaRef};
use arrow::record_batch::RecordBatch;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::prelude::*;
use datafusion::sql::TableReference;
use object_store::ObjectStore;
use url::Url;

use crate::config::DEFAULT_QUERY_TIMEOUT_SECS;
use crate::schema::{METRICS_TABLE, PARTITION_COLUMN};
use crate::QanError;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);

/// Query engine wrapping a DataFusion SessionContext.
pub struct QueryEngine {
    ctx: SessionContext,
    base_url: Url,
    query_timeout: Option<Duration>,
}

impl QueryEngine {
    /// Create a query engine over `store` and register the metrics table
    /// with `table_schema` (the storage schema, without partition columns).
    ///
    /// The `base_url` is the root URL of the data (e.g. `file:///data/qan`
    /// or `s3://bucket`).
    ///
    /// For local filesystem storage this registers a `LocalFileSystem` at
    /// the `file:///` root instead of `store`, because DataFusion resolves
    /// local listing URLs against the scheme root.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        base_url: &str,
        table_schema: SchemaRef,
    ) -> Result<Self, QanError> {
        let ctx = SessionContext::new();
        let url = Url::parse(base_url)?;

        if url.scheme() == "file" {
            let root_url = Url::parse("file:///")?;
            let local_store: Arc<dyn ObjectStore> =
                Arc::new(object_store::local::LocalFileSystem::new());
            ctx.register_object_store(&root_url, local_store);
        } else {
            ctx.register_object_store(&url, store);
        }

        let engine = Self {
            ctx,
            base_url: url,
            query_timeout: Some(DEFAULT_QUERY_TIMEOUT),
        };
        engine.register_metrics_table(table_schema)?;

        Ok(engine)
    }

    /// Set a query timeout. Use `None` to disable it.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    fn register_metrics_table(&self, schema: SchemaRef) -> Result<(), QanError> {
        let table_path = format!("{}/{METRICS_TABLE}/", self.base_url);

        // DataFusion extracts the partition value from
        //   metrics/date=2024-01-15/file.parquet
        // and adds it as a virtual column.
        let listing_options = ListingOptions::new(Arc::new(ParquetFormat::default()))
            .with_file_extension(".parquet")
            .with_collect_stat(true)
            .with_table_partition_cols(vec![(PARTITION_COLUMN.to_owned(), DataType::Utf8)]);

        let table_url = ListingTableUrl::parse(&table_path)
            .map_err(|e| QanError::Config(format!("invalid table path: {e}")))?;

        let config = ListingTableConfig::new(table_url)
            .with_listing_options(listing_options)
            .with_schema(schema);

        let table = ListingTable::try_new(config)?;
        self.ctx
            .register_table(TableReference::bare(METRICS_TABLE), Arc::new(table))?;

        tracing::info!(path = %table_path, "Registered metrics table with partition pruning");

        Ok(())
    }

    /// Execute a SQL query and collect all results.
    ///
    /// The query is subject to the configured timeout (default 30 seconds).
    #[tracing::instrument(skip(self), fields(sql_len = sql.len()))]
    pub async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>, QanError> {
        let df = self.ctx.sql(sql).await?;

        let collect_future = df.collect();

        if let Some(timeout) = self.query_timeout {
            match tokio::time::timeout(timeout, collect_future).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(QanError::QueryTimeout { duration: timeout }),
            }
        } else {
            collect_future.await.map_err(Into::into)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::metrics_storage_schema;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn empty_table_returns_no_rows() {
        let store = Arc::new(InMemory::new());
        let engine = QueryEngine::new(store, "memory://", metrics_storage_schema()).unwrap();

        let results = engine
            .query("SELECT fingerprint FROM metrics")
            .await
            .unwrap();

        let total: usize = results.iter().map(RecordBatch::num_rows).sum();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn partition_column_is_queryable() {
        let store = Arc::new(InMemory::new());
        let engine = QueryEngine::new(store, "memory://", metrics_storage_schema()).unwrap();

        let result = engine
            .query("SELECT date, metric FROM metrics WHERE date >= '2024-01-01'")
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invalid_sql_is_an_error() {
        let store = Arc::new(InMemory::new());
        let engine = QueryEngine::new(store, "memory://", metrics_storage_schema()).unwrap();

        let result = engine.query("SELECT nope FROM nowhere").await;
        assert!(matches!(result, Err(QanError::DataFusion(_))));
    }
}
