//! Parquet-on-object-store implementation of the storage traits.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::ObjectStore;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use super::{parse_partition_segment, partition_file_path, partition_prefix};
use super::{BatchId, MetricsWriter, PartitionManager};
use crate::config::ParquetConfig;
use crate::model::MetricRow;
use crate::query::QueryEngine;
use crate::schema::{metrics_storage_schema, partition_date, rows_to_batch, METRICS_TABLE};
use crate::QanError;

/// Metrics table stored as date-partitioned Parquet files.
///
/// Writes always use the current storage schema. Reads go through a
/// DataFusion [`QueryEngine`] registered with the schema recorded by the
/// migrations, so files from older schema versions read back with nulls
/// for columns they lack.
pub struct ParquetStore {
    store: Arc<dyn ObjectStore>,
    schema: SchemaRef,
    engine: QueryEngine,
    props: WriterProperties,
}

impl ParquetStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        base_url: &str,
        table_schema: SchemaRef,
        parquet: &ParquetConfig,
    ) -> Result<Self, QanError> {
        let engine = QueryEngine::new(Arc::clone(&store), base_url, table_schema)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .set_max_row_group_size(parquet.row_group_size)
            .build();

        Ok(Self {
            store,
            schema: metrics_storage_schema(),
            engine,
            props,
        })
    }

    /// Bound every read by `timeout`; `None` lets reads run to completion.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.engine = self.engine.with_timeout(timeout);
        self
    }

    pub const fn query_timeout(&self) -> Option<Duration> {
        self.engine.timeout()
    }

    /// Run a read-only SQL statement against the `metrics` table.
    pub async fn select(&self, sql: &str) -> Result<Vec<RecordBatch>, QanError> {
        self.engine.query(sql).await
    }

    async fn write_partition(
        &self,
        batch: BatchId,
        date: NaiveDate,
        rows: &[&MetricRow],
    ) -> Result<Path, QanError> {
        let record_batch = rows_to_batch(&self.schema, rows)?;

        let mut buffer = Vec::new();
        let mut writer =
            AsyncArrowWriter::try_new(&mut buffer, self.schema.clone(), Some(self.props.clone()))?;
        writer.write(&record_batch).await?;
        writer.close().await?;

        // a plain put overwrites, so a retry replaces a committed earlier attempt
        let path = partition_file_path(date, batch);
        self.store.put(&path, buffer.into()).await?;
        Ok(path)
    }
}

#[async_trait]
impl MetricsWriter for ParquetStore {
    /// Writes one object per partition date touched by `rows`.
    async fn insert_batch(&self, batch: BatchId, rows: &[MetricRow]) -> Result<(), QanError> {
        let mut partitions: BTreeMap<NaiveDate, Vec<&MetricRow>> = BTreeMap::new();
        for row in rows {
            let date = partition_date(row.period_start).ok_or_else(|| {
                QanError::InvalidArgument(format!(
                    "period_start {} has no calendar date",
                    row.period_start
                ))
            })?;
            partitions.entry(date).or_default().push(row);
        }

        for (date, mut rows) in partitions {
            rows.sort_by(|a, b| {
                a.period_start
                    .cmp(&b.period_start)
                    .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            });
            let path = self.write_partition(batch, date, &rows).await?;
            tracing::debug!(%path, rows = rows.len(), "Wrote partition file");
        }

        Ok(())
    }
}

#[async_trait]
impl PartitionManager for ParquetStore {
    async fn list_partitions(&self) -> Result<Vec<NaiveDate>, QanError> {
        let listing = self
            .store
            .list_with_delimiter(Some(&Path::from(METRICS_TABLE)))
            .await?;

        let mut dates: Vec<NaiveDate> = listing
            .common_prefixes
            .iter()
            .filter_map(|prefix| prefix.filename().and_then(parse_partition_segment))
            .collect();
        dates.sort_unstable();
        dates.dedup();
        Ok(dates)
    }

    async fn drop_partition(&self, date: NaiveDate) -> Result<usize, QanError> {
        let prefix = partition_prefix(date);
        let locations = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location)
            .boxed();

        let deleted: Vec<Path> = self.store.delete_stream(locations).try_collect().await?;
        Ok(deleted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricStats, Tags};
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Float64Type, Int64Type, UInt64Type};
    use object_store::memory::InMemory;

    fn store() -> ParquetStore {
        ParquetStore::new(
            Arc::new(InMemory::new()),
            "memory://",
            metrics_storage_schema(),
            &ParquetConfig::default(),
        )
        .unwrap()
    }

    fn row(fingerprint: &str, period_start: i64, metric: &str, sum: f64) -> MetricRow {
        MetricRow {
            fingerprint: fingerprint.to_owned(),
            period_start,
            tags: Tags {
                service_name: "mysql-1".to_owned(),
                database: "shop".to_owned(),
                ..Tags::default()
            },
            metric: metric.to_owned(),
            num_queries: 2,
            stats: MetricStats {
                cnt: 2,
                sum,
                min: 1.0,
                max: sum - 1.0,
            },
        }
    }

    // 2024-01-15T00:00:00Z
    const DAY: i64 = 1_705_276_800;

    #[tokio::test]
    async fn insert_then_select() {
        let store = store();
        store
            .insert(&[row("a", DAY, "query_time", 3.0), row("b", DAY + 60, "query_time", 5.0)])
            .await
            .unwrap();

        let batches = store
            .select("SELECT SUM(m_sum) AS s, SUM(num_queries) AS n FROM metrics WHERE date = '2024-01-15'")
            .await
            .unwrap();

        let batch = &batches[0];
        assert_eq!(batch.column(0).as_primitive::<Float64Type>().value(0), 8.0);
        assert_eq!(batch.column(1).as_primitive::<UInt64Type>().value(0), 4);
    }

    #[tokio::test]
    async fn rows_split_across_partitions() {
        let store = store();
        store
            .insert(&[
                row("a", DAY, "query_time", 3.0),
                row("a", DAY + 86_400, "query_time", 3.0),
            ])
            .await
            .unwrap();

        let dates = store.list_partitions().await.unwrap();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn drop_partition_removes_only_that_date() {
        let store = store();
        store.insert(&[row("a", DAY, "query_time", 3.0)]).await.unwrap();
        store.insert(&[row("b", DAY, "query_time", 3.0)]).await.unwrap();
        store
            .insert(&[row("a", DAY + 86_400, "query_time", 3.0)])
            .await
            .unwrap();

        let removed = store
            .drop_partition(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let dates = store.list_partitions().await.unwrap();
        assert_eq!(dates, vec![NaiveDate::from_ymd_opt(2024, 1, 16).unwrap()]);
    }

    #[tokio::test]
    async fn dropping_missing_partition_is_noop() {
        let store = store();
        let removed = store
            .drop_partition(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn repeated_batch_replaces_its_file() {
        let store = store();
        let batch = BatchId::new();
        let rows = [row("a", DAY, "query_time", 3.0)];
        store.insert_batch(batch, &rows).await.unwrap();
        store.insert_batch(batch, &rows).await.unwrap();

        let batches = store
            .select("SELECT COUNT(*) AS n FROM metrics")
            .await
            .unwrap();
        assert_eq!(batches[0].column(0).as_primitive::<Int64Type>().value(0), 1);
    }

    #[test]
    fn query_timeout_is_configurable() {
        let store = store().with_query_timeout(Some(Duration::from_secs(2)));
        assert_eq!(store.query_timeout(), Some(Duration::from_secs(2)));

        let store = store.with_query_timeout(None);
        assert_eq!(store.query_timeout(), None);
    }

    #[tokio::test]
    async fn nullable_client_host_survives() {
        let store = store();
        let mut with_host = row("a", DAY, "query_time", 3.0);
        with_host.tags.client_host = Some("10.0.0.1".to_owned());
        store
            .insert(&[with_host, row("b", DAY, "query_time", 3.0)])
            .await
            .unwrap();

        let batches = store
            .select("SELECT client_host FROM metrics ORDER BY fingerprint")
            .await
            .unwrap();
        let hosts = batches[0].column(0);
        assert!(!hosts.is_null(0));
        assert!(hosts.is_null(1));
    }
}
