//! Arrow schema of the persisted `metrics` table.
//!
//! # Query vs Storage Schemas
//!
//! The storage schema below is what goes into each Parquet file. The `date`
//! partition column is NOT stored in the files: it is encoded in the
//! directory path (Hive-style, `metrics/date=2024-01-15/`) and surfaced by
//! DataFusion's `ListingTable`, which enables partition pruning on date
//! filters.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate};

use crate::model::MetricRow;
use crate::QanError;

/// Table name, also the top-level directory in the store.
pub const METRICS_TABLE: &str = "metrics";

/// Hive partition column extracted from the path.
pub const PARTITION_COLUMN: &str = "date";

/// Format of the partition value.
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

pub mod columns {
    pub const FINGERPRINT: &str = "fingerprint";
    pub const PERIOD_START: &str = "period_start";
    pub const SERVICE_NAME: &str = "service_name";
    pub const DATABASE: &str = "database";
    pub const SCHEMA_NAME: &str = "schema_name";
    pub const USERNAME: &str = "username";
    pub const CLIENT_HOST: &str = "client_host";
    pub const METRIC: &str = "metric";
    pub const NUM_QUERIES: &str = "num_queries";
    pub const M_CNT: &str = "m_cnt";
    pub const M_SUM: &str = "m_sum";
    pub const M_MIN: &str = "m_min";
    pub const M_MAX: &str = "m_max";
}

/// Schema of rows written to Parquet, without the partition column.
///
/// Must stay in step with the embedded migrations: after all migrations
/// have run, the stored table manifest equals this schema.
pub fn metrics_storage_schema() -> SchemaRef {
    use columns::*;

    Arc::new(Schema::new(vec![
        Field::new(FINGERPRINT, DataType::Utf8, false),
        Field::new(PERIOD_START, DataType::Int64, false),
        Field::new(SERVICE_NAME, DataType::Utf8, false),
        Field::new(DATABASE, DataType::Utf8, false),
        Field::new(SCHEMA_NAME, DataType::Utf8, false),
        Field::new(USERNAME, DataType::Utf8, true),
        Field::new(CLIENT_HOST, DataType::Utf8, true),
        Field::new(METRIC, DataType::Utf8, false),
        Field::new(NUM_QUERIES, DataType::UInt64, false),
        Field::new(M_CNT, DataType::UInt64, false),
        Field::new(M_SUM, DataType::Float64, false),
        Field::new(M_MIN, DataType::Float64, false),
        Field::new(M_MAX, DataType::Float64, false),
    ]))
}

/// UTC date of the partition holding rows for `period_start`.
pub fn partition_date(period_start: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(period_start, 0).map(|dt| dt.date_naive())
}

/// Build a record batch in the storage schema from persisted rows.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[&MetricRow]) -> Result<RecordBatch, QanError> {
    let strings = |f: fn(&MetricRow) -> &str| -> ArrayRef {
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| f(r))))
    };

    let columns: Vec<ArrayRef> = vec![
        strings(|r| r.fingerprint.as_str()),
        Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.period_start))),
        strings(|r| r.tags.service_name.as_str()),
        strings(|r| r.tags.database.as_str()),
        strings(|r| r.tags.schema.as_str()),
        strings(|r| r.tags.username.as_str()),
        Arc::new(StringArray::from_iter(
            rows.iter().map(|r| r.tags.client_host.as_deref()),
        )),
        strings(|r| r.metric.as_str()),
        Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.num_queries))),
        Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.stats.cnt))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.stats.sum))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.stats.min))),
        Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.stats.max))),
    ];

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}
