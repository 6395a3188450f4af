//! Ingestion buffer: windowed in-memory aggregation with background flush.

pub mod ingester;
pub mod metrics;
pub mod table;

pub use ingester::Ingester;
pub use metrics::BufferMetrics;
pub use table::{Bucket, BucketTable};
