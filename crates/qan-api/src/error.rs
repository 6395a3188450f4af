//! Error types for the QAN API crate.

use std::io;

/// Errors that can occur in the ingestion and serving pipeline.
///
/// Large error types are boxed to keep the enum small on the stack.
#[derive(Debug, thiserror::Error)]
pub enum QanError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow error (boxed - large type).
    #[error("Arrow error: {0}")]
    Arrow(Box<arrow::error::ArrowError>),

    /// Parquet error (boxed - large type).
    #[error("Parquet error: {0}")]
    Parquet(Box<parquet::errors::ParquetError>),

    /// DataFusion error (boxed - large type).
    #[error("DataFusion error: {0}")]
    DataFusion(Box<datafusion::error::DataFusionError>),

    /// Object store error (boxed - large type).
    #[error("object store error: {0}")]
    ObjectStore(Box<object_store::Error>),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON encoding or decoding error.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// Prometheus registration error.
    #[error("metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Schema migration failed or the stored schema is unusable.
    #[error("migration error: {0}")]
    Migration(String),

    /// Request arguments were malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Query timed out.
    #[error("query timed out after {duration:?}")]
    QueryTimeout {
        /// The duration after which the query timed out.
        duration: std::time::Duration,
    },
}

impl From<arrow::error::ArrowError> for QanError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow(Box::new(err))
    }
}

impl From<parquet::errors::ParquetError> for QanError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::Parquet(Box::new(err))
    }
}

impl From<datafusion::error::DataFusionError> for QanError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        Self::DataFusion(Box::new(err))
    }
}

impl From<object_store::Error> for QanError {
    fn from(err: object_store::Error) -> Self {
        Self::ObjectStore(Box::new(err))
    }
}

impl From<QanError> for tonic::Status {
    fn from(err: QanError) -> Self {
        match err {
            QanError::InvalidArgument(msg) => Self::invalid_argument(msg),
            QanError::QueryTimeout { duration } => {
                Self::deadline_exceeded(format!("query timed out after {duration:?}"))
            }
            _ => Self::internal(err.to_string()),
        }
    }
}

/// Why the ingestion buffer refused an observation.
///
/// Rejections are synchronous and never retried by the buffer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("fingerprint is empty")]
    MissingFingerprint,

    #[error("period start is missing")]
    MissingPeriod,

    #[error("period start {period_start} is out of range")]
    InvalidPeriod { period_start: i64 },

    #[error("observation carries no metrics")]
    NoMetrics,

    #[error("metric {name} has a non-finite value")]
    NonFiniteMetric { name: String },

    #[error("buffer is closed for shutdown")]
    Closed,

    #[error("buffer is full: {limit} open buckets")]
    Overloaded { limit: usize },
}

impl Rejection {
    /// Stable label used for the rejected-observations counter.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingFingerprint => "missing_fingerprint",
            Self::MissingPeriod => "missing_period",
            Self::InvalidPeriod { .. } => "invalid_period",
            Self::NoMetrics => "no_metrics",
            Self::NonFiniteMetric { .. } => "non_finite",
            Self::Closed => "closed",
            Self::Overloaded { .. } => "overloaded",
        }
    }
}
