//! Domain types shared by the buffer, storage and read path.

use std::collections::BTreeMap;

use qan_proto::collector::MetricsBucket;

use crate::error::Rejection;

/// Dimensional tags attached to an observation.
///
/// Part of the bucket key: observations with different tags never aggregate
/// together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Tags {
    pub service_name: String,
    pub database: String,
    pub schema: String,
    pub username: String,
    pub client_host: Option<String>,
}

/// One agent report for one query shape and period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    /// Opaque digest of the normalised query.
    pub fingerprint: String,
    /// Start of the period in unix seconds, already aligned by the agent.
    pub period_start: Option<i64>,
    pub tags: Tags,
    /// Metric name to value. Absent metrics are simply not present.
    pub metrics: BTreeMap<String, f64>,
}

impl Observation {
    /// Check the fields the buffer needs before any state is touched.
    pub fn validate(&self) -> Result<(), Rejection> {
        if self.fingerprint.is_empty() {
            return Err(Rejection::MissingFingerprint);
        }
        let Some(period_start) = self.period_start else {
            return Err(Rejection::MissingPeriod);
        };
        if crate::schema::partition_date(period_start).is_none() {
            return Err(Rejection::InvalidPeriod { period_start });
        }
        if self.metrics.is_empty() {
            return Err(Rejection::NoMetrics);
        }
        if let Some((name, _)) = self.metrics.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Rejection::NonFiniteMetric { name: name.clone() });
        }
        Ok(())
    }
}

impl From<MetricsBucket> for Observation {
    fn from(bucket: MetricsBucket) -> Self {
        // proto3 has no presence for scalars; zero means the agent left it unset
        let period_start =
            (bucket.period_start_unix_secs != 0).then_some(bucket.period_start_unix_secs);
        let client_host = (!bucket.client_host.is_empty()).then_some(bucket.client_host);

        Self {
            fingerprint: bucket.fingerprint,
            period_start,
            tags: Tags {
                service_name: bucket.service_name,
                database: bucket.database,
                schema: bucket.schema,
                username: bucket.username,
                client_host,
            },
            metrics: bucket.metrics.into_iter().collect(),
        }
    }
}

/// Aggregation key of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub fingerprint: String,
    pub period_start: i64,
    pub tags: Tags,
}

/// Running count/sum/min/max of one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricStats {
    pub const fn new(value: f64) -> Self {
        Self {
            cnt: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.cnt += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn avg(&self) -> f64 {
        if self.cnt == 0 {
            0.0
        } else {
            self.sum / self.cnt as f64
        }
    }
}

/// Persisted unit: one row per (bucket, metric).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub fingerprint: String,
    pub period_start: i64,
    pub tags: Tags,
    pub metric: String,
    /// Observations folded into the owning bucket, across all metrics.
    pub num_queries: u64,
    pub stats: MetricStats,
}
