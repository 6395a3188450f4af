//! Prometheus instruments for the ingestion buffer.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::error::Rejection;

/// Flush latency buckets in seconds.
const FLUSH_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

#[derive(Clone)]
pub struct BufferMetrics {
    pub buckets_created: IntCounter,
    pub observations_accepted: IntCounter,
    pub observations_rejected: IntCounterVec,
    pub flushes: IntCounterVec,
    pub flush_duration: Histogram,
    pub rows_flushed: IntCounter,
    pub rows_abandoned: IntCounter,
    pub open_buckets: IntGauge,
    pub draining_windows: IntGauge,
}

impl BufferMetrics {
    /// Create the instruments and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            buckets_created: IntCounter::new(
                "qan_buffer_buckets_created_total",
                "Buckets opened in the active table",
            )?,
            observations_accepted: IntCounter::new(
                "qan_buffer_observations_accepted_total",
                "Observations folded into a bucket",
            )?,
            observations_rejected: IntCounterVec::new(
                Opts::new(
                    "qan_buffer_observations_rejected_total",
                    "Observations refused by the buffer",
                ),
                &["reason"],
            )?,
            flushes: IntCounterVec::new(
                Opts::new("qan_buffer_flushes_total", "Partition inserts by outcome"),
                &["outcome"],
            )?,
            flush_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "qan_buffer_flush_duration_seconds",
                    "Time to persist one closed window",
                )
                .buckets(FLUSH_LATENCY_BUCKETS.to_vec()),
            )?,
            rows_flushed: IntCounter::new(
                "qan_buffer_rows_flushed_total",
                "Rows persisted to storage",
            )?,
            rows_abandoned: IntCounter::new(
                "qan_buffer_rows_abandoned_total",
                "Rows dropped after flush retries were exhausted",
            )?,
            open_buckets: IntGauge::new(
                "qan_buffer_open_buckets",
                "Buckets in the active table",
            )?,
            draining_windows: IntGauge::new(
                "qan_buffer_draining_windows",
                "Closed windows still being written to storage",
            )?,
        };

        registry.register(Box::new(metrics.buckets_created.clone()))?;
        registry.register(Box::new(metrics.observations_accepted.clone()))?;
        registry.register(Box::new(metrics.observations_rejected.clone()))?;
        registry.register(Box::new(metrics.flushes.clone()))?;
        registry.register(Box::new(metrics.flush_duration.clone()))?;
        registry.register(Box::new(metrics.rows_flushed.clone()))?;
        registry.register(Box::new(metrics.rows_abandoned.clone()))?;
        registry.register(Box::new(metrics.open_buckets.clone()))?;
        registry.register(Box::new(metrics.draining_windows.clone()))?;

        Ok(metrics)
    }

    pub fn rejected(&self, rejection: &Rejection) {
        self.observations_rejected
            .with_label_values(&[rejection.reason()])
            .inc();
    }
}
