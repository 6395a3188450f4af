//! Windowed aggregation buffer with background flush to storage.
//!
//! Observations are folded into the active [`BucketTable`] under a short
//! lock. A fixed-period timer swaps in an empty table and hands the closed
//! one to a flush task, so submitters never wait on storage I/O.
//!
//! At most `max_draining_windows` closed windows are in flight to storage.
//! While that many are still draining, ticks leave the active window open
//! and it keeps aggregating (bounded by `max_open_buckets`) until a slot
//! frees up.
//!
//! ```text
//! submit ─► [active table] ──tick──► [closed table] ─► flush task ─► MetricsWriter
//!                 ▲                                         │
//!                 └──── fresh table swapped in ◄────────────┘ (retry with backoff)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::metrics::BufferMetrics;
use super::table::BucketTable;
use crate::config::BufferConfig;
use crate::error::Rejection;
use crate::model::{MetricRow, Observation};
use crate::retry::Backoff;
use crate::schema::partition_date;
use crate::storage::{BatchId, MetricsWriter};

#[derive(Default)]
struct State {
    table: BucketTable,
    closed: bool,
}

/// Ingestion buffer.
///
/// Created once at startup and shared behind an `Arc` between the receiver
/// (which calls [`submit`](Self::submit)) and the task driving
/// [`run`](Self::run).
pub struct Ingester {
    state: Mutex<State>,
    writer: Arc<dyn MetricsWriter>,
    config: BufferConfig,
    metrics: BufferMetrics,
}

impl Ingester {
    pub fn new(writer: Arc<dyn MetricsWriter>, config: BufferConfig, metrics: BufferMetrics) -> Self {
        Self {
            state: Mutex::new(State::default()),
            writer,
            config,
            metrics,
        }
    }

    /// Fold one observation into the active window.
    ///
    /// Never blocks on I/O. Rejections are final; the caller decides whether
    /// to report them upstream.
    pub fn submit(&self, obs: Observation) -> Result<(), Rejection> {
        let result = obs.validate().and_then(|()| {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejection::Closed);
            }
            let created = state.table.insert(obs, self.config.max_open_buckets)?;
            // gauge and table change under the same lock
            if created {
                self.metrics.open_buckets.set(gauge_value(state.table.len()));
            }
            Ok(created)
        });

        match result {
            Ok(created) => {
                self.metrics.observations_accepted.inc();
                if created {
                    self.metrics.buckets_created.inc();
                }
                Ok(())
            }
            Err(rejection) => {
                self.metrics.rejected(&rejection);
                Err(rejection)
            }
        }
    }

    /// Buckets in the active window.
    pub fn open_buckets(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Whether the buffer has stopped accepting observations.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// Drive the window timer until `cancel` fires, then drain.
    ///
    /// Returns only after every closed window, including the one open at
    /// cancellation, has been through a flush attempt.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let window = self.window();
        let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flushes = JoinSet::new();

        tracing::info!(window_secs = window.as_secs(), "Ingestion buffer started");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if flushes.len() >= self.config.max_draining_windows {
                        tracing::warn!(
                            draining = flushes.len(),
                            open_buckets = self.open_buckets(),
                            "Storage is behind, keeping the window open"
                        );
                        continue;
                    }
                    let table = self.swap(false);
                    if !table.is_empty() {
                        let this = Arc::clone(&self);
                        flushes.spawn(async move { this.flush(table).await });
                        self.metrics.draining_windows.set(gauge_value(flushes.len()));
                    }
                }
                Some(joined) = flushes.join_next(), if !flushes.is_empty() => {
                    log_join(joined);
                    self.metrics.draining_windows.set(gauge_value(flushes.len()));
                }
            }
        }

        let last = self.swap(true);
        tracing::info!(
            buckets = last.len(),
            draining = flushes.len(),
            "Buffer closed, draining"
        );

        while let Some(joined) = flushes.join_next().await {
            log_join(joined);
            self.metrics.draining_windows.set(gauge_value(flushes.len()));
        }
        self.flush(last).await;

        tracing::info!("Ingestion buffer drained");
    }

    /// Take the active table, leaving an empty one. With `close`, late
    /// submitters are rejected from here on.
    fn swap(&self, close: bool) -> BucketTable {
        let mut state = self.state.lock();
        state.closed |= close;
        self.metrics.open_buckets.set(0);
        std::mem::take(&mut state.table)
    }

    /// Persist one closed window.
    ///
    /// Rows are inserted one partition date at a time, all under one
    /// [`BatchId`]. Every retry reuses that id, so an attempt that committed
    /// before reporting failure is overwritten rather than duplicated.
    async fn flush(&self, table: BucketTable) {
        if table.is_empty() {
            return;
        }
        let started = Instant::now();
        let buckets = table.len();
        let batch_id = BatchId::new();

        let mut partitions: BTreeMap<NaiveDate, Vec<MetricRow>> = BTreeMap::new();
        for row in table.into_rows() {
            match partition_date(row.period_start) {
                Some(date) => partitions.entry(date).or_default().push(row),
                None => {
                    tracing::error!(
                        fingerprint = %row.fingerprint,
                        period_start = row.period_start,
                        "Row has no partition date, dropping"
                    );
                    self.metrics.rows_abandoned.inc();
                }
            }
        }

        let backoff = Backoff::new(
            self.config.flush_max_retries,
            Duration::from_millis(self.config.flush_initial_delay_ms),
            Duration::from_millis(self.config.flush_max_delay_ms),
        );

        for (date, rows) in partitions {
            let writer = &self.writer;
            let batch = rows.as_slice();
            let result = backoff
                .retry(
                    || writer.insert_batch(batch_id, batch),
                    |attempt, delay, e| {
                        tracing::warn!(
                            %date,
                            batch = %batch_id,
                            attempt,
                            max_retries = backoff.max_retries,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Retrying flush after failure"
                        );
                    },
                )
                .await;

            let count = row_count(rows.len());
            match result {
                Ok(()) => {
                    self.metrics.flushes.with_label_values(&["success"]).inc();
                    self.metrics.rows_flushed.inc_by(count);
                    tracing::debug!(%date, rows = count, "Flushed partition rows");
                }
                Err(e) => {
                    self.metrics.flushes.with_label_values(&["failure"]).inc();
                    self.metrics.rows_abandoned.inc_by(count);
                    tracing::error!(
                        %date,
                        rows = count,
                        attempts = backoff.max_retries + 1,
                        error = %e,
                        "All flush retries exhausted, abandoning rows"
                    );
                }
            }
        }

        self.metrics
            .flush_duration
            .observe(started.elapsed().as_secs_f64());
        tracing::info!(
            buckets,
            batch = %batch_id,
            elapsed_ms = started.elapsed().as_millis(),
            "Flushed window"
        );
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Flush task failed");
    }
}

#[allow(clippy::cast_possible_wrap, clippy::as_conversions)]
const fn gauge_value(n: usize) -> i64 {
    n as i64
}

#[allow(clippy::as_conversions)]
const fn row_count(n: usize) -> u64 {
    n as u64
}
