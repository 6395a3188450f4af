//! Retention pruner: drops whole date partitions past the horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use prometheus::{IntCounter, Registry};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;
use crate::retry::Backoff;
use crate::storage::PartitionManager;
use crate::QanError;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dropped: Vec<NaiveDate>,
    pub failed: Vec<NaiveDate>,
    pub objects_deleted: usize,
}

/// Periodic partition dropper. Stateless between sweeps.
pub struct Pruner {
    partitions: Arc<dyn PartitionManager>,
    config: RetentionConfig,
    dropped: IntCounter,
    failures: IntCounter,
}

impl Pruner {
    pub fn new(
        partitions: Arc<dyn PartitionManager>,
        config: RetentionConfig,
        registry: &Registry,
    ) -> Result<Self, prometheus::Error> {
        let dropped = IntCounter::new(
            "qan_retention_partitions_dropped_total",
            "Partitions removed by the retention pruner",
        )?;
        let failures = IntCounter::new(
            "qan_retention_drop_failures_total",
            "Partition drops abandoned after retries",
        )?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(failures.clone()))?;

        Ok(Self {
            partitions,
            config,
            dropped,
            failures,
        })
    }

    /// Partitions dated strictly before this are expired.
    pub fn cutoff(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.config.days)))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Drop every expired partition, oldest first.
    ///
    /// A partition that still fails after its retries is reported and
    /// skipped. Only a failure to list partitions fails the sweep.
    pub async fn sweep(&self, today: NaiveDate) -> Result<SweepReport, QanError> {
        let cutoff = self.cutoff(today);
        let mut expired: Vec<NaiveDate> = self
            .partitions
            .list_partitions()
            .await?
            .into_iter()
            .filter(|date| *date < cutoff)
            .collect();
        expired.sort_unstable();

        let backoff = Backoff::new(
            self.config.drop_max_retries,
            Duration::from_millis(self.config.drop_initial_delay_ms),
            Duration::from_millis(self.config.drop_max_delay_ms),
        );

        let mut report = SweepReport::default();
        for date in expired {
            let partitions = &self.partitions;
            let result = backoff
                .retry(
                    || partitions.drop_partition(date),
                    |attempt, delay, e| {
                        tracing::warn!(
                            %date,
                            attempt,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Retrying partition drop"
                        );
                    },
                )
                .await;

            match result {
                Ok(objects) => {
                    tracing::info!(%date, objects, "Dropped expired partition");
                    self.dropped.inc();
                    report.objects_deleted += objects;
                    report.dropped.push(date);
                }
                Err(e) => {
                    tracing::error!(%date, error = %e, "Giving up on partition drop");
                    self.failures.inc();
                    report.failed.push(date);
                }
            }
        }

        Ok(report)
    }

    /// Sweep once immediately, then every `sweep_interval_secs`, until
    /// `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.sweep_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            days = self.config.days,
            interval_secs = period.as_secs(),
            "Retention pruner started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let today = Utc::now().date_naive();
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        result = self.sweep(today) => match result {
                            Ok(report) => tracing::info!(
                                cutoff = %self.cutoff(today),
                                dropped = report.dropped.len(),
                                failed = report.failed.len(),
                                "Retention sweep finished"
                            ),
                            Err(e) => tracing::error!(error = %e, "Retention sweep failed"),
                        },
                    }
                }
            }
        }

        tracing::info!("Retention pruner stopped");
    }
}
