//! Bucket table: the aggregation state of one flush window.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use crate::error::Rejection;
use crate::model::{BucketKey, MetricRow, MetricStats, Observation};

/// Aggregate of every observation sharing one [`BucketKey`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    /// Number of observations folded into this bucket.
    pub num_queries: u64,
    pub metrics: BTreeMap<String, MetricStats>,
}

impl Bucket {
    fn observe(&mut self, metrics: BTreeMap<String, f64>) {
        self.num_queries += 1;
        for (name, value) in metrics {
            self.metrics
                .entry(name)
                .and_modify(|stats| stats.observe(value))
                .or_insert_with(|| MetricStats::new(value));
        }
    }
}

/// Mapping from bucket key to bucket for a single window.
#[derive(Debug, Default)]
pub struct BucketTable {
    buckets: HashMap<BucketKey, Bucket>,
}

impl BucketTable {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, key: &BucketKey) -> Option<&Bucket> {
        self.buckets.get(key)
    }

    /// Fold a validated observation into its bucket.
    ///
    /// Returns `true` if a new bucket was created. A new bucket is refused
    /// once the table holds `max_buckets`; existing buckets always accept.
    pub fn insert(&mut self, obs: Observation, max_buckets: usize) -> Result<bool, Rejection> {
        let Some(period_start) = obs.period_start else {
            return Err(Rejection::MissingPeriod);
        };
        let at_capacity = self.buckets.len() >= max_buckets;
        let key = BucketKey {
            fingerprint: obs.fingerprint,
            period_start,
            tags: obs.tags,
        };

        match self.buckets.entry(key) {
            Entry::Occupied(mut e) => {
                e.get_mut().observe(obs.metrics);
                Ok(false)
            }
            Entry::Vacant(_) if at_capacity => Err(Rejection::Overloaded { limit: max_buckets }),
            Entry::Vacant(e) => {
                e.insert(Bucket::default()).observe(obs.metrics);
                Ok(true)
            }
        }
    }

    /// Number of rows this table will persist as.
    pub fn row_count(&self) -> usize {
        self.buckets.values().map(|b| b.metrics.len()).sum()
    }

    /// Consume the table into persisted rows, one per (bucket, metric).
    pub fn into_rows(self) -> Vec<MetricRow> {
        let mut rows = Vec::with_capacity(self.row_count());
        for (key, bucket) in self.buckets {
            for (metric, stats) in bucket.metrics {
                rows.push(MetricRow {
                    fingerprint: key.fingerprint.clone(),
                    period_start: key.period_start,
                    tags: key.tags.clone(),
                    metric,
                    num_queries: bucket.num_queries,
                    stats,
                });
            }
        }
        rows
    }
}
