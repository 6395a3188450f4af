//! Benchmarks for the buffer submit path and window flush.
//!
//! Submit is the hot path of every Collector request: validation plus one
//! lock around the bucket table.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use object_store::memory::InMemory;
use prometheus::Registry;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use qan_api::buffer::{BufferMetrics, Ingester};
use qan_api::config::{BufferConfig, ParquetConfig};
use qan_api::model::{Observation, Tags};
use qan_api::schema::metrics_storage_schema;
use qan_api::storage::ParquetStore;

const DAY_START: i64 = 1_705_276_800;

fn bench_config() -> BufferConfig {
    BufferConfig {
        // only the benchmark closes the window
        window_secs: 3600,
        max_open_buckets: 10_000_000,
        flush_max_retries: 0,
        ..BufferConfig::default()
    }
}

fn store() -> Arc<ParquetStore> {
    Arc::new(
        ParquetStore::new(
            Arc::new(InMemory::new()),
            "memory://",
            metrics_storage_schema(),
            &ParquetConfig {
                row_group_size: 100_000,
            },
        )
        .expect("store"),
    )
}

fn ingester() -> Arc<Ingester> {
    let metrics = BufferMetrics::register(&Registry::new()).expect("metrics");
    Arc::new(Ingester::new(store(), bench_config(), metrics))
}

fn observation(fingerprint: usize, value: f64) -> Observation {
    Observation {
        fingerprint: format!("{fingerprint:016x}"),
        period_start: Some(DAY_START),
        tags: Tags {
            service_name: "mysql-1".to_owned(),
            database: "shop".to_owned(),
            schema: "public".to_owned(),
            username: "app".to_owned(),
            client_host: Some("10.0.0.1".to_owned()),
        },
        metrics: BTreeMap::from([
            ("query_time".to_owned(), value),
            ("lock_time".to_owned(), value / 10.0),
            ("rows_sent".to_owned(), 10.0),
            ("rows_examined".to_owned(), 100.0),
        ]),
    }
}

/// Repeated submits into the same bucket (pure aggregation).
fn bench_submit_hot_bucket(c: &mut Criterion) {
    let ingester = ingester();
    let obs = observation(1, 0.5);

    c.bench_function("submit_hot_bucket", |b| {
        b.iter(|| ingester.submit(black_box(obs.clone())));
    });
}

/// Submits spread over many distinct buckets.
fn bench_submit_distinct(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_distinct");

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_batched(
                || {
                    (
                        ingester(),
                        (0..count).map(|i| observation(i, 0.5)).collect::<Vec<_>>(),
                    )
                },
                |(ingester, observations)| {
                    for obs in observations {
                        let _ = ingester.submit(obs);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Close a populated window and write it to Parquet.
fn bench_flush(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("flush");

    for count in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter_batched(
                || {
                    let ingester = ingester();
                    for i in 0..count {
                        let _ = ingester.submit(observation(i, 0.5));
                    }
                    ingester
                },
                |ingester| async move {
                    let cancel = CancellationToken::new();
                    cancel.cancel();
                    ingester.run(cancel).await;
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_submit_hot_bucket,
    bench_submit_distinct,
    bench_flush
);
criterion_main!(benches);
