//! `qan.v1.Analytics` service: reads persisted aggregates.
//!
//! Every read goes through [`ParquetStore::select`]; the in-memory buckets
//! of the ingestion buffer are never consulted, so a window becomes visible
//! only once it has been flushed.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, PrimitiveArray, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{ArrowPrimitiveType, DataType, Float64Type, Int64Type, UInt64Type};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use qan_proto::analytics::{
    Analytics, FiltersReply, FiltersRequest, Label, ListLabels, MetricStats, MetricsNamesReply,
    MetricsNamesRequest, ObjectDetailsReply, ObjectDetailsRequest, ReportMapFieldEntry,
    ReportReply, ReportRequest, Row,
};
use tonic::{Request, Response, Status};

use crate::query::builders::{Dimension, LabelFilter, PeriodRange, DEFAULT_MAIN_METRIC};
use crate::query::{
    FiltersQueryBuilder, MetricsNamesQueryBuilder, ObjectDetailsQueryBuilder, ReportQueryBuilder,
};
use crate::storage::ParquetStore;
use crate::QanError;

/// Read-side backend shared by the gRPC service and the JSON gateway.
#[derive(Clone)]
pub struct AnalyticsService {
    store: Arc<ParquetStore>,
}

impl AnalyticsService {
    pub const fn new(store: Arc<ParquetStore>) -> Self {
        Self { store }
    }

    /// Ranked breakdown of one metric grouped by a dimension.
    #[tracing::instrument(skip_all, fields(group_by = %req.group_by, metric = %req.metric))]
    pub async fn report(&self, req: ReportRequest) -> Result<ReportReply, QanError> {
        let group_by = dimension_or_default(&req.group_by)?;
        let metric = metric_or_default(&req.metric);
        let period = period(req.period_start_from, req.period_start_to)?;

        let builder = ReportQueryBuilder::new(group_by, metric)
            .period(period)
            .labels(label_filter(&req.labels)?)
            .limit(req.limit)
            .offset(req.offset);

        let page_sql = builder.build();
        let total_sql = builder.build_total();
        let (page, total) = tokio::try_join!(
            self.store.select(&page_sql),
            self.store.select(&total_sql),
        )?;

        let mut rows = Vec::new();
        for batch in &page {
            let dimension = strings(batch, "dimension")?;
            let num_queries = primitives::<UInt64Type>(batch, "num_queries")?;
            let stats = StatsColumns::extract(batch)?;

            for i in 0..batch.num_rows() {
                rows.push(Row {
                    rank: 0,
                    dimension: string_value(&dimension, i),
                    num_queries: num_queries.value(i),
                    stats: Some(stats.at(i)),
                });
            }
        }
        for (rank, row) in (req.offset.saturating_add(1)..).zip(rows.iter_mut()) {
            row.rank = rank;
        }

        let total_rows = match total.first() {
            Some(batch) if batch.num_rows() > 0 => {
                let counts = primitives::<Int64Type>(batch, "total")?;
                u32::try_from(counts.value(0)).unwrap_or(u32::MAX)
            }
            _ => 0,
        };

        Ok(ReportReply {
            total_rows,
            offset: req.offset,
            limit: builder.effective_limit(),
            rows,
        })
    }

    /// Every metric recorded for one dimension value.
    #[tracing::instrument(skip_all, fields(group_by = %req.group_by))]
    pub async fn object_details(
        &self,
        req: ObjectDetailsRequest,
    ) -> Result<ObjectDetailsReply, QanError> {
        if req.filter_by.is_empty() {
            return Err(QanError::InvalidArgument(
                "filter_by must name a dimension value".to_owned(),
            ));
        }
        let dimension = dimension_or_default(&req.group_by)?;
        let period = period(req.period_start_from, req.period_start_to)?;

        let sql = ObjectDetailsQueryBuilder::new(dimension, req.filter_by)
            .period(period)
            .labels(label_filter(&req.labels)?)
            .build();
        let batches = self.store.select(&sql).await?;

        let mut reply = ObjectDetailsReply::default();
        for batch in &batches {
            let names = strings(batch, "metric_name")?;
            let num_queries = primitives::<UInt64Type>(batch, "num_queries")?;
            let stats = StatsColumns::extract(batch)?;

            for i in 0..batch.num_rows() {
                // every metric row of a bucket repeats the bucket's query count
                reply.num_queries = reply.num_queries.max(num_queries.value(i));
                reply.metrics.insert(string_value(&names, i), stats.at(i));
            }
        }

        Ok(reply)
    }

    /// Distinct values of every label with their query counts.
    pub async fn filters(&self, req: FiltersRequest) -> Result<FiltersReply, QanError> {
        let main_metric = metric_or_default(&req.main_metric_name);
        let period = period(req.period_start_from, req.period_start_to)?;
        let labels = label_filter(&req.labels)?;

        let queries = Dimension::LABELS.into_iter().map(|dimension| {
            let sql = FiltersQueryBuilder::new(dimension, main_metric)
                .period(period)
                .labels(labels.clone())
                .build();
            async move {
                let batches = self.store.select(&sql).await?;
                Ok::<_, QanError>((dimension, batches))
            }
        });
        let results = futures::future::try_join_all(queries).await?;

        let mut reply = FiltersReply::default();
        for (dimension, batches) in results {
            let mut values = Vec::new();
            for batch in &batches {
                let label = strings(batch, "label_value")?;
                let counts = primitives::<UInt64Type>(batch, "num_queries")?;
                for i in 0..batch.num_rows() {
                    if label.is_null(i) {
                        continue;
                    }
                    values.push(Label {
                        value: label.value(i).to_owned(),
                        count: counts.value(i),
                    });
                }
            }
            reply
                .labels
                .insert(dimension.name().to_owned(), ListLabels { name: values });
        }

        Ok(reply)
    }

    pub async fn metrics_names(&self) -> Result<MetricsNamesReply, QanError> {
        let batches = self
            .store
            .select(&MetricsNamesQueryBuilder::new().build())
            .await?;

        let mut names = Vec::new();
        for batch in &batches {
            let column = strings(batch, "metric_name")?;
            names.extend((0..batch.num_rows()).map(|i| string_value(&column, i)));
        }
        Ok(MetricsNamesReply { names })
    }
}

#[tonic::async_trait]
impl Analytics for AnalyticsService {
    async fn get_report(
        &self,
        request: Request<ReportRequest>,
    ) -> Result<Response<ReportReply>, Status> {
        Ok(Response::new(self.report(request.into_inner()).await?))
    }

    async fn get_metrics(
        &self,
        request: Request<ObjectDetailsRequest>,
    ) -> Result<Response<ObjectDetailsReply>, Status> {
        Ok(Response::new(self.object_details(request.into_inner()).await?))
    }

    async fn get_filters(
        &self,
        request: Request<FiltersRequest>,
    ) -> Result<Response<FiltersReply>, Status> {
        Ok(Response::new(self.filters(request.into_inner()).await?))
    }

    async fn get_metrics_names(
        &self,
        _request: Request<MetricsNamesRequest>,
    ) -> Result<Response<MetricsNamesReply>, Status> {
        Ok(Response::new(self.metrics_names().await?))
    }
}

fn dimension_or_default(name: &str) -> Result<Dimension, QanError> {
    if name.is_empty() {
        Ok(Dimension::Fingerprint)
    } else {
        Dimension::parse(name)
    }
}

fn metric_or_default(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_MAIN_METRIC
    } else {
        name
    }
}

fn period(from: i64, to: i64) -> Result<PeriodRange, QanError> {
    let period = PeriodRange::new(from, to);
    period.validate()?;
    Ok(period)
}

fn label_filter(entries: &[ReportMapFieldEntry]) -> Result<LabelFilter, QanError> {
    LabelFilter::from_pairs(
        entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_slice())),
    )
}

/// The aggregate columns shared by the report and object-details queries.
struct StatsColumns {
    cnt: PrimitiveArray<UInt64Type>,
    sum: PrimitiveArray<Float64Type>,
    min: PrimitiveArray<Float64Type>,
    max: PrimitiveArray<Float64Type>,
}

impl StatsColumns {
    fn extract(batch: &RecordBatch) -> Result<Self, QanError> {
        Ok(Self {
            cnt: primitives(batch, "cnt_total")?,
            sum: primitives(batch, "sum_total")?,
            min: primitives(batch, "min_value")?,
            max: primitives(batch, "max_value")?,
        })
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn at(&self, i: usize) -> MetricStats {
        let cnt = self.cnt.value(i);
        let sum = self.sum.value(i);
        MetricStats {
            cnt,
            sum,
            min: self.min.value(i),
            max: self.max.value(i),
            avg: if cnt == 0 { 0.0 } else { sum / cnt as f64 },
        }
    }
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, QanError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| ArrowError::SchemaError(format!("result has no column {name}")).into())
}

/// Result column as UTF-8, whatever string encoding the plan produced.
fn strings(batch: &RecordBatch, name: &str) -> Result<StringArray, QanError> {
    let array = cast(column(batch, name)?.as_ref(), &DataType::Utf8)?;
    Ok(array.as_string::<i32>().clone())
}

/// Result column as `T`, widening whatever numeric type the plan produced.
fn primitives<T: ArrowPrimitiveType>(
    batch: &RecordBatch,
    name: &str,
) -> Result<PrimitiveArray<T>, QanError> {
    let array = cast(column(batch, name)?.as_ref(), &T::DATA_TYPE)?;
    Ok(array.as_primitive::<T>().clone())
}

fn string_value(array: &StringArray, i: usize) -> String {
    if array.is_null(i) {
        String::new()
    } else {
        array.value(i).to_owned()
    }
}
