//! `qan.v1.Analytics`: read access to persisted query metrics.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tonic::body::BoxBody;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{NamedService, UnaryService};

use crate::rpc;

pub const GET_REPORT_PATH: &str = "/qan.v1.Analytics/GetReport";
pub const GET_METRICS_PATH: &str = "/qan.v1.Analytics/GetMetrics";
pub const GET_FILTERS_PATH: &str = "/qan.v1.Analytics/GetFilters";
pub const GET_METRICS_NAMES_PATH: &str = "/qan.v1.Analytics/GetMetricsNames";

/// Label constraint applied to a read: `key` must equal one of `value`.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMapFieldEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, repeated, tag = "2")]
    pub value: Vec<String>,
}

/// Ranked breakdown of one metric grouped by a dimension.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportRequest {
    /// Inclusive lower bound, unix seconds.
    #[prost(int64, tag = "1")]
    pub period_start_from: i64,
    /// Exclusive upper bound, unix seconds.
    #[prost(int64, tag = "2")]
    pub period_start_to: i64,
    /// One of `queryid`, `service_name`, `database`, `schema`, `username`, `client_host`.
    #[prost(string, tag = "3")]
    pub group_by: String,
    /// Metric used for ranking, e.g. `query_time`.
    #[prost(string, tag = "4")]
    pub metric: String,
    #[prost(uint32, tag = "5")]
    pub limit: u32,
    #[prost(uint32, tag = "6")]
    pub offset: u32,
    #[prost(message, repeated, tag = "7")]
    pub labels: Vec<ReportMapFieldEntry>,
}

/// Aggregated statistics of one metric.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricStats {
    #[prost(uint64, tag = "1")]
    pub cnt: u64,
    #[prost(double, tag = "2")]
    pub sum: f64,
    #[prost(double, tag = "3")]
    pub min: f64,
    #[prost(double, tag = "4")]
    pub max: f64,
    #[prost(double, tag = "5")]
    pub avg: f64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Row {
    #[prost(uint32, tag = "1")]
    pub rank: u32,
    #[prost(string, tag = "2")]
    pub dimension: String,
    #[prost(uint64, tag = "3")]
    pub num_queries: u64,
    #[prost(message, optional, tag = "4")]
    pub stats: Option<MetricStats>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportReply {
    #[prost(uint32, tag = "1")]
    pub total_rows: u32,
    #[prost(uint32, tag = "2")]
    pub offset: u32,
    #[prost(uint32, tag = "3")]
    pub limit: u32,
    #[prost(message, repeated, tag = "4")]
    pub rows: Vec<Row>,
}

/// Every metric of a single dimension value (usually one fingerprint).
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDetailsRequest {
    #[prost(int64, tag = "1")]
    pub period_start_from: i64,
    #[prost(int64, tag = "2")]
    pub period_start_to: i64,
    #[prost(string, tag = "3")]
    pub filter_by: String,
    #[prost(string, tag = "4")]
    pub group_by: String,
    #[prost(message, repeated, tag = "5")]
    pub labels: Vec<ReportMapFieldEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDetailsReply {
    #[prost(map = "string, message", tag = "1")]
    pub metrics: HashMap<String, MetricStats>,
    #[prost(uint64, tag = "2")]
    pub num_queries: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersRequest {
    #[prost(int64, tag = "1")]
    pub period_start_from: i64,
    #[prost(int64, tag = "2")]
    pub period_start_to: i64,
    /// Metric whose row count is reported per label value.
    #[prost(string, tag = "3")]
    pub main_metric_name: String,
    #[prost(message, repeated, tag = "4")]
    pub labels: Vec<ReportMapFieldEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(uint64, tag = "2")]
    pub count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ListLabels {
    #[prost(message, repeated, tag = "1")]
    pub name: Vec<Label>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersReply {
    #[prost(map = "string, message", tag = "1")]
    pub labels: HashMap<String, ListLabels>,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsNamesRequest {}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsNamesReply {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
}

/// Server-side behaviour of `qan.v1.Analytics`.
#[tonic::async_trait]
pub trait Analytics: Send + Sync + 'static {
    async fn get_report(
        &self,
        request: tonic::Request<ReportRequest>,
    ) -> Result<tonic::Response<ReportReply>, tonic::Status>;

    async fn get_metrics(
        &self,
        request: tonic::Request<ObjectDetailsRequest>,
    ) -> Result<tonic::Response<ObjectDetailsReply>, tonic::Status>;

    async fn get_filters(
        &self,
        request: tonic::Request<FiltersRequest>,
    ) -> Result<tonic::Response<FiltersReply>, tonic::Status>;

    async fn get_metrics_names(
        &self,
        request: tonic::Request<MetricsNamesRequest>,
    ) -> Result<tonic::Response<MetricsNamesReply>, tonic::Status>;
}

/// tonic service wrapping an [`Analytics`] implementation.
pub struct AnalyticsServer<T> {
    inner: Arc<T>,
    limits: rpc::Limits,
}

impl<T> AnalyticsServer<T> {
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    pub fn from_arc(inner: Arc<T>) -> Self {
        Self {
            inner,
            limits: rpc::Limits::default(),
        }
    }

    /// Largest request message this service will decode.
    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.limits.max_decoding = Some(limit);
        self
    }

    /// Largest reply message this service will encode.
    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.limits.max_encoding = Some(limit);
        self
    }
}

impl<T> Clone for AnalyticsServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            limits: self.limits,
        }
    }
}

impl<T> NamedService for AnalyticsServer<T> {
    const NAME: &'static str = "qan.v1.Analytics";
}

macro_rules! unary_method {
    ($svc:ident, $req:ty, $resp:ty, $method:ident) => {
        struct $svc<T>(Arc<T>);

        impl<T: Analytics> UnaryService<$req> for $svc<T> {
            type Response = $resp;
            type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

            fn call(&mut self, request: tonic::Request<$req>) -> Self::Future {
                let inner = Arc::clone(&self.0);
                Box::pin(async move { inner.$method(request).await })
            }
        }
    };
}

unary_method!(GetReportSvc, ReportRequest, ReportReply, get_report);
unary_method!(GetMetricsSvc, ObjectDetailsRequest, ObjectDetailsReply, get_metrics);
unary_method!(GetFiltersSvc, FiltersRequest, FiltersReply, get_filters);
unary_method!(
    GetMetricsNamesSvc,
    MetricsNamesRequest,
    MetricsNamesReply,
    get_metrics_names
);

impl<T, B> Service<http::Request<B>> for AnalyticsServer<T>
where
    T: Analytics,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        let limits = self.limits;
        match req.uri().path() {
            GET_REPORT_PATH => {
                Box::pin(async move { Ok(rpc::unary(GetReportSvc(inner), req, limits).await) })
            }
            GET_METRICS_PATH => {
                Box::pin(async move { Ok(rpc::unary(GetMetricsSvc(inner), req, limits).await) })
            }
            GET_FILTERS_PATH => {
                Box::pin(async move { Ok(rpc::unary(GetFiltersSvc(inner), req, limits).await) })
            }
            GET_METRICS_NAMES_PATH => {
                Box::pin(async move { Ok(rpc::unary(GetMetricsNamesSvc(inner), req, limits).await) })
            }
            _ => Box::pin(async move { Ok(rpc::unimplemented()) }),
        }
    }
}
