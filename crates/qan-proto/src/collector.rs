//! `qan.v1.Collector`: metrics ingestion from agents.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tonic::body::BoxBody;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{NamedService, UnaryService};

use crate::rpc;

/// Full method path of `Collector.Collect`.
pub const COLLECT_PATH: &str = "/qan.v1.Collector/Collect";

/// Metrics observed by an agent for one query shape during one period.
///
/// Tag fields are optional on the wire; an empty string means "not set".
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsBucket {
    /// Digest of the normalised query.
    #[prost(string, tag = "1")]
    pub fingerprint: String,
    /// Start of the aggregation period, unix seconds.
    #[prost(int64, tag = "2")]
    pub period_start_unix_secs: i64,
    #[prost(string, tag = "3")]
    pub service_name: String,
    #[prost(string, tag = "4")]
    pub database: String,
    #[prost(string, tag = "5")]
    pub schema: String,
    #[prost(string, tag = "6")]
    pub username: String,
    #[prost(string, tag = "7")]
    pub client_host: String,
    /// Metric name to observed value, e.g. `query_time` or `rows_sent`.
    #[prost(map = "string, double", tag = "8")]
    pub metrics: HashMap<String, f64>,
}

/// Batch of buckets sent by an agent.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectRequest {
    #[prost(message, repeated, tag = "1")]
    pub metrics_bucket: Vec<MetricsBucket>,
}

/// Why a single bucket of a batch was refused.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Rejection {
    /// Position of the bucket in `CollectRequest.metrics_bucket`.
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(string, tag = "2")]
    pub reason: String,
}

/// Outcome of a batch. Buckets are accepted or rejected one by one.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectResponse {
    #[prost(uint32, tag = "1")]
    pub accepted: u32,
    #[prost(uint32, tag = "2")]
    pub rejected: u32,
    #[prost(message, repeated, tag = "3")]
    pub rejections: Vec<Rejection>,
}

/// Server-side behaviour of `qan.v1.Collector`.
#[tonic::async_trait]
pub trait Collector: Send + Sync + 'static {
    async fn collect(
        &self,
        request: tonic::Request<CollectRequest>,
    ) -> Result<tonic::Response<CollectResponse>, tonic::Status>;
}

/// tonic service wrapping a [`Collector`] implementation.
pub struct CollectorServer<T> {
    inner: Arc<T>,
    limits: rpc::Limits,
}

impl<T> CollectorServer<T> {
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

impl<T> Clone for CollectorServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            limits: self.limits,
        }
    }
}

impl<T> NamedService for CollectorServer<T> {
    const NAME: &'static str = "qan.v1.Collector";
}

struct CollectSvc<T>(Arc<T>);

impl<T: Collector> UnaryService<CollectRequest> for CollectSvc<T> {
    type Response = CollectResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

    fn call(&mut self, request: tonic::Request<CollectRequest>) -> Self::Future {
        let inner = Arc::clone(&self.0);
        Box::pin(async move { inner.collect(request).await })
    }
}

impl<T, B> Service<http::Request<B>> for CollectorServer<T>
where
    T: Collector,
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
        if req.uri().path() == COLLECT_PATH {
            let svc = CollectSvc(Arc::clone(&self.inner));
            let limits = self.limits;
            Box::pin(async move { Ok(rpc::unary(svc, req, limits).await) })
        } else {
            Box::pin(async move { Ok(rpc::unimplemented()) })
        }
    }
}
