//! Per-method RPC instrumentation for the native listener.
//!
//! Every call is counted when it starts and again when it completes, the
//! latter labelled with its gRPC status code. Handling time goes into a
//! histogram per method.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use qan_proto::analytics::{
    GET_FILTERS_PATH, GET_METRICS_NAMES_PATH, GET_METRICS_PATH, GET_REPORT_PATH,
};
use qan_proto::collector::COLLECT_PATH;
use tonic::codegen::http::{Request, Response};
use tower::{Layer, Service};

/// Paths that get their own label set. Anything else is `unknown`.
const KNOWN_METHODS: [&str; 5] = [
    COLLECT_PATH,
    GET_REPORT_PATH,
    GET_METRICS_PATH,
    GET_FILTERS_PATH,
    GET_METRICS_NAMES_PATH,
];

const UNKNOWN: (&str, &str) = ("unknown", "unknown");

/// Prometheus series for the RPC listener.
#[derive(Clone)]
pub struct RpcMetrics {
    pub started: IntCounterVec,
    pub handled: IntCounterVec,
    pub handling_seconds: HistogramVec,
}

impl RpcMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            started: IntCounterVec::new(
                Opts::new("grpc_server_started_total", "RPCs started on the server"),
                &["grpc_service", "grpc_method"],
            )?,
            handled: IntCounterVec::new(
                Opts::new(
                    "grpc_server_handled_total",
                    "RPCs completed on the server, by status code",
                ),
                &["grpc_service", "grpc_method", "grpc_code"],
            )?,
            handling_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "grpc_server_handling_seconds",
                    "Time from receiving an RPC to sending its response headers",
                ),
                &["grpc_service", "grpc_method"],
            )?,
        };

        registry.register(Box::new(metrics.started.clone()))?;
        registry.register(Box::new(metrics.handled.clone()))?;
        registry.register(Box::new(metrics.handling_seconds.clone()))?;

        Ok(metrics)
    }
}

/// Tower layer that records [`RpcMetrics`] for every call.
#[derive(Clone)]
pub struct RpcMetricsLayer {
    metrics: RpcMetrics,
}

impl RpcMetricsLayer {
    pub const fn new(metrics: RpcMetrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcMetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RpcMetricsService<S> {
    inner: S,
    metrics: RpcMetrics,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RpcMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (service, method) = split_method(req.uri().path());
        self.metrics
            .started
            .with_label_values(&[service, method])
            .inc();

        let metrics = self.metrics.clone();
        let start = Instant::now();
        // the clone that was polled ready is the one that must be called
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = inner.call(req).await;

            let code = match &result {
                Ok(response) => status_code(response),
                Err(_) => tonic::Code::Internal,
            };
            metrics
                .handled
                .with_label_values(&[service, method, format!("{code:?}").as_str()])
                .inc();
            metrics
                .handling_seconds
                .with_label_values(&[service, method])
                .observe(start.elapsed().as_secs_f64());

            result
        })
    }
}

/// `("qan.v1.Collector", "Collect")` for a known method path.
fn split_method(path: &str) -> (&'static str, &'static str) {
    KNOWN_METHODS
        .into_iter()
        .find(|known| *known == path)
        .and_then(|known| known.trim_start_matches('/').split_once('/'))
        .unwrap_or(UNKNOWN)
}

/// Status sent in the response headers. Successful unary calls carry it in
/// the trailers instead, so a missing header means OK.
fn status_code<B>(response: &Response<B>) -> tonic::Code {
    response
        .headers()
        .get("grpc-status")
        .map_or(tonic::Code::Ok, |value| {
            tonic::Code::from_bytes(value.as_bytes())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tonic::codegen::http::HeaderValue;
    use tower::ServiceExt;

    async fn reply(req: Request<()>) -> Result<Response<()>, Infallible> {
        let mut response = Response::new(());
        if req.uri().path() == GET_REPORT_PATH {
            response.headers_mut().insert(
                "grpc-status",
                HeaderValue::from(tonic::Code::InvalidArgument as i32),
            );
        }
        Ok(response)
    }

    fn request(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[test]
    fn known_paths_split_into_service_and_method() {
        assert_eq!(split_method(COLLECT_PATH), ("qan.v1.Collector", "Collect"));
        assert_eq!(
            split_method(GET_METRICS_NAMES_PATH),
            ("qan.v1.Analytics", "GetMetricsNames")
        );
        assert_eq!(split_method("/qan.v1.Collector/Nope"), UNKNOWN);
        assert_eq!(split_method("/"), UNKNOWN);
    }

    #[tokio::test]
    async fn calls_are_counted_by_method_and_code() {
        let metrics = RpcMetrics::register(&Registry::new()).unwrap();
        let service = RpcMetricsLayer::new(metrics.clone()).layer(tower::service_fn(reply));

        service.clone().oneshot(request(COLLECT_PATH)).await.unwrap();
        service.clone().oneshot(request(COLLECT_PATH)).await.unwrap();
        service.oneshot(request(GET_REPORT_PATH)).await.unwrap();

        let collect = ["qan.v1.Collector", "Collect"];
        assert_eq!(metrics.started.with_label_values(&collect).get(), 2);
        assert_eq!(
            metrics
                .handled
                .with_label_values(&["qan.v1.Collector", "Collect", "Ok"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .handled
                .with_label_values(&["qan.v1.Analytics", "GetReport", "InvalidArgument"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .handling_seconds
                .with_label_values(&collect)
                .get_sample_count(),
            2
        );
    }
}
