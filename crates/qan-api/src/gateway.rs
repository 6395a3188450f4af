//! HTTP/JSON gateway over the analytics backend.
//!
//! Each route accepts the JSON form of the corresponding `qan.v1.Analytics`
//! request message and answers with the JSON form of its reply. An empty
//! body is read as the default request.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use crate::analytics::AnalyticsService;
use crate::QanError;

/// Default maximum request body size (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

pub const REPORT_PATH: &str = "/v0/qan/GetReport";
pub const OBJECT_DETAILS_PATH: &str = "/v0/qan/ObjectDetails/GetMetrics";
pub const FILTERS_PATH: &str = "/v0/qan/Filters/Get";
pub const METRICS_NAMES_PATH: &str = "/v0/qan/GetMetricsNames";

/// Create the gateway router.
pub fn gateway_router(analytics: AnalyticsService) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(REPORT_PATH, post(handle_report))
        .route(OBJECT_DETAILS_PATH, post(handle_object_details))
        .route(FILTERS_PATH, post(handle_filters))
        .route(METRICS_NAMES_PATH, post(handle_metrics_names))
        .layer(RequestDecompressionLayer::new())
        .layer(DefaultBodyLimit::max(DEFAULT_MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(analytics)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tracing::instrument(skip_all, fields(component = "gateway"))]
async fn handle_report(
    State(analytics): State<AnalyticsService>,
    body: Bytes,
) -> Result<impl IntoResponse, QanError> {
    Ok(Json(analytics.report(decode(&body)?).await?))
}

#[tracing::instrument(skip_all, fields(component = "gateway"))]
async fn handle_object_details(
    State(analytics): State<AnalyticsService>,
    body: Bytes,
) -> Result<impl IntoResponse, QanError> {
    Ok(Json(analytics.object_details(decode(&body)?).await?))
}

#[tracing::instrument(skip_all, fields(component = "gateway"))]
async fn handle_filters(
    State(analytics): State<AnalyticsService>,
    body: Bytes,
) -> Result<impl IntoResponse, QanError> {
    Ok(Json(analytics.filters(decode(&body)?).await?))
}

#[tracing::instrument(skip_all, fields(component = "gateway"))]
async fn handle_metrics_names(
    State(analytics): State<AnalyticsService>,
) -> Result<impl IntoResponse, QanError> {
    Ok(Json(analytics.metrics_names().await?))
}

fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, QanError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| QanError::InvalidArgument(format!("invalid request body: {e}")))
}

impl IntoResponse for QanError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::QueryTimeout { duration } => (
                StatusCode::GATEWAY_TIMEOUT,
                format!("query timed out after {duration:?}"),
            ),
            err => {
                tracing::error!(error = %err, "analytics request failed");
                let sanitised = match err {
                    Self::DataFusion(_) => "query execution error",
                    Self::Arrow(_) => "data processing error",
                    Self::Parquet(_) => "storage read error",
                    Self::ObjectStore(_) => "storage access error",
                    _ => "internal error",
                };
                (StatusCode::INTERNAL_SERVER_ERROR, sanitised.to_owned())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });
        (status, Json(body)).into_response()
    }
}
