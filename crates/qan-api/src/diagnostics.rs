//! Diagnostics listener: Prometheus exposition and runtime introspection.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;

use crate::buffer::Ingester;

#[derive(Clone)]
pub struct DiagnosticsState {
    registry: Registry,
    ingester: Arc<Ingester>,
    started: Instant,
}

impl DiagnosticsState {
    pub fn new(registry: Registry, ingester: Arc<Ingester>) -> Self {
        Self {
            registry,
            ingester,
            started: Instant::now(),
        }
    }
}

pub fn diagnostics_router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/debug", get(handle_index))
        .route("/debug/metrics", get(handle_metrics))
        .route("/debug/vars", get(handle_vars))
        .with_state(state)
}

const INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><title>qan-api diagnostics</title></head>
<body>
<h1>qan-api diagnostics</h1>
<ul>
<li><a href="/debug/metrics">/debug/metrics</a>: Prometheus metrics</li>
<li><a href="/debug/vars">/debug/vars</a>: runtime variables</li>
</ul>
</body>
</html>
"#;

async fn handle_index() -> Html<&'static str> {
    Html(INDEX)
}

async fn handle_metrics(State(state): State<DiagnosticsState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        tracing::error!(component = "diagnostics", error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct Vars {
    version: &'static str,
    uptime_secs: u64,
    tokio_workers: usize,
    tokio_alive_tasks: usize,
    open_buckets: usize,
    buffer_closed: bool,
}

async fn handle_vars(State(state): State<DiagnosticsState>) -> Json<Vars> {
    let runtime = tokio::runtime::Handle::current().metrics();

    Json(Vars {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        tokio_workers: runtime.num_workers(),
        tokio_alive_tasks: runtime.num_alive_tasks(),
        open_buckets: state.ingester.open_buckets(),
        buffer_closed: state.ingester.is_closed(),
    })
}
