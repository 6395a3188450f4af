//! qan-api binary entry point.
//!
//! Starts the query analytics backend with:
//! - Native RPC: `qan.v1.Collector` and `qan.v1.Analytics` (port 9911)
//! - HTTP/JSON gateway (port 9922)
//! - Diagnostics (port 9933)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use qan_api::{
    analytics::AnalyticsService,
    buffer::{BufferMetrics, Ingester},
    config::LogFormat,
    diagnostics::{diagnostics_router, DiagnosticsState},
    gateway::gateway_router,
    migrations,
    receiver::CollectorReceiver,
    retention::Pruner,
    server::{GrpcServe, HttpServe, RpcMetrics, Server, Services},
    storage::{base_url, check_connectivity, create_object_store, ParquetStore},
    QanConfig,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Query analytics backend.
#[derive(Parser, Debug)]
#[command(name = "qan-api")]
#[command(about = "Ingest and serve aggregated query metrics")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Native RPC listen address.
    #[arg(long, value_name = "ADDR", env = "QAN_GRPC_BIND")]
    grpc_bind: Option<SocketAddr>,

    /// HTTP/JSON gateway listen address.
    #[arg(long, value_name = "ADDR", env = "QAN_JSON_BIND")]
    json_bind: Option<SocketAddr>,

    /// Diagnostics listen address.
    #[arg(long, value_name = "ADDR", env = "QAN_LISTEN_DEBUG_ADDR")]
    listen_debug_addr: Option<SocketAddr>,

    /// Days of data to keep.
    #[arg(long, value_name = "DAYS", env = "QAN_DATA_RETENTION")]
    data_retention: Option<u32>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Enable trace logging. Implies --debug.
    #[arg(long)]
    trace: bool,
}

impl Cli {
    fn apply(&self, config: &mut QanConfig) {
        if let Some(addr) = self.grpc_bind {
            config.server.grpc_addr = addr;
        }
        if let Some(addr) = self.json_bind {
            config.server.json_addr = addr;
        }
        if let Some(addr) = self.listen_debug_addr {
            config.server.debug_addr = addr;
        }
        if let Some(days) = self.data_retention {
            config.retention.days = days;
        }
    }

    const fn default_filter(&self) -> &'static str {
        if self.trace {
            "qan_api=trace,tower_http=debug"
        } else if self.debug {
            "qan_api=debug,tower_http=debug"
        } else {
            "qan_api=info"
        }
    }
}

fn init_tracing(cli: &Cli, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter()));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = format!("{e:#}"), "Fatal startup error");
        eprintln!("qan-api: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = QanConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("validating configuration")?;

    init_tracing(&cli, config.logging.format);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_addr = %config.server.grpc_addr,
        json_addr = %config.server.json_addr,
        debug_addr = %config.server.debug_addr,
        retention_days = config.retention.days,
        "Starting qan-api"
    );

    let store = create_object_store(&config.storage, &config.pool)
        .context("creating object store")?;
    check_connectivity(store.as_ref())
        .await
        .context("connecting to storage")?;

    let outcome = migrations::apply_pending(store.as_ref())
        .await
        .context("applying schema migrations")?;
    info!(outcome = ?outcome, "Schema ready");
    let table_schema = migrations::load_table_schema(store.as_ref())
        .await
        .context("loading table schema")?;

    let url = base_url(&config.storage).context("resolving storage URL")?;
    let parquet = Arc::new(
        ParquetStore::new(Arc::clone(&store), &url, table_schema, &config.parquet)
            .context("initialising parquet store")?
            .with_query_timeout(config.query.timeout()),
    );

    let registry = Registry::new();
    #[cfg(target_os = "linux")]
    registry
        .register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))
        .context("registering process collector")?;

    let buffer_metrics = BufferMetrics::register(&registry).context("registering buffer metrics")?;
    let rpc_metrics = RpcMetrics::register(&registry).context("registering RPC metrics")?;
    let ingester = Arc::new(Ingester::new(
        parquet.clone(),
        config.buffer.clone(),
        buffer_metrics,
    ));
    let pruner = Arc::new(
        Pruner::new(parquet.clone(), config.retention.clone(), &registry)
            .context("registering retention metrics")?,
    );

    let analytics = AnalyticsService::new(Arc::clone(&parquet));
    let services = Services {
        rpc: Arc::new(
            GrpcServe::new(
                CollectorReceiver::new(Arc::clone(&ingester)),
                analytics.clone(),
                rpc_metrics,
            )
            .max_message_bytes(config.server.max_recv_msg_bytes),
        ),
        json: Arc::new(HttpServe::new(gateway_router(analytics))),
        debug: Arc::new(HttpServe::new(diagnostics_router(DiagnosticsState::new(
            registry,
            Arc::clone(&ingester),
        )))),
        ingester,
        pruner: Some(pruner),
    };

    let shutdown = CancellationToken::new();
    let server = Server::start(&config.server, services, shutdown.clone())
        .await
        .context("binding listeners")?;

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    if !server.wait().await {
        error!("Shutdown did not complete before the hard deadline");
    }
    info!("qan-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        }
        () = terminate => {
            info!("Received SIGTERM");
        }
    }
}
