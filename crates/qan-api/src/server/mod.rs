//! Process lifecycle: three listeners, the ingestion buffer and the
//! retention pruner, started together and stopped in order.
//!
//! Stop order on shutdown:
//!
//! 1. All listeners drain concurrently, each within its grace period.
//! 2. Once the RPC listener has stopped, the buffer is closed and flushes
//!    its open window. No accepted observation arrives after that flush.
//! 3. Anything still running at the hard deadline is aborted.

pub mod listener;
pub mod rpc_metrics;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use qan_proto::{AnalyticsServer, CollectorServer};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::analytics::AnalyticsService;
use crate::buffer::Ingester;
use crate::config::{ServerConfig, DEFAULT_MAX_RECV_MSG_BYTES};
use crate::receiver::CollectorReceiver;
use crate::retention::Pruner;

pub use listener::{Listener, ListenerState, Serve};
pub use rpc_metrics::{RpcMetrics, RpcMetricsLayer};

/// Native RPC: `qan.v1.Collector` and `qan.v1.Analytics` on one port.
pub struct GrpcServe {
    collector: CollectorReceiver,
    analytics: AnalyticsService,
    metrics: RpcMetrics,
    max_message_bytes: usize,
}

impl GrpcServe {
    pub const fn new(
        collector: CollectorReceiver,
        analytics: AnalyticsService,
        metrics: RpcMetrics,
    ) -> Self {
        Self {
            collector,
            analytics,
            metrics,
            max_message_bytes: DEFAULT_MAX_RECV_MSG_BYTES,
        }
    }

    /// Largest message either service decodes or encodes.
    #[must_use]
    pub fn max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }
}

#[async_trait]
impl Serve for GrpcServe {
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        let limit = self.max_message_bytes;
        tonic::transport::Server::builder()
            .layer(TraceLayer::new_for_grpc())
            .layer(RpcMetricsLayer::new(self.metrics.clone()))
            .add_service(
                CollectorServer::new(self.collector.clone())
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            )
            .add_service(
                AnalyticsServer::new(self.analytics.clone())
                    .max_decoding_message_size(limit)
                    .max_encoding_message_size(limit),
            )
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown.cancelled_owned(),
            )
            .await
            .map_err(io::Error::other)
    }
}

/// Any axum router: the JSON gateway or the diagnostics endpoints.
pub struct HttpServe {
    router: Router,
}

impl HttpServe {
    pub const fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Serve for HttpServe {
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

/// Everything [`Server::start`] runs.
pub struct Services {
    pub rpc: Arc<dyn Serve>,
    pub json: Arc<dyn Serve>,
    pub debug: Arc<dyn Serve>,
    pub ingester: Arc<Ingester>,
    pub pruner: Option<Arc<Pruner>>,
}

/// Resolved listener addresses, useful when binding port 0.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub rpc: SocketAddr,
    pub json: SocketAddr,
    pub debug: SocketAddr,
}

/// A started service. Call [`Server::wait`] to run it to completion.
pub struct Server {
    addrs: BoundAddrs,
    rpc_state: watch::Receiver<ListenerState>,
    shutdown: CancellationToken,
    tasks: JoinSet<&'static str>,
    hard_deadline: Duration,
}

impl Server {
    /// Bind all listeners and launch every background task.
    ///
    /// Fails without starting anything if any listener cannot bind.
    pub async fn start(
        config: &ServerConfig,
        services: Services,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        let (rpc, rpc_tcp) = Listener::bind("rpc", config.grpc_addr, services.rpc, config).await?;
        let (json, json_tcp) =
            Listener::bind("gateway", config.json_addr, services.json, config).await?;
        let (debug, debug_tcp) =
            Listener::bind("diagnostics", config.debug_addr, services.debug, config).await?;

        let addrs = BoundAddrs {
            rpc: rpc.local_addr(),
            json: json.local_addr(),
            debug: debug.local_addr(),
        };
        let rpc_state = rpc.subscribe();
        let mut tasks = JoinSet::new();

        // The buffer outlives the RPC listener: it is only closed when the
        // RPC task finishes, however that happens.
        let buffer_token = CancellationToken::new();
        let ingester = services.ingester;
        let token = buffer_token.clone();
        tasks.spawn(async move {
            ingester.run(token).await;
            "buffer"
        });

        let token = shutdown.clone();
        tasks.spawn(async move {
            let _close_buffer = buffer_token.drop_guard();
            rpc.run(rpc_tcp, token).await;
            "rpc"
        });

        let token = shutdown.clone();
        tasks.spawn(async move {
            json.run(json_tcp, token).await;
            "gateway"
        });

        let token = shutdown.clone();
        tasks.spawn(async move {
            debug.run(debug_tcp, token).await;
            "diagnostics"
        });

        if let Some(pruner) = services.pruner {
            let token = shutdown.clone();
            tasks.spawn(async move {
                pruner.run(token).await;
                "retention"
            });
        }

        tracing::info!(
            rpc = %addrs.rpc,
            gateway = %addrs.json,
            diagnostics = %addrs.debug,
            "Server started"
        );

        Ok(Self {
            addrs,
            rpc_state,
            shutdown,
            tasks,
            hard_deadline: config.hard_deadline(),
        })
    }

    pub const fn addrs(&self) -> BoundAddrs {
        self.addrs
    }

    pub fn rpc_state(&self) -> watch::Receiver<ListenerState> {
        self.rpc_state.clone()
    }

    /// Begin shutdown. Equivalent to cancelling the token given to `start`.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown, then wait for every task up to the hard deadline.
    ///
    /// Returns `false` if tasks had to be aborted.
    pub async fn wait(mut self) -> bool {
        self.shutdown.cancelled().await;
        tracing::info!(
            deadline_secs = self.hard_deadline.as_secs(),
            "Shutdown started"
        );

        let deadline = tokio::time::Instant::now() + self.hard_deadline;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok(name))) => tracing::debug!(task = name, "Task finished"),
                Ok(Some(Err(e))) => tracing::error!(error = %e, "Task panicked"),
                Err(_) => {
                    tracing::error!(
                        remaining = self.tasks.len(),
                        "Hard deadline reached, aborting remaining tasks"
                    );
                    self.tasks.shutdown().await;
                    return false;
                }
            }
        }

        tracing::info!("Shutdown complete");
        true
    }
}
