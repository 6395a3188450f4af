//! One network listener with a graceful-drain state machine.
//!
//! ```text
//! Starting ──bind──► Serving ──shutdown──► Draining ──drained or grace──► Stopped
//!                      │  ▲
//!      accept failure  │  │ rebind after backoff
//!                      ▼  │
//!                   (restarting)
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::retry::Backoff;

/// Lifecycle of a [`Listener`], published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// A protocol server that can run on an already-bound socket.
#[async_trait]
pub trait Serve: Send + Sync + 'static {
    /// Accept connections on `listener` until `shutdown` fires, then finish
    /// in-flight requests and return.
    async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()>;
}

/// Supervises one [`Serve`] implementation on one address.
pub struct Listener {
    name: &'static str,
    addr: SocketAddr,
    service: Arc<dyn Serve>,
    grace: Duration,
    restart: Backoff,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    /// Bind `addr`. A bind failure here is a startup failure.
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        service: Arc<dyn Serve>,
        config: &ServerConfig,
    ) -> io::Result<(Self, TcpListener)> {
        let tcp = TcpListener::bind(addr).await?;
        // rebinding after a failure reuses the resolved port
        let addr = tcp.local_addr()?;
        let (state, _) = watch::channel(ListenerState::Starting);

        let listener = Self {
            name,
            addr,
            service,
            grace: config.shutdown_grace(),
            restart: Backoff::new(
                u32::MAX,
                Duration::from_millis(config.restart_initial_delay_ms),
                Duration::from_millis(config.restart_max_delay_ms),
            ),
            state,
        };
        Ok((listener, tcp))
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Serve until `shutdown`, restarting the accept loop on failure.
    ///
    /// On shutdown the listener drains for at most the grace period, then
    /// drops whatever is still in flight. Returns once `Stopped` has been
    /// published.
    pub async fn run(self, tcp: TcpListener, shutdown: CancellationToken) {
        let mut pending = Some(tcp);
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let tcp = match pending.take() {
                Some(tcp) => tcp,
                None => match TcpListener::bind(self.addr).await {
                    Ok(tcp) => tcp,
                    Err(e) => {
                        tracing::error!(
                            component = self.name,
                            addr = %self.addr,
                            error = %e,
                            "Rebind failed"
                        );
                        if !self.pause(&mut failures, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            self.state.send_replace(ListenerState::Serving);
            tracing::info!(component = self.name, addr = %self.addr, "Listener serving");

            let drain = CancellationToken::new();
            let serve = self.service.serve(tcp, drain.clone());
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    match result {
                        Ok(()) => tracing::warn!(component = self.name, "Accept loop exited unexpectedly"),
                        Err(e) => tracing::error!(component = self.name, error = %e, "Accept loop failed"),
                    }
                    if !self.pause(&mut failures, &shutdown).await {
                        break;
                    }
                }
                () = shutdown.cancelled() => {
                    self.state.send_replace(ListenerState::Draining);
                    tracing::info!(
                        component = self.name,
                        grace_ms = self.grace.as_millis(),
                        "Listener draining"
                    );
                    drain.cancel();

                    match tokio::time::timeout(self.grace, &mut serve).await {
                        Ok(Ok(())) => tracing::info!(component = self.name, "Listener drained"),
                        Ok(Err(e)) => tracing::warn!(component = self.name, error = %e, "Listener failed while draining"),
                        Err(_) => tracing::warn!(component = self.name, "Grace period expired, forcing close"),
                    }
                    break;
                }
            }
        }

        self.state.send_replace(ListenerState::Stopped);
        tracing::info!(component = self.name, "Listener stopped");
    }

    /// Sleep before a restart. Returns `false` if shutdown began meanwhile.
    async fn pause(&self, failures: &mut u32, shutdown: &CancellationToken) -> bool {
        let delay = self.restart.delay(*failures);
        *failures = failures.saturating_add(1);
        self.state.send_replace(ListenerState::Starting);
        tracing::info!(
            component = self.name,
            delay_ms = delay.as_millis(),
            "Restarting listener"
        );

        tokio::select! {
            () = shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
