//! Proxy accept loop.
//!
//! A proxy owns its listener and backend pool. Each accepted connection is
//! routed to the best backend at accept time and piped in its own task.
//! When no backend is alive the connection is closed immediately.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::Backend;
use super::listener::{FrontListener, Upgrader};
use super::pipe::PipeStats;
use super::pool::BackendPool;
use crate::config::{PingConfig, ProxyConfig};
use crate::error::{PipeError, ProxyError};

/// Delay after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Listener bound, accept loop not started yet.
    Created,
    /// Accepting connections.
    Listening,
    /// Listener closed; no new connections are accepted.
    Closed,
}

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections closed because no backend was alive.
    pub connections_rejected: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections finished.
    pub connections_closed: AtomicU64,
    /// Backend dials that failed while routing a connection.
    pub backend_dial_failures: AtomicU64,
    /// Sessions that ended with a reportable error.
    pub pipe_errors: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// A listening TCP proxy in front of a pool of backends.
pub struct Proxy {
    name: String,
    local_addr: SocketAddr,
    tls: bool,
    listener: Mutex<Option<FrontListener>>,
    pool: Arc<BackendPool>,
    buffer_size: usize,
    shutdown: CancellationToken,
    state: watch::Sender<ProxyState>,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    /// Start a proxy's backends and bind its listener.
    ///
    /// The proxy runs under a child of `shutdown`. Closing the proxy cancels
    /// it, which stops the accept loop and every backend monitor.
    pub async fn bind(
        config: &ProxyConfig,
        global: &PingConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, ProxyError> {
        config.validate()?;

        let shutdown = shutdown.child_token();
        let pool = BackendPool::spawn(config, global, &shutdown);

        let listener = match FrontListener::bind(&config.addr, config.tls().as_ref()).await {
            Ok(listener) => listener,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                shutdown.cancel();
                return Err(ProxyError::Bind {
                    addr: config.addr.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            name: config.display_name().to_string(),
            local_addr,
            tls: listener.is_tls(),
            listener: Mutex::new(Some(listener)),
            pool: Arc::new(pool),
            buffer_size: config.buffer_size(),
            shutdown,
            state: watch::channel(ProxyState::Created).0,
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Proxy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the proxy terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Backend pool.
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    /// Stop accepting connections and stop all backend monitors.
    ///
    /// In-flight sessions are left to drain on their own.
    pub fn close(&self) {
        self.shutdown.cancel();
        // Release a listener whose accept loop never started.
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Accept and route connections until the proxy is closed.
    ///
    /// The listener is released when this returns, so later connection
    /// attempts are refused. Only the first call accepts anything.
    pub async fn run(&self) {
        let taken = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = taken else {
            warn!(proxy = %self.name, "Proxy already running or closed");
            return;
        };
        let upgrader = listener.upgrader();

        self.state.send_replace(ProxyState::Listening);
        info!(
            proxy = %self.name,
            addr = %self.local_addr,
            tls = self.tls,
            backends = self.pool.len(),
            "Proxy ready"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.dispatch(&upgrader, stream, peer_addr),
                Err(e) => {
                    error!(proxy = %self.name, error = %e, "Cannot accept connection");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        drop(listener);
        self.state.send_replace(ProxyState::Closed);
        info!(proxy = %self.name, "Proxy closed");
    }

    /// Route one accepted connection.
    fn dispatch(&self, upgrader: &Upgrader, stream: TcpStream, peer_addr: SocketAddr) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        let Some(backend) = self.pool.select() else {
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            warn!(proxy = %self.name, peer_addr = %peer_addr, "No backend available");
            return;
        };

        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let upgrader = upgrader.clone();
        let buffer_size = self.buffer_size;
        let stats = Arc::clone(&self.stats);
        let span = tracing::info_span!(
            "connection",
            proxy = %self.name,
            peer = %peer_addr,
            backend = %backend.addr()
        );

        tokio::spawn(
            async move {
                let result = serve(upgrader, stream, &backend, buffer_size).await;
                record(&stats, &backend, result);

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            }
            .instrument(span),
        );
    }
}

/// Finish accepting a connection and pipe it. The front stream is closed on return.
async fn serve(
    upgrader: Upgrader,
    stream: TcpStream,
    backend: &Backend,
    buffer_size: usize,
) -> Result<PipeStats, PipeError> {
    let front = upgrader.upgrade(stream).await.map_err(PipeError::Handshake)?;
    backend.pipe(front, buffer_size).await
}

fn record(stats: &ProxyStats, backend: &Backend, result: Result<PipeStats, PipeError>) {
    match result {
        Ok(piped) => {
            stats
                .bytes_to_backend
                .fetch_add(piped.bytes_to_backend, Ordering::Relaxed);
            stats
                .bytes_from_backend
                .fetch_add(piped.bytes_from_backend, Ordering::Relaxed);
            debug!(
                bytes_to_backend = piped.bytes_to_backend,
                bytes_from_backend = piped.bytes_from_backend,
                "Connection closed"
            );
        }
        Err(e @ PipeError::Dial { .. }) => {
            stats
                .backend_dial_failures
                .fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Connection abandoned");
        }
        Err(e) if e.is_benign() => {
            debug!(error = %e, "Connection ended");
        }
        Err(e) => {
            stats.pipe_errors.fetch_add(1, Ordering::Relaxed);
            error!(backend_addr = %backend.addr(), error = %e, "Cannot pipe");
        }
    }
}
