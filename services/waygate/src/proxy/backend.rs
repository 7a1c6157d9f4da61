//! Backend servers and their load/health accounting.
//!
//! Each backend owns one lock guarding its monitor state, active connection
//! count and last probe latency. Readers take a [`BackendSnapshot`] so the
//! three values are always observed together.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::monitor::{self, MonitorState};
use super::pipe::{relay, PipeStats};
use crate::config::PingSettings;
use crate::error::{is_benign_io, PipeError};

/// Default connect timeout for piped backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Consistent view of a backend's mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSnapshot {
    /// Whether the health monitor currently holds a working probe connection.
    pub alive: bool,
    /// Client sessions currently piped through this backend.
    pub active_connections: usize,
    /// Duration of the most recent successful probe write.
    pub latency: Duration,
    /// Current monitor state.
    pub monitor: MonitorState,
}

#[derive(Debug)]
struct BackendState {
    monitor: MonitorState,
    active_connections: usize,
    latency: Duration,
}

/// A configured upstream server.
#[derive(Debug)]
pub struct Backend {
    addr: String,
    ping: PingSettings,
    state: Mutex<BackendState>,
    shutdown: CancellationToken,
}

impl Backend {
    /// Create a backend and start its health monitor.
    ///
    /// The monitor runs until `shutdown` is cancelled.
    pub fn spawn(addr: impl Into<String>, ping: PingSettings, shutdown: CancellationToken) -> Arc<Self> {
        let backend = Arc::new(Self::new(addr, ping, shutdown));
        tokio::spawn(monitor::run(Arc::clone(&backend)));
        backend
    }

    /// Create a backend without a monitor. It stays down until marked otherwise.
    pub(crate) fn new(addr: impl Into<String>, ping: PingSettings, shutdown: CancellationToken) -> Self {
        Self {
            addr: addr.into(),
            ping,
            state: Mutex::new(BackendState {
                monitor: MonitorState::Disconnected,
                active_connections: 0,
                latency: Duration::ZERO,
            }),
            shutdown,
        }
    }

    /// Backend address (host:port).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Resolved probe timings.
    pub fn ping_settings(&self) -> PingSettings {
        self.ping
    }

    /// Lifecycle token observed by the monitor.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Take a consistent snapshot of the backend's state.
    pub fn snapshot(&self) -> BackendSnapshot {
        let state = self.lock();
        BackendSnapshot {
            alive: state.monitor == MonitorState::Alive,
            active_connections: state.active_connections,
            latency: state.latency,
            monitor: state.monitor,
        }
    }

    /// Whether the backend is currently eligible for traffic.
    pub fn is_alive(&self) -> bool {
        self.snapshot().alive
    }

    /// Number of sessions currently piped through this backend.
    pub fn active_connections(&self) -> usize {
        self.snapshot().active_connections
    }

    pub(crate) fn set_monitor_state(&self, monitor: MonitorState) {
        self.lock().monitor = monitor;
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Relay one accepted front connection through a freshly dialed backend connection.
    ///
    /// Resets, broken pipes and closed sockets end the session normally and are
    /// not reported. Other copy errors are returned for logging only.
    pub async fn pipe<S>(&self, front: S, buffer_size: usize) -> Result<PipeStats, PipeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let back = self.dial().await.map_err(|source| PipeError::Dial {
            addr: self.addr.clone(),
            source,
        })?;

        let _session = SessionGuard::new(self);
        debug!(backend_addr = %self.addr, "Connected to backend");

        let (stats, result) = relay(front, back, buffer_size).await;
        match result {
            Ok(()) => Ok(stats),
            Err(e) if is_benign_io(&e) => Ok(stats),
            Err(e) => Err(PipeError::Copy(e)),
        }
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        match timeout(DEFAULT_CONNECT_TIMEOUT, TcpStream::connect(self.addr.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        // Writers never leave the state half-updated, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts one piped session for as long as it is alive.
struct SessionGuard<'a> {
    backend: &'a Backend,
}

impl<'a> SessionGuard<'a> {
    fn new(backend: &'a Backend) -> Self {
        backend.lock().active_connections += 1;
        Self { backend }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.backend.lock();
        state.active_connections = state.active_connections.saturating_sub(1);
    }
}
