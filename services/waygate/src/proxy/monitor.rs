//! Per-backend health monitor.
//!
//! The monitor keeps one long-lived probe connection to its backend and
//! writes a single byte every ping interval. The write duration is recorded
//! as the backend's latency. A failed write drops the connection and the
//! monitor starts dialing again.
//!
//! ```text
//! Disconnected -> Connecting -> Alive
//!      ^              |           |
//!      +--------------+-----------+   (dial or probe failure)
//! ```
//!
//! Every dial, write and sleep observes the backend's shutdown token; once
//! cancelled the monitor moves to `Stopped` and exits.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::backend::Backend;

/// Fixed probe payload.
pub const PROBE: &[u8] = b"p";

/// Health monitor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No probe connection; about to dial.
    Disconnected,
    /// Dialing the backend.
    Connecting,
    /// Probe connection established and the last write succeeded.
    Alive,
    /// Shut down; the monitor task has exited.
    Stopped,
}

/// Run the monitor for `backend` until its shutdown token is cancelled.
pub(crate) async fn run(backend: Arc<Backend>) {
    let shutdown = backend.shutdown_token().clone();
    let mut probe: Option<TcpStream> = None;
    let mut state = MonitorState::Disconnected;

    loop {
        backend.set_monitor_state(state);

        state = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = step(&backend, state, &mut probe) => next,
        };
    }

    drop(probe);
    backend.set_monitor_state(MonitorState::Stopped);
    debug!(backend_addr = %backend.addr(), "Backend monitor stopped");
}

/// Perform one transition of the monitor state machine.
async fn step(backend: &Backend, state: MonitorState, probe: &mut Option<TcpStream>) -> MonitorState {
    let ping = backend.ping_settings();

    match state {
        MonitorState::Disconnected => {
            *probe = None;
            MonitorState::Connecting
        }
        MonitorState::Connecting => match dial(backend.addr(), ping.timeout).await {
            Ok(stream) => {
                info!(backend_addr = %backend.addr(), "Backend connected");
                *probe = Some(stream);
                MonitorState::Alive
            }
            Err(e) => {
                debug!(backend_addr = %backend.addr(), error = %e, "Cannot dial backend");
                sleep(ping.reconnect_interval).await;
                MonitorState::Disconnected
            }
        },
        MonitorState::Alive => {
            let Some(stream) = probe.as_mut() else {
                return MonitorState::Disconnected;
            };

            match write_probe(stream, ping.timeout).await {
                Ok(latency) => {
                    backend.record_latency(latency);
                    sleep(ping.interval).await;
                    MonitorState::Alive
                }
                Err(e) => {
                    warn!(backend_addr = %backend.addr(), error = %e, "Backend unresponsive");
                    *probe = None;
                    MonitorState::Disconnected
                }
            }
        }
        MonitorState::Stopped => MonitorState::Stopped,
    }
}

async fn dial(addr: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

/// Write one probe byte within `deadline`, returning how long the write took.
async fn write_probe(stream: &mut TcpStream, deadline: Duration) -> io::Result<Duration> {
    let start = Instant::now();
    match timeout(deadline, stream.write_all(PROBE)).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "probe write timeout")),
    }
}
