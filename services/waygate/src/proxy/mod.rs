//! L4 TCP load balancing.
//!
//! This module provides:
//! - Backend health monitoring with a persistent one-byte probe connection
//! - Least-connections backend selection with latency tie-breaks
//! - Plain and TLS-terminating front listeners
//! - Full-duplex connection piping
//!
//! ## Architecture
//!
//! ```text
//! Client -> FrontListener -> Proxy accept loop -> BackendPool::select -> Backend::pipe -> Backend
//!                                                        ^
//!                                          health monitor (one per backend)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use waygate::{Config, Proxy};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load("waygate.toml")?;
//! let shutdown = CancellationToken::new();
//! let proxy = Proxy::bind(&config.proxies[0], &config.ping, &shutdown).await?;
//! proxy.run().await;
//! ```

mod backend;
mod listener;
mod monitor;
mod pipe;
mod pool;
mod server;

pub use backend::{Backend, BackendSnapshot, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{BoxedStream, FrontListener, FrontStream, Upgrader};
pub use monitor::{MonitorState, PROBE};
pub use pipe::{relay, PipeStats};
pub use pool::{select_best, BackendPool};
pub use server::{Proxy, ProxyState, ProxyStats};
