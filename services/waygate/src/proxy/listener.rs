//! Front-side listeners.
//!
//! A listener accepts plain TCP connections. When TLS material is configured
//! the accepted stream is wrapped with a TLS acceptor before piping. The
//! handshake runs in the connection task, so accepting never waits on a
//! client handshake.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use super::backend::DEFAULT_CONNECT_TIMEOUT;
use crate::config::TlsConfig;
use crate::error::ProxyError;

/// Byte stream accepted from a client, plain or TLS.
pub trait FrontStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FrontStream for T {}

/// Boxed front-side stream.
pub type BoxedStream = Box<dyn FrontStream>;

/// A bound front listener.
pub struct FrontListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl FrontListener {
    /// Bind `addr`, terminating TLS when `tls` is given.
    pub async fn bind(addr: &str, tls: Option<&TlsConfig>) -> Result<Self, ProxyError> {
        let tls = tls
            .map(|cfg| load_server_config(cfg).map(TlsAcceptor::from))
            .transpose()?;

        let bind_error = |source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(bind_addr = %local_addr, tls = tls.is_some(), "Listener bound");

        Ok(Self {
            listener,
            tls,
            handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Set how long a client gets to complete the TLS handshake.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Whether accepted connections are TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next raw connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Handle used to finish accepting a connection off the accept loop.
    pub fn upgrader(&self) -> Upgrader {
        Upgrader {
            tls: self.tls.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }
}

/// Turns a raw accepted socket into a front stream.
#[derive(Clone)]
pub struct Upgrader {
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl Upgrader {
    /// Complete the TLS handshake if required.
    ///
    /// A client that does not finish the handshake within the handshake
    /// timeout gets a `TimedOut` error.
    pub async fn upgrade(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        let _ = stream.set_nodelay(true);
        let Some(acceptor) = &self.tls else {
            return Ok(Box::new(stream));
        };

        match timeout(self.handshake_timeout, acceptor.accept(stream)).await {
            Ok(accepted) => Ok(Box::new(accepted?)),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "tls handshake timeout")),
        }
    }
}

/// Build a rustls server config from PEM files.
fn load_server_config(cfg: &TlsConfig) -> Result<Arc<ServerConfig>, ProxyError> {
    let certs = load_certs(&cfg.cert)?;
    let key = load_key(&cfg.key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("invalid certificate or key: {e}")))?;

    Ok(Arc::new(config))
}

fn open(path: &Path) -> Result<BufReader<File>, ProxyError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProxyError::Tls(format!("cannot open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("cannot parse {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| ProxyError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}
