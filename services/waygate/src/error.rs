//! Error types for configuration, proxy startup and piping.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for the expected schema.
    #[error("cannot decode configuration: {0}")]
    Decode(#[from] toml::de::Error),

    /// A proxy entry is missing its listen address.
    #[error("proxy '{proxy}' has no listen address")]
    MissingListenAddr { proxy: String },

    /// A proxy entry has no backends.
    #[error("proxy '{proxy}' has no backends")]
    NoBackends { proxy: String },

    /// A backend entry is missing its address.
    #[error("proxy '{proxy}' backend #{index} has no address")]
    MissingBackendAddr { proxy: String, index: usize },

    /// Only one half of the TLS key pair was configured.
    #[error("proxy '{proxy}' must set both tls_cert and tls_key")]
    IncompleteTls { proxy: String },
}

/// Errors that stop a single proxy instance.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The proxy configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The listen socket could not be bound.
    #[error("cannot bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded.
    #[error("cannot load TLS material: {0}")]
    Tls(String),
}

/// Errors from relaying a single connection.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The backend could not be dialed.
    #[error("cannot dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The front-side TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// Copying bytes between the two peers failed.
    #[error("cannot copy: {0}")]
    Copy(#[source] io::Error),
}

impl PipeError {
    /// Returns true for the normal ways a byte stream ends.
    ///
    /// Resets, broken pipes, already-closed sockets and truncated TLS streams
    /// are how peers hang up and are never worth reporting.
    pub fn is_benign(&self) -> bool {
        match self {
            PipeError::Copy(e) | PipeError::Handshake(e) => is_benign_io(e),
            PipeError::Dial { .. } => false,
        }
    }
}

/// Classify an I/O error as a normal stream termination.
pub fn is_benign_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
