pub mod config;
pub mod error;
pub mod proxy;

pub use config::{BackendConfig, Config, LogFormat, PingConfig, PingSettings, ProxyConfig, TlsConfig};
pub use error::{ConfigError, PipeError, ProxyError};
pub use proxy::{
    relay, select_best, Backend, BackendPool, BackendSnapshot, BoxedStream, FrontListener,
    MonitorState, PipeStats, Proxy, ProxyState, ProxyStats,
};
