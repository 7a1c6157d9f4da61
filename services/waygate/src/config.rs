//! Proxy configuration.
//!
//! Configuration is a TOML document with global ping defaults and a list of
//! proxies, each with its own backends:
//!
//! ```toml
//! ping_timeout_ms = 10000
//! ping_interval_ms = 1000
//!
//! [[proxies]]
//! name = "web"
//! addr = "0.0.0.0:8000"
//! buffer_size = 32768
//!
//! [[proxies.backends]]
//! addr = "10.0.0.1:8000"
//! ping_interval_ms = 500
//! ```
//!
//! Ping settings resolve backend -> proxy -> global; the first non-zero value wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default probe write timeout.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay between probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default delay between failed probe dials.
pub const DEFAULT_PING_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Default copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Global ping defaults.
    #[serde(flatten)]
    pub ping: PingConfig,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Proxies to run.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ping: PingConfig::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            proxies: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Decode configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Ping overrides present at every configuration level.
///
/// A missing or zero value means "not set here".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PingConfig {
    #[serde(default)]
    pub ping_timeout_ms: Option<u64>,

    #[serde(default)]
    pub ping_interval_ms: Option<u64>,

    #[serde(default)]
    pub ping_reconnect_interval_ms: Option<u64>,
}

/// A single listening proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// Proxy name, used in logs.
    #[serde(default)]
    pub name: String,

    /// Listen address (host:port).
    #[serde(default)]
    pub addr: String,

    /// Copy buffer size per direction; zero selects the default.
    #[serde(default)]
    pub buffer_size: usize,

    /// PEM certificate chain. Enables TLS together with `tls_key`.
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key.
    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(flatten)]
    pub ping: PingConfig,

    /// Backends, in selection order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl ProxyConfig {
    /// Name for logs, falling back to the listen address.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.addr
        } else {
            &self.name
        }
    }

    /// Effective copy buffer size.
    pub fn buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }

    /// TLS material, if the proxy terminates TLS.
    pub fn tls(&self) -> Option<TlsConfig> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }

    /// Check that this proxy can be started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let proxy = self.display_name().to_string();

        if self.addr.trim().is_empty() {
            return Err(ConfigError::MissingListenAddr { proxy });
        }

        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends { proxy });
        }

        if let Some(index) = self.backends.iter().position(|b| b.addr.trim().is_empty()) {
            return Err(ConfigError::MissingBackendAddr { proxy, index });
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(ConfigError::IncompleteTls { proxy });
        }

        Ok(())
    }
}

/// A single backend server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Backend address (host:port).
    pub addr: String,

    #[serde(flatten)]
    pub ping: PingConfig,
}

/// Paths to a PEM certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Fully resolved health-probe timings for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSettings {
    /// Write deadline for a single probe (also bounds the probe dial).
    pub timeout: Duration,
    /// Delay between successful probes.
    pub interval: Duration,
    /// Delay between failed dial attempts.
    pub reconnect_interval: Duration,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PING_TIMEOUT,
            interval: DEFAULT_PING_INTERVAL,
            reconnect_interval: DEFAULT_PING_RECONNECT_INTERVAL,
        }
    }
}

impl PingSettings {
    /// Resolve settings for a backend: backend, then proxy, then global, then built-in default.
    pub fn resolve(backend: &PingConfig, proxy: &PingConfig, global: &PingConfig) -> Self {
        let levels = [backend, proxy, global];
        let pick = |field: fn(&PingConfig) -> Option<u64>, fallback: Duration| {
            levels
                .iter()
                .find_map(|level| field(level).filter(|ms| *ms != 0))
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            timeout: pick(|c| c.ping_timeout_ms, DEFAULT_PING_TIMEOUT),
            interval: pick(|c| c.ping_interval_ms, DEFAULT_PING_INTERVAL),
            reconnect_interval: pick(
                |c| c.ping_reconnect_interval_ms,
                DEFAULT_PING_RECONNECT_INTERVAL,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(timeout: Option<u64>, interval: Option<u64>, reconnect: Option<u64>) -> PingConfig {
        PingConfig {
            ping_timeout_ms: timeout,
            ping_interval_ms: interval,
            ping_reconnect_interval_ms: reconnect,
        }
    }

    #[test]
    fn test_backend_overrides_proxy_overrides_global() {
        let settings = PingSettings::resolve(
            &ping(Some(100), None, None),
            &ping(Some(200), Some(20), None),
            &ping(Some(300), Some(30), Some(3)),
        );

        assert_eq!(settings.timeout, Duration::from_millis(100));
        assert_eq!(settings.interval, Duration::from_millis(20));
        assert_eq!(settings.reconnect_interval, Duration::from_millis(3));
    }

    #[test]
    fn test_zero_falls_through() {
        let settings = PingSettings::resolve(
            &ping(Some(0), Some(0), Some(0)),
            &ping(Some(0), Some(50), None),
            &ping(Some(700), None, Some(0)),
        );

        assert_eq!(settings.timeout, Duration::from_millis(700));
        assert_eq!(settings.interval, Duration::from_millis(50));
        assert_eq!(settings.reconnect_interval, DEFAULT_PING_RECONNECT_INTERVAL);
    }

    #[test]
    fn test_unset_everywhere_uses_defaults() {
        let empty = PingConfig::default();
        assert_eq!(
            PingSettings::resolve(&empty, &empty, &empty),
            PingSettings::default()
        );
    }

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_toml(
            r#"
            ping_timeout_ms = 5000
            log_level = "debug"
            log_format = "json"

            [[proxies]]
            name = "web"
            addr = "127.0.0.1:8000"
            buffer_size = 4096
            ping_interval_ms = 250

            [[proxies.backends]]
            addr = "127.0.0.1:9001"

            [[proxies.backends]]
            addr = "127.0.0.1:9002"
            ping_interval_ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.ping.ping_timeout_ms, Some(5000));

        let proxy = &config.proxies[0];
        assert_eq!(proxy.display_name(), "web");
        assert_eq!(proxy.buffer_size(), 4096);
        assert!(proxy.tls().is_none());
        assert_eq!(proxy.backends.len(), 2);
        proxy.validate().unwrap();

        let first = PingSettings::resolve(&proxy.backends[0].ping, &proxy.ping, &config.ping);
        assert_eq!(first.interval, Duration::from_millis(250));
        assert_eq!(first.timeout, Duration::from_millis(5000));

        let second = PingSettings::resolve(&proxy.backends[1].ping, &proxy.ping, &config.ping);
        assert_eq!(second.interval, Duration::from_millis(100));
    }

    #[test]
    fn test_defaults_for_minimal_document() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.proxies.is_empty());

        let proxy = ProxyConfig::default();
        assert_eq!(proxy.buffer_size(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_validate_rejects_incomplete_proxies() {
        let mut proxy = ProxyConfig {
            name: "db".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            proxy.validate(),
            Err(ConfigError::MissingListenAddr { .. })
        ));

        proxy.addr = "127.0.0.1:5432".to_string();
        assert!(matches!(proxy.validate(), Err(ConfigError::NoBackends { .. })));

        proxy.backends = vec![
            BackendConfig {
                addr: "127.0.0.1:5433".to_string(),
                ..Default::default()
            },
            BackendConfig::default(),
        ];
        assert!(matches!(
            proxy.validate(),
            Err(ConfigError::MissingBackendAddr { index: 1, .. })
        ));

        proxy.backends.pop();
        proxy.tls_cert = Some(PathBuf::from("cert.pem"));
        assert!(matches!(
            proxy.validate(),
            Err(ConfigError::IncompleteTls { .. })
        ));

        proxy.tls_key = Some(PathBuf::from("key.pem"));
        proxy.validate().unwrap();
        assert_eq!(
            proxy.tls(),
            Some(TlsConfig {
                cert: PathBuf::from("cert.pem"),
                key: PathBuf::from("key.pem"),
            })
        );
    }

    #[test]
    fn test_invalid_toml_is_decode_error() {
        let err = Config::from_toml("proxies = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/waygate.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::from_toml(include_str!("../../../config/waygate.example.toml")).unwrap();
        assert_eq!(config.proxies.len(), 2);
        for proxy in &config.proxies {
            proxy.validate().unwrap();
        }
        assert!(config.proxies[1].tls().is_some());

        let web = &config.proxies[0];
        let ping = PingSettings::resolve(&web.backends[1].ping, &web.ping, &config.ping);
        assert_eq!(ping.interval, Duration::from_millis(500));
        assert_eq!(ping.timeout, Duration::from_secs(10));
    }
}
