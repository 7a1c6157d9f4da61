//! waygate
//!
//! TCP load balancer.
//!
//! This service:
//! - Loads proxy definitions from a TOML file
//! - Monitors every backend with a one-byte probe connection
//! - Routes each accepted connection to the least-loaded healthy backend
//! - Closes all listeners and stops monitors on SIGINT/SIGTERM

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use waygate::{Config, LogFormat, Proxy};

/// How long to wait for accept loops to exit after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// TCP load balancer routing to the least-loaded healthy backend.
#[derive(Debug, Parser)]
#[command(name = "waygate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, env = "WAYGATE_CONFIG", default_value = "/etc/waygate/config.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, env = "WAYGATE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Cannot get configuration from {:?}", args.config))?;

    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    init_tracing(&log_level, config.log_format);

    info!(
        config = %args.config.display(),
        proxy_count = config.proxies.len(),
        "Starting waygate"
    );

    let shutdown = CancellationToken::new();
    let mut proxies = Vec::new();
    let mut accept_loops = JoinSet::new();

    for proxy_config in &config.proxies {
        match Proxy::bind(proxy_config, &config.ping, &shutdown).await {
            Ok(proxy) => {
                let proxy = Arc::new(proxy);
                proxies.push(Arc::clone(&proxy));
                accept_loops.spawn(async move { proxy.run().await });
            }
            Err(e) => {
                error!(
                    proxy = %proxy_config.display_name(),
                    error = %e,
                    "Cannot create proxy"
                );
            }
        }
    }

    if proxies.is_empty() {
        bail!("no proxy could be started");
    }

    tokio::select! {
        _ = shutdown_signal() => info!("Received shutdown signal"),
        _ = wait_all(&mut accept_loops) => warn!("All proxies exited"),
    }

    for proxy in &proxies {
        proxy.close();
    }
    shutdown.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, wait_all(&mut accept_loops))
        .await
        .is_err()
    {
        warn!("Accept loops did not exit in time");
    }

    info!("waygate shutdown complete");
    Ok(())
}

fn init_tracing(level: &str, format: LogFormat) {
    // Prefer RUST_LOG, fall back to the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn wait_all(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Proxy task panicked");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
