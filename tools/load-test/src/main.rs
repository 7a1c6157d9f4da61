//! Load test
//!
//! Holds many long-lived connections open through a proxy, each sending a
//! small ping on an interval and waiting for its echo. Prints a CSV line per
//! report interval with the number of live connections and the observed
//! round-trip latency. Pair with `waygate-echo-backend` behind the proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PING: &[u8] = b"PING";

#[derive(Debug, Parser)]
#[command(name = "waygate-load-test")]
#[command(about = "Hold concurrent connections through a proxy and report latency")]
struct Args {
    /// Proxy address to connect to.
    #[arg(long, default_value = "127.0.0.1:8000")]
    target_addr: SocketAddr,

    /// Number of concurrent connections.
    #[arg(long, default_value_t = 100)]
    concurrent_conns: usize,

    /// Delay between pings on one connection, in milliseconds. Odd-numbered
    /// connections ping at twice this interval.
    #[arg(long, default_value_t = 1000)]
    ping_interval_ms: u64,

    /// Delay between report lines, in milliseconds.
    #[arg(long, default_value_t = 500)]
    report_interval_ms: u64,

    /// Stop after this many seconds. Runs until Ctrl+C when omitted.
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// Counters shared by all connection tasks.
#[derive(Debug, Default)]
struct LoadStats {
    conns: AtomicUsize,
    pings: AtomicU64,
    last_latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

impl LoadStats {
    fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.pings.fetch_add(1, Ordering::Relaxed);
        self.last_latency_us.store(us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(us, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.concurrent_conns == 0 {
        bail!("--concurrent-conns must be at least 1");
    }

    let stats = Arc::new(LoadStats::default());
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    info!(
        target_addr = %args.target_addr,
        concurrent_conns = args.concurrent_conns,
        "Starting load test"
    );

    for i in 0..args.concurrent_conns {
        let interval = ping_interval(args.ping_interval_ms, i);
        let stats = Arc::clone(&stats);
        let shutdown = shutdown.clone();
        let target = args.target_addr;
        tasks.spawn(async move {
            run_conn(target, interval, &stats, &shutdown)
                .await
                .with_context(|| format!("connection {i} to {target} failed"))
        });
    }

    let start = Instant::now();
    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = tokio::time::interval(Duration::from_millis(args.report_interval_ms.max(1)));
    println!("elapsed_ms,conns,pings,latency_us,max_latency_us");

    let outcome = loop {
        tokio::select! {
            _ = report.tick() => {
                println!(
                    "{},{},{},{},{}",
                    start.elapsed().as_millis(),
                    stats.conns.load(Ordering::Relaxed),
                    stats.pings.load(Ordering::Relaxed),
                    stats.last_latency_us.load(Ordering::Relaxed),
                    stats.max_latency_us.load(Ordering::Relaxed),
                );
            }
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e),
                    Err(e) => break Err(e).context("connection task panicked"),
                }
            }
            _ = &mut deadline => break Ok(()),
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "Load test aborted");
    }
    outcome
}

/// Odd-numbered connections ping at twice the base interval.
fn ping_interval(base_ms: u64, conn: usize) -> Duration {
    let factor = if conn % 2 == 0 { 1 } else { 2 };
    Duration::from_millis(base_ms.saturating_mul(factor))
}

async fn run_conn(
    target: SocketAddr,
    interval: Duration,
    stats: &LoadStats,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut stream = TcpStream::connect(target).await.context("cannot dial target")?;
    stream.set_nodelay(true)?;
    stats.conns.fetch_add(1, Ordering::Relaxed);

    let result = ping_loop(&mut stream, interval, stats, shutdown).await;
    stats.conns.fetch_sub(1, Ordering::Relaxed);
    result
}

async fn ping_loop(
    stream: &mut TcpStream,
    interval: Duration,
    stats: &LoadStats,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut echo = [0u8; PING.len()];
    loop {
        let sent = Instant::now();
        stream.write_all(PING).await.context("cannot write ping")?;
        stream.read_exact(&mut echo).await.context("cannot read echo")?;
        stats.record(sent.elapsed());

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_interval_alternates() {
        assert_eq!(ping_interval(250, 0), Duration::from_millis(250));
        assert_eq!(ping_interval(250, 1), Duration::from_millis(500));
        assert_eq!(ping_interval(250, 4), Duration::from_millis(250));
    }

    #[test]
    fn test_ping_interval_saturates() {
        assert_eq!(ping_interval(u64::MAX, 1), Duration::from_millis(u64::MAX));
    }
}
