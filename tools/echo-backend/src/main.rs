//! Echo backend
//!
//! Accepts TCP connections and writes back everything it reads. An optional
//! greeting is sent first on every connection, which makes it easy to see
//! which backend a proxied connection landed on.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "waygate-echo-backend")]
#[command(about = "TCP echo server for exercising waygate")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8000")]
    addr: SocketAddr,

    /// Greeting written at the start of every connection.
    #[arg(long)]
    greeting: Option<String>,

    /// Read buffer size in bytes.
    #[arg(long, default_value_t = 32 * 1024)]
    buffer_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("Cannot listen on {}", args.addr))?;
    info!(addr = %listener.local_addr()?, "Ready");

    let greeting = args.greeting.map(String::into_bytes);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Cannot accept connection");
                        continue;
                    }
                };
                let greeting = greeting.clone();
                let buffer_size = args.buffer_size;
                tokio::spawn(
                    async move {
                        match echo(stream, greeting.as_deref(), buffer_size).await {
                            Ok(bytes) => debug!(bytes, "Connection closed"),
                            Err(e) => debug!(error = %e, "Connection failed"),
                        }
                    }
                    .instrument(tracing::debug_span!("connection", peer = %peer)),
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn echo(mut stream: TcpStream, greeting: Option<&[u8]>, buffer_size: usize) -> std::io::Result<u64> {
    if let Some(greeting) = greeting {
        stream.write_all(greeting).await?;
    }

    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
