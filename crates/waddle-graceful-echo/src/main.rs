// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! Waddle graceful echo server.
//!
//! Echoes every byte back to the client. On SIGTERM or SIGINT it stops
//! accepting, waits for open connections and the audit routine to finish,
//! then exits.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use waddle_graceful::{GracefulConfig, GracefulConnection, GracefulServer};

/// Echo server that drains connections before exiting
#[derive(Parser)]
#[command(name = "waddle-graceful-echo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "WADDLE_GRACEFUL_ADDR", default_value = "127.0.0.1:7007")]
    addr: String,

    /// Give up on draining after this many seconds (default: wait forever)
    #[arg(long, env = "WADDLE_DRAIN_TIMEOUT_SECS")]
    drain_timeout_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,waddle_graceful=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

async fn echo(mut conn: GracefulConnection<TcpStream>, peer: SocketAddr) {
    let mut buf = [0u8; 4096];
    let mut total = 0usize;

    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Read failed");
                break;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            warn!(error = %e, "Write failed");
            break;
        }
        total += n;
    }

    if let Err(e) = conn.close().await {
        debug!(error = %e, "Close failed");
    }
    info!(%peer, bytes = total, "Connection finished");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = GracefulConfig::new(cli.addr);
    if let Some(secs) = cli.drain_timeout_secs {
        config = config.with_drain_timeout(Duration::from_secs(secs));
    }

    info!("Waddle graceful echo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let server = GracefulServer::new(config, echo);

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        match handle.trigger_on_os_signal().await {
            Ok(signal) => debug!(?signal, "Shutdown requested"),
            Err(e) => warn!(error = %e, "Failed to install signal handlers"),
        }
    });

    // Uptime audit. The drain waits for its final report.
    let audit = server.shutdown_handle();
    server.run_routine(async move {
        let started = tokio::time::Instant::now();
        audit.wait().await;
        info!(uptime_secs = started.elapsed().as_secs(), "Audit routine finished");
    });

    server
        .listen_and_serve()
        .await
        .context("echo server failed")?;

    info!("Shutdown complete");
    Ok(())
}
