// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CID Relay CLI
//!
//! Store-and-forward relay between alarm panels and a central
//! monitoring host.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port, forward to the monitoring host
//! cid-relay --upstream-host 10.32.1.49 --upstream-port 20004
//!
//! # Custom panel port and config file
//! cid-relay --port 20105 --config relay.json
//!
//! # Verbose logging
//! cid-relay --log-level debug
//! ```

use clap::Parser;
use cid_relay::{RelayConfig, RelayServer};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// CID Relay - store-and-forward relay for alarm panel telemetry
#[derive(Parser, Debug)]
#[command(name = "cid-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port panels connect to
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long)]
    bind: Option<String>,

    /// Monitoring host to forward frames to
    #[arg(long)]
    upstream_host: Option<String>,

    /// Monitoring host TCP port
    #[arg(long)]
    upstream_port: Option<u16>,

    /// Forward queue capacity (messages)
    #[arg(long)]
    queue_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config, then layer CLI flags over it
    let mut config = if let Some(config_path) = &args.config {
        info!("Loading config from {:?}", config_path);
        RelayConfig::from_file(config_path)?
    } else {
        RelayConfig::default()
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind.parse()?;
    }
    if let Some(host) = args.upstream_host {
        config.upstream_host = host;
    }
    if let Some(port) = args.upstream_port {
        config.upstream_port = port;
    }
    if let Some(size) = args.queue_size {
        config.queue_size = size;
    }

    info!("+----------------------------------------------------+");
    info!(
        "|       CID Relay v{}                             |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Panels:   {:38} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!(
        "|  Upstream: {:38} |",
        format!("{}:{}", config.upstream_host, config.upstream_port)
    );
    info!(
        "|  Queue:    {:38} |",
        format!("{} messages", config.queue_size)
    );
    info!(
        "|  Backoff:  {:38} |",
        format!(
            "{}s..{}s",
            config.reconnect_initial_secs, config.reconnect_max_secs
        )
    );
    info!("+----------------------------------------------------+");

    let server = RelayServer::new(config)?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping relay...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Relay stopped");
    Ok(())
}

/// Wait for ctrl-c or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
