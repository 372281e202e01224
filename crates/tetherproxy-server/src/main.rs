//! # tetherproxy-server
//!
//! Runs the hotspot proxy and its HTTP API until shut down.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package tetherproxy-server
//!
//! # Custom configuration
//! TETHERPROXY_CONFIG=./config.toml ./tetherproxy-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tetherproxy_core::proxy::mark_foreground_thread;
use tetherproxy_core::Config;
use tetherproxy_server::state::AppState;
use tetherproxy_server::{daemon, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Config::default_path()?;
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    logging::init(config.server.production)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting tetherproxy-server"
    );

    if !mark_foreground_thread() {
        warn!("Foreground thread was already registered");
    }

    let api_addr = SocketAddr::new(config.server.bind_host, config.server.api_port);
    let listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding API on {api_addr}"))?;
    info!(%api_addr, "API listening");

    let state = AppState::new(config).with_config_path(config_path).shared();
    daemon::run(state, listener, shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Cannot install signal handlers; use POST /api/shutdown");
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C; use POST /api/shutdown");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, initiating shutdown");
    }
}
