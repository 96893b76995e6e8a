//! snare
//!
//! Multi-port TCP reverse proxy and honeypot.
//!
//! This service:
//! - Loads endpoint configuration from the file named by SNARE_CONFIG_FILE
//! - Binds one listener per configured port
//! - Captures honeypot traffic or forwards it to the configured target
//! - Drains in-flight sessions on Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snare_proxy::{Config, ListenerManager, TracingLogger, TracingRecorder};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SNARE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting snare");
    info!(
        endpoint_count = config.endpoints.len(),
        listener_count = config.listener_count(),
        buffer_size = config.settings.buffer_size,
        socket_timeout_secs = config.settings.socket_timeout_secs,
        "Configuration loaded"
    );

    let mut manager = ListenerManager::new(config, Arc::new(TracingLogger), Arc::new(TracingRecorder))
        .context("Invalid configuration")?;
    manager.start().await.context("Failed to start listeners")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    let drained = manager.stop().await;
    info!(
        drained,
        pending = manager.pending_connections_count(),
        total = manager.total_connections_count(),
        "Stopped"
    );

    Ok(())
}
