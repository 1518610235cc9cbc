use anyhow::{Context, Result};
use pulse::config::{self, PulseConfig};
use pulse::forward::SinkForwarder;
use pulse::relay::{create_relay_router, RelayHub};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=info".into()),
        )
        .init();

    info!("Pulse relay starting...");

    // Load configuration, falling back to defaults when the file is absent
    let config_path = std::env::var("PULSE_CONFIG").unwrap_or_else(|_| "pulse.toml".to_string());
    let config = config::load_config(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Using default configuration");
        PulseConfig::default()
    });

    info!(
        host = %config.server.host,
        port = config.server.port,
        feed_path = %config.server.feed_path,
        sink_enabled = config.sink.enabled,
        "Configuration loaded"
    );

    let forwarder = if config.sink.enabled {
        info!(url = %config.sink.url, "Sink forwarding enabled");
        Some(SinkForwarder::new(&config.sink)?)
    } else {
        info!("Sink forwarding disabled");
        None
    };

    let hub = Arc::new(RelayHub::new(config.relay.fan_out_buffer, forwarder));
    let router = create_relay_router(Arc::clone(&hub), &config.server);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .context("Failed to bind relay port")?;
    info!(port = config.server.port, "Relay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Relay server error")?;

    info!("Relay stopped");
    Ok(())
}

/// Resolves when ctrl_c arrives. The server then stops accepting peers and
/// lets in-flight connections drain.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
        return;
    }
    info!("Shutdown signal received");
}
