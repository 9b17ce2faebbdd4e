//! Gwproxy - Entry Point
//!
//! Starts the upstream link, the pending-request sweeper, and the downstream
//! proxy server with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod proxy;

use config::ProxyConfigManager;
use proxy::auth::ConnectionAuthenticator;
use proxy::router::{MessageRouter, PENDING_REQUEST_TTL};
use proxy::server::ProxyServer;
use proxy::upstream::UpstreamLink;

/// Default location of the persisted configuration file
const DEFAULT_CONFIG_PATH: &str = "/etc/gwproxy/gwproxy.conf";

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gwproxy=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gwproxy");

    // Load configuration
    let config_path =
        std::env::var("GWPROXY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ProxyConfigManager::new(&config_path).read_config()?;
    let upstream_url = config.upstream_url()?;
    info!("Configuration loaded from {}", config_path);

    // Shared components
    let authenticator = ConnectionAuthenticator::new(config.token.clone());
    let router = Arc::new(MessageRouter::new());
    let upstream = UpstreamLink::new(upstream_url);

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start the upstream link
    let upstream_task = tokio::spawn(
        upstream
            .clone()
            .run(router.clone(), shutdown_tx.subscribe()),
    );

    // Start the pending-request sweeper
    let sweeper_task = tokio::spawn(
        router
            .clone()
            .run_sweeper(PENDING_REQUEST_TTL, shutdown_tx.subscribe()),
    );

    // Start the proxy server
    let server = ProxyServer::new(config.clone(), authenticator, router, upstream);
    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!(
        "Gwproxy started - listening on {}, upstream {}",
        config.bind_addr(),
        config.upstream
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(server_task, upstream_task, sweeper_task);

    info!("Gwproxy stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
