//! mmrelay web server - Twilio webhook receiver.
//!
//! This binary:
//! - Optionally resolves client addresses behind trusted reverse proxies
//! - Verifies Twilio request signatures
//! - Relays voicemail and SMS notifications to the mailer
//!
//! TLS is expected to be terminated in front of this process.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mmrelay::{router, AppState, Config, LogMailer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        bind_local = config.bind_local,
        twilio_auth_configured = config.twilio_auth_token.is_some(),
        public_scheme = %config.public_scheme,
        public_host = ?config.public_host,
        proxy_fix = config.proxy_fix,
        proxy_fix_num_proxies = config.proxy_fix_num_proxies,
        max_body_bytes = config.max_body_bytes,
        request_timeout_ms = config.request_timeout_ms,
        "config_loaded"
    );

    let addr = if config.bind_local {
        SocketAddr::from((Ipv6Addr::LOCALHOST, config.port))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))
    };

    let app = router(AppState::new(config, LogMailer));

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Peer addresses are needed by the proxy resolver and handlers
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
