//! Main Entrypoint for the Bidi Relay Service
//!
//! Loads configuration, reports which backends are usable, builds the router
//! and serves until Ctrl+C.

use anyhow::Context;
use bidi_api::{
    bootstrap::{Backend, BackendFactory, ModelFactory},
    config::Config,
    router::create_router,
    state::AppState,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Outbound TLS for the backend WebSockets and Bedrock.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed.");
    }

    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Checking available models...");

    let models = Arc::new(BackendFactory::new(config.clone()));
    let availability = models.availability();
    for backend in Backend::ALL {
        if availability.is_available(backend) {
            info!("✓ {} available", backend);
        } else {
            info!("✗ {} unavailable (requires {})", backend, backend.credential_hint());
        }
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        models,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    info!(
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
