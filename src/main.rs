// =============================================================================
// market-feed: Main Entry Point
// =============================================================================
//
// Starts the price, candle and order-book managers on the configured default
// selection and serves their outputs over HTTP and a push WebSocket.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use market_feed::api;
use market_feed::app_state::{AppState, SelectionRequest};
use market_feed::runtime_config::FeedConfig;

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              market-feed: Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = FeedConfig::load_or_default(CONFIG_PATH);
    config.apply_env();

    let initial_symbol = config.initial_symbol()?;
    let initial_interval = config.default_interval;
    let bind_addr = config.bind_addr.clone();

    info!(
        symbol = %initial_symbol,
        interval = %initial_interval,
        rest = %config.rest_base_url,
        ws = %config.ws_base_url,
        "feed configuration"
    );

    // ── 2. Build shared state (spawns the managers) ──────────────────────
    let state = Arc::new(AppState::new(config)?);

    // ── 3. Initial selection ─────────────────────────────────────────────
    state
        .select(SelectionRequest {
            symbol: Some(initial_symbol.exchange_symbol().to_string()),
            interval: Some(initial_interval.to_string()),
        })
        .await
        .context("failed to apply initial selection")?;

    // ── 4. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::router(state.clone());
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    server.abort();
    state.shutdown().await;

    info!("market-feed stopped");
    Ok(())
}
