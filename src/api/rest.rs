// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Reads return the managers' latest
// consumer outputs; `POST /api/v1/selection` is the only command.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::{AppState, SelectionRequest};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/price", get(price))
        .route("/api/v1/candles", get(candles))
        .route("/api/v1/orderbook", get(orderbook))
        .route("/api/v1/selection", get(current_selection).post(set_selection))
        // ── WebSocket (handled in the ws module but mounted here) ───
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Feed reads
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn price(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.price_feed.snapshot())
}

async fn candles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.candles.snapshot())
}

#[derive(Serialize)]
struct OrderBookResponse {
    #[serde(flatten)]
    snapshot: crate::market_data::OrderBookSnapshot,
    display: Option<crate::app_state::BookDisplay>,
}

async fn orderbook(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.orderbook.snapshot();
    let display = state.book_display(&snapshot);
    Json(OrderBookResponse { snapshot, display })
}

// =============================================================================
// Selection
// =============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn current_selection(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.selection())
}

async fn set_selection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SelectionRequest>,
) -> impl IntoResponse {
    match state.select(req).await {
        Ok(selection) => Json(selection).into_response(),
        Err(e) => {
            warn!(error = %e, "selection rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("{e:#}"),
                }),
            )
                .into_response()
        }
    }
}
