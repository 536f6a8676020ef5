// =============================================================================
// WebSocket Handler: push-based feed updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. An immediate combined FeedSnapshot on connect.
//   2. A fresh snapshot whenever any manager publishes a new output or the
//      selection changes, coalesced to at most one push per
//      `MIN_PUSH_INTERVAL`.
//
// Ping frames are answered with Pong; a Close frame or receive error ends the
// connection.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

const MIN_PUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Polls for selection changes, which have no watch channel of their own.
const SELECTION_POLL: Duration = Duration::from_millis(500);

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut price_rx = state.price_feed.subscribe();
    let mut candle_rx = state.candles.subscribe();
    let mut book_rx = state.orderbook.subscribe();
    price_rx.mark_unchanged();
    candle_rx.mark_unchanged();
    book_rx.mark_unchanged();

    let mut sequence: u64 = 0;
    if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
        warn!(error = %e, "failed to send initial WebSocket snapshot");
        return;
    }
    let mut last_sent_version = state.current_state_version();

    let mut dirty = false;
    let mut push_tick = interval(MIN_PUSH_INTERVAL);
    push_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut selection_poll = interval(SELECTION_POLL);

    loop {
        tokio::select! {
            // ── Feed changes mark the connection dirty ──────────────────
            res = price_rx.changed() => {
                if res.is_err() { break; }
                dirty = true;
            }
            res = candle_rx.changed() => {
                if res.is_err() { break; }
                dirty = true;
            }
            res = book_rx.changed() => {
                if res.is_err() { break; }
                dirty = true;
            }
            _ = selection_poll.tick() => {
                if state.current_state_version() != last_sent_version {
                    dirty = true;
                }
            }

            // ── Coalesced push ─────────────────────────────────────────
            _ = push_tick.tick(), if dirty => {
                let version = state.current_state_version();
                if let Err(e) = send_snapshot(&mut sender, &state, &mut sequence).await {
                    debug!(error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
                last_sent_version = version;
                dirty = false;
            }

            // ── Inbound frames ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!(sent = sequence, "WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

/// Serialize and send the current FeedSnapshot.
async fn send_snapshot<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    sequence: &mut u64,
) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    state.ws_sequence_number.fetch_add(1, Ordering::Relaxed);
    *sequence += 1;

    let snapshot = state.build_snapshot();

    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(
                version = snapshot.state_version,
                seq = *sequence,
                "WebSocket snapshot sent"
            );
            Ok(())
        }
        Err(e) => {
            // Serialisation errors are not network errors; keep the socket.
            warn!(error = %e, "failed to serialize snapshot");
            Ok(())
        }
    }
}
