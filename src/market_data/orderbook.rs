// =============================================================================
// Order Book Stream Manager: best bid/ask over one multiplexed connection
// =============================================================================
//
// A single long-lived socket carries `<symbol>@bookTicker` subscriptions.
// Only one symbol is ever subscribed: a switch sends UNSUBSCRIBE for the old
// stream before SUBSCRIBE for the new one.  Intent recorded while the socket
// is down is applied once it connects, and a newer intent replaces an older
// unsent one.  After a reconnect the desired subscription is restored.
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::{ReconnectConfig, ReconnectPolicy};
use super::wire::{parse_book, OrderBookTop};
use crate::types::{StreamStatus, SymbolSpec};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

// ---------------------------------------------------------------------------
// Subscription reconciliation
// ---------------------------------------------------------------------------

/// Control frame to send on the shared connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookCommand {
    Subscribe(String),
    Unsubscribe(String),
}

impl BookCommand {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Subscribe(s) | Self::Unsubscribe(s) => s,
        }
    }

    /// `{"method":"SUBSCRIBE","params":["btcusdt@bookTicker"],"id":7}`
    pub fn to_frame(&self, id: u64) -> String {
        let method = match self {
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
        };
        let stream = format!("{}@bookTicker", self.symbol().to_ascii_lowercase());
        json!({ "method": method, "params": [stream], "id": id }).to_string()
    }
}

/// Tracks what the user wants against what the server currently has.
#[derive(Debug, Default)]
pub struct SubscriptionReconciler {
    desired: Option<String>,
    active: Option<String>,
    connected: bool,
}

impl SubscriptionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn desired(&self) -> Option<&str> {
        self.desired.as_deref()
    }

    /// Symbol the server is subscribed to on the current connection.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Record new intent.  Commands come back only while connected; otherwise
    /// the intent waits for `on_connected`.
    pub fn reconcile(&mut self, desired: Option<String>) -> Vec<BookCommand> {
        self.desired = desired;
        if !self.connected {
            return Vec::new();
        }
        self.sync()
    }

    /// A fresh connection has no subscriptions; replay the desired one.
    pub fn on_connected(&mut self) -> Vec<BookCommand> {
        self.connected = true;
        self.active = None;
        self.sync()
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.active = None;
    }

    /// Drop the intent; returns the unsubscribe to send if connected.
    pub fn teardown(&mut self) -> Vec<BookCommand> {
        self.reconcile(None)
    }

    fn sync(&mut self) -> Vec<BookCommand> {
        if self.active == self.desired {
            return Vec::new();
        }
        let mut cmds = Vec::with_capacity(2);
        if let Some(old) = self.active.take() {
            cmds.push(BookCommand::Unsubscribe(old));
        }
        if let Some(new) = self.desired.clone() {
            cmds.push(BookCommand::Subscribe(new.clone()));
            self.active = Some(new);
        }
        cmds
    }
}

// ---------------------------------------------------------------------------
// Core state (no I/O)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub data: Option<OrderBookTop>,
    pub status: StreamStatus,
    pub error: Option<String>,
    pub active_symbol: Option<String>,
    pub spread_bps: Option<f64>,
}

impl Default for OrderBookSnapshot {
    fn default() -> Self {
        Self {
            data: None,
            status: StreamStatus::Idle,
            error: None,
            active_symbol: None,
            spread_bps: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderBookCore {
    reconciler: SubscriptionReconciler,
    snapshot: OrderBookSnapshot,
}

impl OrderBookCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> &OrderBookSnapshot {
        &self.snapshot
    }

    pub fn reconciler(&self) -> &SubscriptionReconciler {
        &self.reconciler
    }

    pub fn set_symbol(&mut self, symbol: Option<String>) -> Vec<BookCommand> {
        let symbol = symbol.map(|s| s.to_ascii_uppercase());
        if symbol.as_deref() != self.reconciler.desired() {
            // The previous symbol's book must not be shown as the new one.
            self.snapshot.data = None;
            self.snapshot.spread_bps = None;
        }
        let cmds = self.reconciler.reconcile(symbol);
        self.sync_active();
        cmds
    }

    pub fn on_connecting(&mut self) {
        if self.snapshot.status != StreamStatus::Connected {
            self.snapshot.status = StreamStatus::Connecting;
        }
    }

    pub fn on_connected(&mut self) -> Vec<BookCommand> {
        let cmds = self.reconciler.on_connected();
        self.snapshot.status = StreamStatus::Connected;
        self.snapshot.error = None;
        self.sync_active();
        cmds
    }

    /// Transport lost.  The last book stays visible.
    pub fn on_disconnected(&mut self, error: Option<String>) {
        self.reconciler.on_disconnected();
        self.snapshot.status = StreamStatus::Disconnected;
        if error.is_some() {
            self.snapshot.error = error;
        }
        self.sync_active();
    }

    /// Accept a book update only for the subscribed symbol.
    pub fn on_book(&mut self, top: OrderBookTop) -> bool {
        if self.reconciler.active() != Some(top.symbol.as_str()) {
            trace!(symbol = %top.symbol, "book update for inactive symbol dropped");
            return false;
        }
        self.snapshot.spread_bps = spread_bps(&top);
        self.snapshot.data = Some(top);
        true
    }

    pub fn teardown(&mut self) -> Vec<BookCommand> {
        let cmds = self.reconciler.teardown();
        self.snapshot = OrderBookSnapshot {
            status: if self.reconciler.is_connected() {
                StreamStatus::Connected
            } else {
                self.snapshot.status
            },
            ..OrderBookSnapshot::default()
        };
        cmds
    }

    fn sync_active(&mut self) {
        self.snapshot.active_symbol = self.reconciler.active().map(str::to_string);
    }
}

/// `(ask - bid) / mid` in basis points.
pub fn spread_bps(top: &OrderBookTop) -> Option<f64> {
    let mid = (top.bid.price + top.ask.price) / 2.0;
    (mid > 0.0).then(|| top.spread() / mid * 10_000.0)
}

// ---------------------------------------------------------------------------
// Actor shell
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderBookSettings {
    /// Multiplexed endpoint, e.g. `wss://stream.binance.com:9443/ws`.
    pub ws_base_url: String,
    pub reconnect: ReconnectConfig,
}

enum BookRequest {
    SetSymbol(Option<String>),
    Shutdown(oneshot::Sender<()>),
}

enum Flow {
    Continue,
    Stop,
}

/// Handle to the order-book actor.  Dropping it closes the connection.
pub struct OrderBookStreamManager {
    cmd_tx: mpsc::Sender<BookRequest>,
    snapshot_rx: watch::Receiver<OrderBookSnapshot>,
    root: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OrderBookStreamManager {
    pub fn spawn(settings: OrderBookSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (out, snapshot_rx) = watch::channel(OrderBookSnapshot::default());
        let root = CancellationToken::new();

        let actor = BookActor {
            settings,
            core: OrderBookCore::new(),
            cmd_rx,
            out,
            next_id: 1,
            root: root.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            cmd_tx,
            snapshot_rx,
            root,
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn set_symbol(&self, symbol: &SymbolSpec) -> Result<()> {
        self.send(BookRequest::SetSymbol(Some(symbol.exchange_symbol().to_string())))
            .await
    }

    /// Unsubscribe without selecting another symbol.
    pub async fn clear(&self) -> Result<()> {
        self.send(BookRequest::SetSymbol(None)).await
    }

    async fn send(&self, req: BookRequest) -> Result<()> {
        self.cmd_tx
            .send(req)
            .await
            .ok()
            .context("order book manager has stopped")
    }

    pub fn subscribe(&self) -> watch::Receiver<OrderBookSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Unsubscribe, close the socket and wait for the actor to exit.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(BookRequest::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        self.root.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for OrderBookStreamManager {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

struct BookActor {
    settings: OrderBookSettings,
    core: OrderBookCore,
    cmd_rx: mpsc::Receiver<BookRequest>,
    out: watch::Sender<OrderBookSnapshot>,
    next_id: u64,
    root: CancellationToken,
}

impl BookActor {
    async fn run(mut self) {
        let mut policy = ReconnectPolicy::new(self.settings.reconnect);
        let url = self.settings.ws_base_url.clone();

        loop {
            self.core.on_connecting();
            self.publish();

            let connect = connect_async(url.as_str());
            tokio::pin!(connect);
            let connected = loop {
                tokio::select! {
                    _ = self.root.cancelled() => {
                        self.stop_offline(None);
                        return;
                    }
                    cmd = self.cmd_rx.recv() => {
                        if let Flow::Stop = self.handle_offline(cmd) {
                            return;
                        }
                    }
                    res = &mut connect => break res,
                }
            };

            match connected {
                Ok((ws, _)) => {
                    policy.reset();
                    info!(url = %url, "order book connection open");
                    if let Flow::Stop = self.run_connected(ws).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "order book connect failed");
                    self.core.on_disconnected(Some(format!("connect failed: {e}")));
                    self.publish();
                }
            }

            let delay = policy.next_delay();
            info!(
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis() as u64,
                "order book reconnecting"
            );
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.root.cancelled() => {
                        self.stop_offline(None);
                        return;
                    }
                    cmd = self.cmd_rx.recv() => {
                        if let Flow::Stop = self.handle_offline(cmd) {
                            return;
                        }
                    }
                    _ = &mut sleep => break,
                }
            }
        }
    }

    /// Requests while no socket is open only update intent.
    fn handle_offline(&mut self, req: Option<BookRequest>) -> Flow {
        match req {
            Some(BookRequest::SetSymbol(symbol)) => {
                debug!(symbol = ?symbol, "order book intent deferred until connected");
                self.core.set_symbol(symbol);
                self.publish();
                Flow::Continue
            }
            Some(BookRequest::Shutdown(ack)) => {
                self.stop_offline(Some(ack));
                Flow::Stop
            }
            None => {
                self.stop_offline(None);
                Flow::Stop
            }
        }
    }

    fn stop_offline(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.core.teardown();
        self.publish();
        info!("order book manager stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    async fn run_connected(&mut self, ws: WsStream) -> Flow {
        let (mut write, mut read) = ws.split();

        let cmds = self.core.on_connected();
        self.publish();
        if let Err(e) = self.send_commands(&mut write, cmds).await {
            return self.lost(e.to_string());
        }

        loop {
            tokio::select! {
                _ = self.root.cancelled() => {
                    self.stop_connected(&mut write, None).await;
                    return Flow::Stop;
                }
                req = self.cmd_rx.recv() => match req {
                    Some(BookRequest::SetSymbol(symbol)) => {
                        let cmds = self.core.set_symbol(symbol);
                        self.publish();
                        if let Err(e) = self.send_commands(&mut write, cmds).await {
                            return self.lost(e.to_string());
                        }
                    }
                    Some(BookRequest::Shutdown(ack)) => {
                        self.stop_connected(&mut write, Some(ack)).await;
                        return Flow::Stop;
                    }
                    None => {
                        self.stop_connected(&mut write, None).await;
                        return Flow::Stop;
                    }
                },
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_frame(&text),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(?frame, "order book connection closed by server");
                        return self.lost("connection closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "order book read error");
                        return self.lost(e.to_string());
                    }
                    None => return self.lost("connection ended".to_string()),
                }
            }
        }
    }

    async fn send_commands(&mut self, write: &mut WsSink, cmds: Vec<BookCommand>) -> Result<()> {
        for cmd in cmds {
            let id = self.next_id;
            self.next_id += 1;
            debug!(?cmd, id, "order book control frame");
            write
                .send(Message::Text(cmd.to_frame(id)))
                .await
                .with_context(|| format!("failed to send {cmd:?}"))?;
        }
        Ok(())
    }

    async fn stop_connected(&mut self, write: &mut WsSink, ack: Option<oneshot::Sender<()>>) {
        let cmds = self.core.teardown();
        if let Err(e) = self.send_commands(write, cmds).await {
            debug!(error = %e, "unsubscribe on shutdown failed");
        }
        let _ = write.send(Message::Close(None)).await;
        self.core.on_disconnected(None);
        self.publish();
        info!("order book manager stopped");
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn lost(&mut self, reason: String) -> Flow {
        self.core.on_disconnected(Some(reason));
        self.publish();
        Flow::Continue
    }

    fn on_frame(&mut self, text: &str) {
        match parse_book(text, Utc::now().timestamp_millis()) {
            Ok(Some(top)) => {
                if self.core.on_book(top) {
                    self.publish();
                }
            }
            Ok(None) => trace!("control frame acknowledged"),
            Err(e) => warn!(error = %e, "dropping order book frame"),
        }
    }

    fn publish(&self) {
        self.out.send_replace(self.core.snapshot().clone());
    }
}
