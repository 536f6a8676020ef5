// =============================================================================
// Reconnecting single-stream WebSocket session
// =============================================================================
//
// Owns one raw stream URL (`.../ws/btcusdt@ticker`).  Frames are normalized
// by the caller's parser and forwarded, tagged, to the owning manager.  The
// loop reconnects with backoff until its cancellation token fires, and the
// socket is closed on the way out.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{ReconnectConfig, ReconnectPolicy};
use super::subscription::{SubscriptionTag, Tagged};
use crate::types::StreamStatus;

/// What a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent<T> {
    Status(StreamStatus),
    Message(T),
}

pub struct StreamSession<T, E, P, W> {
    url: String,
    tag: SubscriptionTag,
    reconnect: ReconnectConfig,
    parse: P,
    wrap: W,
    events: mpsc::Sender<Tagged<E>>,
    cancel: CancellationToken,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T, E, P, W> StreamSession<T, E, P, W>
where
    T: Send + 'static,
    E: Send + 'static,
    P: Fn(&str) -> Result<T> + Send + Sync + 'static,
    W: Fn(SessionEvent<T>) -> E + Send + Sync + 'static,
{
    pub fn new(
        url: String,
        tag: SubscriptionTag,
        reconnect: ReconnectConfig,
        parse: P,
        wrap: W,
        events: mpsc::Sender<Tagged<E>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            url,
            tag,
            reconnect,
            parse,
            wrap,
            events,
            cancel,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn emit(&self, event: SessionEvent<T>) -> bool {
        let tagged = Tagged::new(self.tag.clone(), (self.wrap)(event));
        self.events.send(tagged).await.is_ok()
    }

    pub async fn run(self) {
        let mut policy = ReconnectPolicy::new(self.reconnect);

        loop {
            if self.cancel.is_cancelled() || !self.emit(SessionEvent::Status(StreamStatus::Connecting)).await {
                return;
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = connect_async(self.url.as_str()) => res,
            };

            match connected {
                Ok((ws, _)) => {
                    policy.reset();
                    info!(url = %self.url, tag = %self.tag, "stream connected");
                    if !self.emit(SessionEvent::Status(StreamStatus::Connected)).await {
                        return;
                    }

                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                let _ = write.send(Message::Close(None)).await;
                                debug!(tag = %self.tag, "stream closed on cancel");
                                return;
                            }
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => match (self.parse)(&text) {
                                    Ok(value) => {
                                        if !self.emit(SessionEvent::Message(value)).await {
                                            return;
                                        }
                                    }
                                    Err(e) => warn!(tag = %self.tag, error = %e, "dropping malformed frame"),
                                },
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(frame))) => {
                                    warn!(tag = %self.tag, ?frame, "stream closed by server");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(tag = %self.tag, error = %e, "stream read error");
                                    break;
                                }
                                None => {
                                    warn!(tag = %self.tag, "stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, tag = %self.tag, error = %e, "stream connect failed");
                }
            }

            if !self.emit(SessionEvent::Status(StreamStatus::Disconnected)).await {
                return;
            }

            let delay = policy.next_delay();
            info!(
                tag = %self.tag,
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// `wss://host/ws` + `btcusdt@ticker` -> `wss://host/ws/btcusdt@ticker`.
pub fn stream_url(ws_base_url: &str, stream: &str) -> String {
    format!("{}/{}", ws_base_url.trim_end_matches('/'), stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_joins_cleanly() {
        assert_eq!(
            stream_url("wss://stream.binance.com:9443/ws/", "btcusdt@trade"),
            "wss://stream.binance.com:9443/ws/btcusdt@trade"
        );
    }

    #[tokio::test]
    async fn cancelled_session_exits_without_connecting() {
        let (tx, mut rx) = mpsc::channel::<Tagged<SessionEvent<String>>>(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tag = SubscriptionTag {
            key: "BTCUSDT".into(),
            generation: 1,
        };
        StreamSession::new(
            "ws://127.0.0.1:1/ws".into(),
            tag,
            ReconnectConfig::default(),
            |t: &str| -> Result<String> { Ok(t.to_string()) },
            |e: SessionEvent<String>| e,
            tx,
            cancel,
        )
        .run()
        .await;
        assert!(rx.recv().await.is_none());
    }
}
