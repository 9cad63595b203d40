//! Trade-updates push channel.
//!
//! Authenticates against the broker's streaming endpoint, listens on the
//! `trade_updates` stream, and forwards order events over an mpsc channel.
//! The connection is re-established forever with a fixed backoff; the
//! engine treats the stream purely as a latency optimization over the
//! reconciler's polling.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use trade_core::Result;

/// Seconds between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// One order event from the `trade_updates` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeUpdate {
    /// Stream event name (`new`, `fill`, `canceled`, …).
    pub event: Option<String>,
    pub order_id: String,
    pub status: Option<String>,
}

/// Streaming client for broker trade updates.
pub struct TradeStream {
    ws_url: String,
    key: String,
    secret: String,
}

impl TradeStream {
    pub fn new(base_url: &str, key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url_from_base(base_url),
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// Start the stream task and return the event receiver. The task keeps
    /// reconnecting until the receiver is dropped.
    pub fn subscribe(self) -> mpsc::Receiver<TradeUpdate> {
        let (tx, rx) = mpsc::channel(1000);

        tokio::spawn(async move {
            info!(url = %self.ws_url, "trade-updates stream starting");
            loop {
                match self.run_connection(&tx).await {
                    Ok(()) => info!("trade-updates stream closed"),
                    Err(e) => error!(error = %e, "trade-updates stream error"),
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        });

        rx
    }

    async fn run_connection(&self, tx: &mpsc::Sender<TradeUpdate>) -> Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        let auth_msg = json!({
            "action": "auth",
            "key": self.key,
            "secret": self.secret,
        });
        write.send(Message::Text(auth_msg.to_string())).await?;

        let listen_msg = json!({
            "action": "listen",
            "data": { "streams": ["trade_updates"] },
        });
        write.send(Message::Text(listen_msg.to_string())).await?;

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(update) = parse_stream_message(&text) {
                        if tx.send(update).await.is_err() {
                            warn!("trade-update receiver dropped, closing stream");
                            return Ok(());
                        }
                    }
                }
                Ok(Message::Ping(data)) => {
                    write.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => {
                    info!("trade-updates stream closed by server");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
                _ => {}
            }
        }

        Ok(())
    }
}

/// Derive the streaming endpoint from the REST base URL:
/// `https://paper-api.alpaca.markets` → `wss://paper-api.alpaca.markets/stream`.
fn ws_url_from_base(base_url: &str) -> String {
    let host = base_url
        .trim()
        .strip_prefix("https://")
        .or_else(|| base_url.trim().strip_prefix("http://"))
        .unwrap_or(base_url.trim())
        .trim_end_matches('/');
    format!("wss://{host}/stream")
}

/// Pull a [`TradeUpdate`] out of a raw stream frame, if it is one.
fn parse_stream_message(text: &str) -> Option<TradeUpdate> {
    let frame: StreamFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, raw = truncate(text, 500), "unparseable stream frame");
            return None;
        }
    };

    match frame.stream.as_deref() {
        Some("authorization") => {
            info!(data = %frame.data, "stream authorization");
            None
        }
        Some("listening") => {
            info!(data = %frame.data, "stream listening");
            None
        }
        Some("trade_updates") => {
            let payload: TradeUpdatePayload = match serde_json::from_value(frame.data) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "trade-update payload parse error");
                    return None;
                }
            };
            let Some(order) = payload.order else {
                error!("trade-update event without an order");
                return None;
            };
            let Some(order_id) = order.id else {
                error!("trade-update order without an id");
                return None;
            };
            Some(TradeUpdate {
                event: payload.event,
                order_id,
                status: order.status,
            })
        }
        other => {
            debug!(stream = ?other, "ignoring unknown stream");
            None
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TradeUpdatePayload {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    order: Option<OrderRef>,
}

#[derive(Debug, Deserialize)]
struct OrderRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}
