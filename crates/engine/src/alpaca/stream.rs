use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use common::{Bar, Config, Error, OrderEventKind, OrderUpdate, Result};

use super::rest::AlpacaOrder;
use super::{trading_stream_url, DATA_STREAM};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Alpaca minute-bar WebSocket for the configured symbols.
///
/// Publishes each finalized bar on the market broadcast. Reconnects with
/// exponential backoff; bars missed while disconnected are not replayed.
pub struct AlpacaBarStream {
    url: String,
    key_id: String,
    secret: String,
    symbols: Vec<String>,
    market_tx: broadcast::Sender<Bar>,
}

impl AlpacaBarStream {
    pub fn new(cfg: &Config, market_tx: broadcast::Sender<Bar>) -> Self {
        Self {
            url: format!("{DATA_STREAM}/{}", cfg.data_feed),
            key_id: cfg.api_key_id.clone(),
            secret: cfg.api_secret_key.clone(),
            symbols: cfg.symbols.clone(),
            market_tx,
        }
    }

    /// Run forever, reconnecting on failure. Call inside `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            info!(url = %self.url, symbols = ?self.symbols, "Connecting to Alpaca bar stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!("Bar stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Bar stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let auth = json!({ "action": "auth", "key": self.key_id, "secret": self.secret });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let subscribe = json!({ "action": "subscribe", "bars": self.symbols });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
            let Message::Text(text) = msg else {
                continue;
            };
            let messages = match parse_data_frame(&text) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Failed to parse bar stream frame");
                    continue;
                }
            };
            for message in messages {
                match message {
                    DataMessage::Bar(bar) => {
                        debug!(symbol = %bar.symbol, close = bar.close, "Bar received");
                        // Ignore send errors (no active receivers)
                        let _ = self.market_tx.send(bar);
                    }
                    DataMessage::Control(msg) => info!(message = %msg, "Bar stream control message"),
                    DataMessage::Error { code, msg } => {
                        return Err(Error::WebSocket(format!("stream error {code}: {msg}")));
                    }
                    DataMessage::Other => {}
                }
            }
        }
        Ok(())
    }
}

/// Alpaca `trade_updates` WebSocket. Publishes every order status change
/// on the client's order-update broadcast.
pub struct TradeUpdateStream {
    url: String,
    key_id: String,
    secret: String,
    updates_tx: broadcast::Sender<OrderUpdate>,
}

impl TradeUpdateStream {
    pub fn new(cfg: &Config, updates_tx: broadcast::Sender<OrderUpdate>) -> Self {
        Self {
            url: trading_stream_url(cfg.trading_mode).to_string(),
            key_id: cfg.api_key_id.clone(),
            secret: cfg.api_secret_key.clone(),
            updates_tx,
        }
    }

    /// Run forever, reconnecting on failure. Call inside `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            info!(url = %self.url, "Connecting to Alpaca trade-updates stream");
            match self.connect_once().await {
                Ok(()) => {
                    info!("Trade-updates stream closed cleanly");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "Trade-updates stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(&self.url).map_err(|e| Error::WebSocket(e.to_string()))?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let auth = json!({ "action": "auth", "key": self.key_id, "secret": self.secret });
        write
            .send(Message::Text(auth.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let listen = json!({ "action": "listen", "data": { "streams": ["trade_updates"] } });
        write
            .send(Message::Text(listen.to_string()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
            // Paper endpoints deliver JSON in binary frames.
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                _ => continue,
            };
            let frame = match parse_trade_frame(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to parse trade update");
                    continue;
                }
            };
            match frame {
                TradeFrame::Update(update) => {
                    debug!(symbol = %update.symbol, order_id = %update.order_id, event = %update.event, "Trade update received");
                    let _ = self.updates_tx.send(update);
                }
                TradeFrame::Authorized => info!("Trade-updates stream authorized"),
                TradeFrame::Unauthorized => {
                    return Err(Error::WebSocket("trade-updates authorization failed".into()));
                }
                TradeFrame::Other => {}
            }
        }
        Ok(())
    }
}

// ─── Market-data JSON parsing ────────────────────────────────────────────────

#[derive(Debug)]
enum DataMessage {
    Bar(Bar),
    /// `success` and `subscription` acknowledgements.
    Control(String),
    Error { code: i64, msg: String },
    Other,
}

#[derive(Deserialize)]
struct StreamBar {
    #[serde(rename = "S")]
    symbol: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    t: DateTime<Utc>,
}

/// Data-stream frames are JSON arrays of messages tagged by `T`.
fn parse_data_frame(text: &str) -> Result<Vec<DataMessage>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(text)?;
    values
        .into_iter()
        .map(|value| {
            let tag = value.get("T").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(match tag {
                "b" => {
                    let b: StreamBar = serde_json::from_value(value)?;
                    DataMessage::Bar(Bar {
                        symbol: b.symbol,
                        timestamp: b.t,
                        open: b.o,
                        high: b.h,
                        low: b.l,
                        close: b.c,
                        volume: b.v,
                    })
                }
                "success" | "subscription" => DataMessage::Control(value.to_string()),
                "error" => DataMessage::Error {
                    code: value.get("code").and_then(|v| v.as_i64()).unwrap_or_default(),
                    msg: value
                        .get("msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                _ => DataMessage::Other,
            })
        })
        .collect()
}

// ─── Trade-updates JSON parsing ──────────────────────────────────────────────

#[derive(Debug)]
enum TradeFrame {
    Update(OrderUpdate),
    Authorized,
    Unauthorized,
    Other,
}

#[derive(Deserialize)]
struct TradeEnvelope {
    stream: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct TradeUpdateData {
    event: String,
    price: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    order: AlpacaOrder,
}

fn event_kind(event: &str) -> OrderEventKind {
    match event {
        "new" => OrderEventKind::New,
        "partial_fill" => OrderEventKind::PartialFill,
        "fill" => OrderEventKind::Fill,
        "canceled" => OrderEventKind::Canceled,
        "rejected" => OrderEventKind::Rejected,
        "expired" => OrderEventKind::Expired,
        _ => OrderEventKind::Other,
    }
}

fn parse_trade_frame(text: &str) -> Result<TradeFrame> {
    let envelope: TradeEnvelope = serde_json::from_str(text)?;
    match envelope.stream.as_str() {
        "authorization" => {
            let status = envelope.data.get("status").and_then(|v| v.as_str());
            Ok(if status == Some("authorized") {
                TradeFrame::Authorized
            } else {
                TradeFrame::Unauthorized
            })
        }
        "trade_updates" => {
            let data: TradeUpdateData = serde_json::from_value(envelope.data)?;
            let fill_price = data
                .price
                .as_deref()
                .map(|p| super::rest::parse_num("price", p))
                .transpose()?;
            Ok(TradeFrame::Update(OrderUpdate {
                order_id: data.order.id().to_string(),
                symbol: data.order.symbol().to_string(),
                event: event_kind(&data.event),
                fill_price,
                filled_quantity: data.order.filled_quantity()?,
                timestamp: data.timestamp.unwrap_or_else(Utc::now),
            }))
        }
        _ => Ok(TradeFrame::Other),
    }
}
