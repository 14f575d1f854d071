use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use common::{
    Bar, BrokerOrder, Clock, Config, Error, ExecutionClient, OrderRequest, OrderSide, OrderType,
    OrderUpdate, Position, Result,
};

use super::{trading_url, DATA_URL};

const BARS_PAGE_LIMIT: u32 = 10_000;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bounds every broker call so a hung request cannot stall an instrument.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for Alpaca's trading and market-data APIs.
///
/// Also owns the order-update broadcast; `TradeUpdateStream` publishes into
/// it via `updates_sender`.
pub struct AlpacaClient {
    key_id: String,
    secret: String,
    trading_url: String,
    data_url: String,
    feed: String,
    http: Client,
    updates_tx: broadcast::Sender<OrderUpdate>,
}

impl AlpacaClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let (updates_tx, _) = broadcast::channel(1024);
        Ok(Self {
            key_id: cfg.api_key_id.clone(),
            secret: cfg.api_secret_key.clone(),
            trading_url: trading_url(cfg.trading_mode).to_string(),
            data_url: DATA_URL.to_string(),
            feed: cfg.data_feed.clone(),
            http,
            updates_tx,
        })
    }

    pub fn updates_sender(&self) -> broadcast::Sender<OrderUpdate> {
        self.updates_tx.clone()
    }

    async fn send(&self, req: RequestBuilder) -> Result<String> {
        let resp = req
            .header("APCA-API-KEY-ID", &self.key_id)
            .header("APCA-API-SECRET-KEY", &self.secret)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(body));
        }
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let body = self.send(self.http.get(url).query(query)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_clock(&self) -> Result<AlpacaClock> {
        self.get_json(&format!("{}/v2/clock", self.trading_url), &[])
            .await
    }

    async fn fetch_bars_since(&self, symbol: &str, start: DateTime<Utc>) -> Result<Vec<Bar>> {
        let url = format!("{}/v2/stocks/{symbol}/bars", self.data_url);
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeframe", "1Min".to_string()),
                ("start", start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("feed", self.feed.clone()),
                ("limit", BARS_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }

            let page: BarsPage = self.get_json(&url, &query).await?;
            bars.extend(
                page.bars
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| b.into_bar(symbol)),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(bars)
    }
}

#[async_trait]
impl ExecutionClient for AlpacaClient {
    async fn submit_order(&self, order: &OrderRequest) -> Result<BrokerOrder> {
        let body = NewOrder::from(order);
        debug!(symbol = %order.symbol, side = %order.side, order_type = %order.order_type, "Submitting order to Alpaca");
        let text = self
            .send(
                self.http
                    .post(format!("{}/v2/orders", self.trading_url))
                    .json(&body),
            )
            .await?;
        let resp: AlpacaOrder = serde_json::from_str(&text)?;
        resp.into_broker_order()
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.send(
            self.http
                .delete(format!("{}/v2/orders/{order_id}", self.trading_url)),
        )
        .await?;
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let url = format!("{}/v2/positions/{symbol}", self.trading_url);
        match self.get_json::<AlpacaPosition>(&url, &[]).await {
            Ok(p) => Ok(Some(Position {
                symbol: p.symbol,
                quantity: parse_num("qty", &p.qty)?,
                avg_entry_price: parse_num("avg_entry_price", &p.avg_entry_price)?,
            })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>> {
        let orders: Vec<AlpacaOrder> = self
            .get_json(
                &format!("{}/v2/orders", self.trading_url),
                &[
                    ("status", "open".to_string()),
                    ("symbols", symbol.to_string()),
                    ("direction", "desc".to_string()),
                    ("limit", "500".to_string()),
                ],
            )
            .await?;
        orders
            .into_iter()
            .map(AlpacaOrder::into_broker_order)
            .collect()
    }

    async fn get_today_bars(&self, symbol: &str) -> Result<Vec<Bar>> {
        let clock = self.fetch_clock().await?;
        let date = clock.timestamp.date_naive();
        let date_param = date.format("%Y-%m-%d").to_string();
        let days: Vec<CalendarDay> = self
            .get_json(
                &format!("{}/v2/calendar", self.trading_url),
                &[("start", date_param.clone()), ("end", date_param)],
            )
            .await?;

        let Some(start) = session_start(clock.timestamp, days.first())? else {
            debug!(symbol = %symbol, "No session today; no bars to load");
            return Ok(Vec::new());
        };
        self.fetch_bars_since(symbol, start).await
    }

    async fn get_clock(&self) -> Result<Clock> {
        Ok(self.fetch_clock().await?.into())
    }

    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.updates_tx.subscribe()
    }
}

/// Today's session open in UTC, or `None` if the market does not trade today
/// or has not opened yet. Calendar times are exchange-local, the same offset
/// the clock reports.
fn session_start(
    now_local: DateTime<FixedOffset>,
    day: Option<&CalendarDay>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(day) = day.filter(|d| d.date == now_local.date_naive()) else {
        return Ok(None);
    };
    let open = NaiveTime::parse_from_str(&day.open, "%H:%M")
        .map_err(|e| Error::Exchange(format!("bad calendar open '{}': {e}", day.open)))?;
    let start = now_local
        .offset()
        .from_local_datetime(&day.date.and_time(open))
        .single()
        .ok_or_else(|| Error::Exchange(format!("ambiguous session open on {}", day.date)))?;
    if start > now_local {
        return Ok(None);
    }
    Ok(Some(start.with_timezone(&Utc)))
}

pub(super) fn parse_num(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| Error::Exchange(format!("bad {field} '{raw}': {e}")))
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct NewOrder<'a> {
    symbol: &'a str,
    qty: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    time_in_force: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
}

impl<'a> From<&'a OrderRequest> for NewOrder<'a> {
    fn from(order: &'a OrderRequest) -> Self {
        Self {
            symbol: &order.symbol,
            qty: order.quantity.to_string(),
            side: order.side,
            order_type: order.order_type,
            time_in_force: "day",
            limit_price: order.limit_price.map(|p| format!("{p:.2}")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct AlpacaOrder {
    id: String,
    symbol: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: String,
    qty: Option<String>,
    #[serde(default)]
    filled_qty: Option<String>,
    limit_price: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl AlpacaOrder {
    pub(super) fn id(&self) -> &str {
        &self.id
    }

    pub(super) fn symbol(&self) -> &str {
        &self.symbol
    }

    pub(super) fn filled_quantity(&self) -> Result<f64> {
        self.filled_qty
            .as_deref()
            .map(|q| parse_num("filled_qty", q))
            .transpose()
            .map(|q| q.unwrap_or(0.0))
    }

    pub(super) fn into_broker_order(self) -> Result<BrokerOrder> {
        let filled_quantity = self.filled_quantity()?;
        let quantity = match self.qty.as_deref() {
            Some(q) => parse_num("qty", q)?,
            None => filled_quantity,
        };
        let limit_price = self
            .limit_price
            .as_deref()
            .map(|p| parse_num("limit_price", p))
            .transpose()?;
        let order_type = if self.order_type == "limit" {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        Ok(BrokerOrder {
            id: self.id,
            symbol: self.symbol,
            side: self.side,
            order_type,
            quantity,
            filled_quantity,
            limit_price,
            submitted_at: self.submitted_at.unwrap_or(self.created_at),
        })
    }
}

#[derive(Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
}

#[derive(Deserialize)]
struct AlpacaClock {
    timestamp: DateTime<FixedOffset>,
    is_open: bool,
    next_open: DateTime<Utc>,
    next_close: DateTime<Utc>,
}

impl From<AlpacaClock> for Clock {
    fn from(c: AlpacaClock) -> Self {
        Clock {
            timestamp: c.timestamp.with_timezone(&Utc),
            is_open: c.is_open,
            next_open: c.next_open,
            next_close: c.next_close,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CalendarDay {
    date: NaiveDate,
    open: String,
}

#[derive(Deserialize)]
struct BarsPage {
    bars: Option<Vec<HistoricalBar>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct HistoricalBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

impl HistoricalBar {
    fn into_bar(self, symbol: &str) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: self.t,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
        }
    }
}
