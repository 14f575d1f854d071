use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use common::{
    Bar, BrokerOrder, Clock, Error, ExecutionClient, OrderEventKind, OrderRequest, OrderSide,
    OrderType, OrderUpdate, Position, Result,
};

/// In-memory brokerage used to drive the engine deterministically.
///
/// Orders rest in a local book until the test fills them explicitly
/// (`fill`, `partial_fill`, `reject`) or a bar crosses their price
/// (`on_bar`). Every status change is published on the order-update
/// broadcast, exactly like the live trade-updates stream.
pub struct PaperBroker {
    book: RwLock<Book>,
    updates_tx: broadcast::Sender<OrderUpdate>,
}

struct Book {
    clock: Clock,
    orders: HashMap<String, PaperOrder>,
    next_seq: u64,
    cancel_requests: Vec<String>,
    positions: HashMap<String, Position>,
    bars: HashMap<String, Vec<Bar>>,
    failing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Filled,
    Canceled,
    Rejected,
}

struct PaperOrder {
    seq: u64,
    order: BrokerOrder,
    status: Status,
}

impl PaperBroker {
    pub fn new(clock: Clock) -> Self {
        let (updates_tx, _) = broadcast::channel(1024);
        Self {
            book: RwLock::new(Book {
                clock,
                orders: HashMap::new(),
                next_seq: 0,
                cancel_requests: Vec::new(),
                positions: HashMap::new(),
                bars: HashMap::new(),
                failing: false,
            }),
            updates_tx,
        }
    }

    pub async fn set_clock(&self, clock: Clock) {
        self.book.write().await.clock = clock;
    }

    /// Move the reported clock time without changing session bounds.
    pub async fn advance_to(&self, now: DateTime<Utc>) {
        self.book.write().await.clock.timestamp = now;
    }

    /// Make every collaborator call fail until cleared.
    pub async fn set_failing(&self, failing: bool) {
        self.book.write().await.failing = failing;
    }

    pub async fn set_position(&self, symbol: &str, quantity: f64, avg_entry_price: f64) {
        let mut book = self.book.write().await;
        if quantity > 0.0 {
            book.positions.insert(
                symbol.to_string(),
                Position {
                    symbol: symbol.to_string(),
                    quantity,
                    avg_entry_price,
                },
            );
        } else {
            book.positions.remove(symbol);
        }
    }

    /// Place an already-working order in the book, as if left over from a
    /// previous process.
    pub async fn seed_open_order(&self, order: BrokerOrder) {
        let mut book = self.book.write().await;
        let seq = book.bump_seq();
        book.orders.insert(
            order.id.clone(),
            PaperOrder {
                seq,
                order,
                status: Status::Open,
            },
        );
    }

    pub async fn seed_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.book.write().await.bars.insert(symbol.to_string(), bars);
    }

    /// Every order ever submitted through `submit_order`, oldest first.
    pub async fn submitted_orders(&self) -> Vec<BrokerOrder> {
        let book = self.book.read().await;
        let mut orders: Vec<&PaperOrder> = book.orders.values().collect();
        orders.sort_by_key(|o| o.seq);
        orders.into_iter().map(|o| o.order.clone()).collect()
    }

    /// Submitted orders for one symbol and side, oldest first.
    pub async fn submitted(&self, symbol: &str, side: OrderSide) -> Vec<BrokerOrder> {
        self.submitted_orders()
            .await
            .into_iter()
            .filter(|o| o.symbol == symbol && o.side == side)
            .collect()
    }

    /// Order ids passed to `cancel_order`, in call order.
    pub async fn cancel_requests(&self) -> Vec<String> {
        self.book.read().await.cancel_requests.clone()
    }

    /// Fill the remaining quantity of an open order at `price`.
    pub async fn fill(&self, order_id: &str, price: f64) -> Result<OrderUpdate> {
        let mut book = self.book.write().await;
        let remaining = book.open_order(order_id)?.remaining();
        let update = book.execute(order_id, remaining, price)?;
        drop(book);
        let _ = self.updates_tx.send(update.clone());
        Ok(update)
    }

    /// Fill part of an open order at `price`.
    pub async fn partial_fill(&self, order_id: &str, quantity: f64, price: f64) -> Result<OrderUpdate> {
        let mut book = self.book.write().await;
        let remaining = book.open_order(order_id)?.remaining();
        let update = book.execute(order_id, quantity.min(remaining), price)?;
        drop(book);
        let _ = self.updates_tx.send(update.clone());
        Ok(update)
    }

    /// Reject an open order after it was accepted.
    pub async fn reject(&self, order_id: &str) -> Result<OrderUpdate> {
        let mut book = self.book.write().await;
        book.open_order(order_id)?;
        let update = book.close(order_id, Status::Rejected, OrderEventKind::Rejected);
        drop(book);
        let _ = self.updates_tx.send(update.clone());
        Ok(update)
    }

    /// Record a bar and execute every open order for its symbol that the bar
    /// crosses: limit buys at or above the low, limit sells at or below the
    /// high, market orders at the close.
    pub async fn on_bar(&self, bar: &Bar) -> Vec<OrderUpdate> {
        let mut book = self.book.write().await;
        book.bars.entry(bar.symbol.clone()).or_default().push(bar.clone());

        let mut crossing: Vec<(u64, String, f64)> = book
            .orders
            .values()
            .filter(|o| o.status == Status::Open && o.order.symbol == bar.symbol)
            .filter_map(|o| {
                let price = match (o.order.order_type, o.order.side, o.order.limit_price) {
                    (OrderType::Market, _, _) => Some(bar.close),
                    (OrderType::Limit, OrderSide::Buy, Some(limit)) if bar.low <= limit => {
                        Some(limit)
                    }
                    (OrderType::Limit, OrderSide::Sell, Some(limit)) if bar.high >= limit => {
                        Some(limit)
                    }
                    _ => None,
                };
                price.map(|p| (o.seq, o.order.id.clone(), p))
            })
            .collect();
        crossing.sort_by_key(|(seq, _, _)| *seq);

        let mut updates = Vec::new();
        for (_, id, price) in crossing {
            let remaining = match book.orders.get(&id) {
                Some(o) => o.remaining(),
                None => continue,
            };
            if let Ok(update) = book.execute(&id, remaining, price) {
                updates.push(update);
            }
        }
        drop(book);

        for update in &updates {
            let _ = self.updates_tx.send(update.clone());
        }
        updates
    }
}

impl PaperOrder {
    fn remaining(&self) -> f64 {
        self.order.quantity - self.order.filled_quantity
    }
}

impl Book {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn check_available(&self) -> Result<()> {
        if self.failing {
            return Err(Error::Exchange("paper broker unavailable".into()));
        }
        Ok(())
    }

    fn open_order(&self, order_id: &str) -> Result<&PaperOrder> {
        match self.orders.get(order_id) {
            Some(o) if o.status == Status::Open => Ok(o),
            Some(_) => Err(Error::Exchange(format!("order {order_id} is not open"))),
            None => Err(Error::NotFound(format!("order {order_id}"))),
        }
    }

    /// Shares of `symbol` not already committed to working sell orders.
    fn sellable(&self, symbol: &str) -> f64 {
        let held = self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0.0);
        let committed: f64 = self
            .orders
            .values()
            .filter(|o| {
                o.status == Status::Open
                    && o.order.symbol == symbol
                    && o.order.side == OrderSide::Sell
            })
            .map(|o| o.remaining())
            .sum();
        held - committed
    }

    fn execute(&mut self, order_id: &str, quantity: f64, price: f64) -> Result<OrderUpdate> {
        let now = self.clock.timestamp;
        let entry = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| Error::NotFound(format!("order {order_id}")))?;
        entry.order.filled_quantity += quantity;
        let done = entry.order.filled_quantity >= entry.order.quantity - 1e-9;
        if done {
            entry.status = Status::Filled;
        }
        let order = entry.order.clone();

        match order.side {
            OrderSide::Buy => {
                let position = self
                    .positions
                    .entry(order.symbol.clone())
                    .or_insert_with(|| Position {
                        symbol: order.symbol.clone(),
                        quantity: 0.0,
                        avg_entry_price: 0.0,
                    });
                let cost = position.avg_entry_price * position.quantity + price * quantity;
                position.quantity += quantity;
                position.avg_entry_price = cost / position.quantity;
            }
            OrderSide::Sell => {
                if let Some(position) = self.positions.get_mut(&order.symbol) {
                    position.quantity -= quantity;
                    if position.quantity <= 1e-9 {
                        self.positions.remove(&order.symbol);
                    }
                }
            }
        }

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            qty = quantity,
            price = price,
            "Paper execution"
        );

        Ok(OrderUpdate {
            order_id: order.id,
            symbol: order.symbol,
            event: if done {
                OrderEventKind::Fill
            } else {
                OrderEventKind::PartialFill
            },
            fill_price: Some(price),
            filled_quantity: order.filled_quantity,
            timestamp: now,
        })
    }

    fn close(&mut self, order_id: &str, status: Status, event: OrderEventKind) -> OrderUpdate {
        let now = self.clock.timestamp;
        let entry = self.orders.get_mut(order_id);
        let (symbol, filled) = match entry {
            Some(o) => {
                o.status = status;
                (o.order.symbol.clone(), o.order.filled_quantity)
            }
            None => (String::new(), 0.0),
        };
        OrderUpdate {
            order_id: order_id.to_string(),
            symbol,
            event,
            fill_price: None,
            filled_quantity: filled,
            timestamp: now,
        }
    }
}

#[async_trait]
impl ExecutionClient for PaperBroker {
    async fn submit_order(&self, request: &OrderRequest) -> Result<BrokerOrder> {
        let mut book = self.book.write().await;
        book.check_available()?;

        if !(request.quantity > 0.0) {
            return Err(Error::Exchange(format!(
                "invalid quantity {} for {}",
                request.quantity, request.symbol
            )));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Err(Error::Exchange("limit order without limit price".into()));
        }
        if request.side == OrderSide::Sell && request.quantity > book.sellable(&request.symbol) + 1e-9
        {
            return Err(Error::Exchange(format!(
                "insufficient qty available for sell order on {}",
                request.symbol
            )));
        }

        let seq = book.bump_seq();
        let order = BrokerOrder {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            filled_quantity: 0.0,
            limit_price: request.limit_price,
            submitted_at: book.clock.timestamp,
        };
        book.orders.insert(
            order.id.clone(),
            PaperOrder {
                seq,
                order: order.clone(),
                status: Status::Open,
            },
        );
        let now = book.clock.timestamp;
        drop(book);

        debug!(
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            qty = order.quantity,
            "Paper order accepted"
        );
        let _ = self.updates_tx.send(OrderUpdate {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            event: OrderEventKind::New,
            fill_price: None,
            filled_quantity: 0.0,
            timestamp: now,
        });
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut book = self.book.write().await;
        book.check_available()?;
        book.cancel_requests.push(order_id.to_string());
        book.open_order(order_id)?;
        let update = book.close(order_id, Status::Canceled, OrderEventKind::Canceled);
        drop(book);
        let _ = self.updates_tx.send(update);
        Ok(())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let book = self.book.read().await;
        book.check_available()?;
        Ok(book.positions.get(symbol).cloned())
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>> {
        let book = self.book.read().await;
        book.check_available()?;
        let mut open: Vec<&PaperOrder> = book
            .orders
            .values()
            .filter(|o| o.status == Status::Open && o.order.symbol == symbol)
            .collect();
        open.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(open.into_iter().map(|o| o.order.clone()).collect())
    }

    async fn get_today_bars(&self, symbol: &str) -> Result<Vec<Bar>> {
        let book = self.book.read().await;
        book.check_available()?;
        Ok(book.bars.get(symbol).cloned().unwrap_or_default())
    }

    async fn get_clock(&self) -> Result<Clock> {
        let book = self.book.read().await;
        book.check_available()?;
        Ok(book.clock.clone())
    }

    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.updates_tx.subscribe()
    }
}
