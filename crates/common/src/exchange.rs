use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Bar, BrokerOrder, Clock, OrderRequest, OrderUpdate, Position, Result};

/// Abstraction over the brokerage connection.
///
/// `AlpacaClient` implements this for paper and live trading.
/// `PaperBroker` implements this in memory for tests.
///
/// Each `InstrumentAlgo` holds an `Arc<dyn ExecutionClient>`; all calls are
/// safe to issue concurrently from many instrument tasks.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submit an order and return the broker's acknowledgement.
    async fn submit_order(&self, order: &OrderRequest) -> Result<BrokerOrder>;

    /// Request cancellation. Confirmation arrives as an `OrderUpdate`.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Current holding for a symbol, `None` when flat.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    /// Orders still working for a symbol, newest first.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>>;

    /// Minute bars for the current session so far, oldest first.
    async fn get_today_bars(&self, symbol: &str) -> Result<Vec<Bar>>;

    async fn get_clock(&self) -> Result<Clock>;

    /// Subscribe to order-status notifications for every symbol.
    fn subscribe_order_updates(&self) -> broadcast::Receiver<OrderUpdate>;
}
