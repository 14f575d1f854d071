//! Startup reconciliation against the broker.
//!
//! A restart must resume each symbol where the previous process left it:
//! never buy again while holding shares, never add a second sell for a
//! position that is already protected.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use tracing::{info, warn};

use common::{Bar, BrokerOrder, ExecutionClient, OrderSide, Position, Result};
use strategy::SignalEvaluator;

use crate::algo::{AlgoConfig, InstrumentAlgo};
use crate::state::{ActiveOrder, AlgoState, InstrumentState};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// What the broker reports for one symbol at startup.
#[derive(Debug, Clone, Default)]
pub struct BrokerSnapshot {
    pub position: Option<Position>,
    /// Newest first.
    pub open_orders: Vec<BrokerOrder>,
    pub bars: Vec<Bar>,
}

/// Derived starting point for one symbol.
#[derive(Debug, Clone)]
pub struct Recovered {
    pub state: InstrumentState,
    /// Extra open orders that must be canceled so only one stays active.
    pub stray_orders: Vec<String>,
}

/// Map a broker snapshot onto an initial `InstrumentState`.
pub fn derive_state(symbol: &str, snapshot: BrokerSnapshot) -> Recovered {
    let mut state = InstrumentState::new(symbol);
    state.bars = snapshot.bars;

    if let Some(position) = snapshot.position.filter(|p| p.quantity > 0.0) {
        state.held_quantity = position.quantity;
        state.entry_price = Some(position.avg_entry_price);
    }

    let mut orders = snapshot.open_orders.into_iter();
    let adopted = orders.next();
    let stray_orders: Vec<String> = orders.map(|o| o.id).collect();

    match adopted {
        Some(order) if order.side == OrderSide::Buy => {
            if state.holds_position() {
                info!(
                    symbol = %symbol,
                    held = state.held_quantity,
                    "Open buy with shares held; treating as partially filled"
                );
            }
            state.submitted_at = Some(order.submitted_at);
            state.active_order = Some(ActiveOrder::from(&order));
            state.state = AlgoState::BuySubmitted;
        }
        Some(order) => {
            if !state.holds_position() {
                warn!(symbol = %symbol, order_id = %order.id, "Open sell without a position");
            }
            state.active_order = Some(ActiveOrder::from(&order));
            state.state = AlgoState::SellSubmitted;
        }
        None if state.holds_position() => state.state = AlgoState::ToSell,
        None => state.state = AlgoState::ToBuy,
    }

    Recovered {
        state,
        stray_orders,
    }
}

/// Builds the fleet's initial algos from the broker's view of each symbol.
pub struct RecoveryBootstrap {
    client: Arc<dyn ExecutionClient>,
    evaluator: Arc<dyn SignalEvaluator>,
    config: AlgoConfig,
    attempts: u32,
    initial_backoff: Duration,
}

impl RecoveryBootstrap {
    pub fn new(
        client: Arc<dyn ExecutionClient>,
        evaluator: Arc<dyn SignalEvaluator>,
        config: AlgoConfig,
        attempts: u32,
    ) -> Self {
        Self {
            client,
            evaluator,
            config,
            attempts: attempts.max(1),
            initial_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    /// Recover every symbol concurrently. Fails if any symbol cannot be read.
    pub async fn recover_fleet(&self, symbols: &[String]) -> Result<Vec<InstrumentAlgo>> {
        try_join_all(symbols.iter().map(|s| self.recover(s))).await
    }

    pub async fn recover(&self, symbol: &str) -> Result<InstrumentAlgo> {
        let snapshot = self.fetch_with_retry(symbol).await?;
        let Recovered {
            state,
            stray_orders,
        } = derive_state(symbol, snapshot);

        for order_id in &stray_orders {
            info!(symbol = %symbol, order_id = %order_id, "Canceling extra open order");
            if let Err(e) = self.client.cancel_order(order_id).await {
                warn!(symbol = %symbol, order_id = %order_id, error = %e, "Cancel of extra order failed");
            }
        }

        info!(
            symbol = %symbol,
            state = %state.state,
            held = state.held_quantity,
            bars = state.bars.len(),
            "Recovered instrument"
        );

        let resume_sell = state.state == AlgoState::ToSell;
        let mut algo = InstrumentAlgo::from_state(
            state,
            self.evaluator.clone(),
            self.client.clone(),
            self.config.clone(),
        );
        if resume_sell {
            algo.submit_sell().await;
        }
        Ok(algo)
    }

    async fn fetch_snapshot(&self, symbol: &str) -> Result<BrokerSnapshot> {
        let (position, open_orders, bars) = tokio::try_join!(
            self.client.get_position(symbol),
            self.client.get_open_orders(symbol),
            self.client.get_today_bars(symbol),
        )?;
        Ok(BrokerSnapshot {
            position,
            open_orders,
            bars,
        })
    }

    async fn fetch_with_retry(&self, symbol: &str) -> Result<BrokerSnapshot> {
        let mut delay = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.fetch_snapshot(symbol).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < self.attempts => {
                    warn!(
                        symbol = %symbol,
                        attempt = attempt,
                        error = %e,
                        "Snapshot fetch failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bar, clock_at, closed, flat_then_up, test_config};
    use common::{OrderEventKind, OrderType};
    use paper::PaperBroker;
    use strategy::SmaCrossover;

    fn bootstrap(broker: Arc<PaperBroker>) -> RecoveryBootstrap {
        RecoveryBootstrap::new(
            broker,
            Arc::new(SmaCrossover::default()),
            test_config(1_000.0),
            2,
        )
        .with_backoff(Duration::from_millis(1))
    }

    fn open_order(id: &str, side: OrderSide, minute: i64) -> BrokerOrder {
        BrokerOrder {
            id: id.to_string(),
            symbol: "TSLA".to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: 100.0,
            filled_quantity: 0.0,
            limit_price: Some(100.0),
            submitted_at: clock_at(minute).timestamp,
        }
    }

    #[tokio::test]
    async fn held_position_without_order_gets_one_sell() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.set_position("TSLA", 100.0, 50.0).await;

        let mut algo = bootstrap(broker.clone()).recover("TSLA").await.unwrap();
        assert_eq!(algo.state().state, AlgoState::SellSubmitted);
        assert_eq!(algo.state().entry_price, Some(50.0));

        let sells = broker.submitted("TSLA", OrderSide::Sell).await;
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].quantity, 100.0);

        // A buy signal after recovery must not add to the position.
        for (i, c) in flat_then_up(49.0, 50.0).into_iter().enumerate() {
            algo.on_bar(bar("TSLA", i as i64, c)).await;
        }
        assert!(broker.submitted("TSLA", OrderSide::Buy).await.is_empty());
    }

    #[tokio::test]
    async fn open_buy_is_adopted() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        let buy = open_order("b-1", OrderSide::Buy, 58);
        broker.seed_open_order(buy.clone()).await;

        let algo = bootstrap(broker.clone()).recover("TSLA").await.unwrap();
        assert_eq!(algo.state().state, AlgoState::BuySubmitted);
        assert_eq!(algo.state().submitted_at, Some(buy.submitted_at));
        assert_eq!(algo.state().active_order.as_ref().unwrap().id, "b-1");
        assert_eq!(broker.submitted_orders().await.len(), 1);
    }

    #[tokio::test]
    async fn partly_filled_buy_is_protected_once_canceled() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.set_position("TSLA", 4.0, 100.0).await;
        let mut buy = open_order("b-1", OrderSide::Buy, 58);
        buy.filled_quantity = 4.0;
        broker.seed_open_order(buy).await;

        let mut algo = bootstrap(broker.clone()).recover("TSLA").await.unwrap();
        assert_eq!(algo.state().state, AlgoState::BuySubmitted);
        assert_eq!(algo.state().held_quantity, 4.0);
        assert!(broker.submitted("TSLA", OrderSide::Sell).await.is_empty());

        algo.check_expiry(clock_at(61).timestamp).await;
        assert_eq!(broker.cancel_requests().await, vec!["b-1".to_string()]);

        let canceled = closed("b-1", "TSLA", OrderEventKind::Canceled, 4.0);
        algo.on_order_update(&canceled).await;
        assert_eq!(algo.state().state, AlgoState::SellSubmitted);
        let sells = broker.submitted("TSLA", OrderSide::Sell).await;
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].quantity, 4.0);
    }

    #[tokio::test]
    async fn protected_position_is_left_alone() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.set_position("TSLA", 100.0, 100.0).await;
        broker.seed_open_order(open_order("s-1", OrderSide::Sell, 40)).await;

        let algo = bootstrap(broker.clone()).recover("TSLA").await.unwrap();
        assert_eq!(algo.state().state, AlgoState::SellSubmitted);
        assert_eq!(broker.submitted_orders().await.len(), 1);
        assert!(broker.cancel_requests().await.is_empty());
    }

    #[tokio::test]
    async fn newest_of_several_open_orders_wins() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.seed_open_order(open_order("old", OrderSide::Buy, 10)).await;
        broker.seed_open_order(open_order("new", OrderSide::Buy, 50)).await;

        let algo = bootstrap(broker.clone()).recover("TSLA").await.unwrap();
        assert_eq!(algo.state().active_order.as_ref().unwrap().id, "new");
        assert_eq!(broker.cancel_requests().await, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn flat_symbol_starts_in_to_buy_with_history() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker
            .seed_bars("TSLA", vec![bar("TSLA", 0, 100.0), bar("TSLA", 1, 101.0)])
            .await;

        let algos = bootstrap(broker.clone())
            .recover_fleet(&["TSLA".to_string(), "AAPL".to_string()])
            .await
            .unwrap();
        assert_eq!(algos.len(), 2);
        assert_eq!(algos[0].state().state, AlgoState::ToBuy);
        assert_eq!(algos[0].state().bars.len(), 2);
        assert!(algos[1].state().bars.is_empty());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_startup() {
        let broker = Arc::new(PaperBroker::new(clock_at(60)));
        broker.set_failing(true).await;
        assert!(bootstrap(broker).recover("TSLA").await.is_err());
    }

    #[test]
    fn open_sell_without_position_is_still_tracked() {
        let snapshot = BrokerSnapshot {
            position: None,
            open_orders: vec![open_order("s-1", OrderSide::Sell, 30)],
            bars: Vec::new(),
        };
        let recovered = derive_state("TSLA", snapshot);
        assert_eq!(recovered.state.state, AlgoState::SellSubmitted);
        assert!(recovered.state.is_consistent());
        assert!(recovered.stray_orders.is_empty());
    }
}
