use chrono::{DateTime, Utc};
use tracing::info;

use common::{Bar, BrokerOrder, OrderSide, OrderType};

/// Lifecycle phase of one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoState {
    ToBuy,
    BuySubmitted,
    ToSell,
    SellSubmitted,
}

impl std::fmt::Display for AlgoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgoState::ToBuy => write!(f, "TO_BUY"),
            AlgoState::BuySubmitted => write!(f, "BUY_SUBMITTED"),
            AlgoState::ToSell => write!(f, "TO_SELL"),
            AlgoState::SellSubmitted => write!(f, "SELL_SUBMITTED"),
        }
    }
}

/// The one order an instrument may have working at the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveOrder {
    pub id: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub filled_quantity: f64,
    /// Set once a cancel was accepted; confirmation arrives as an update.
    pub cancel_requested: bool,
    /// The last cancel attempt was refused by the broker.
    pub cancel_failed: bool,
    /// Sweep ticks since the order was placed, last audited, or a cancel
    /// was accepted.
    pub idle_ticks: u32,
}

impl From<&BrokerOrder> for ActiveOrder {
    fn from(order: &BrokerOrder) -> Self {
        Self {
            id: order.id.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            filled_quantity: order.filled_quantity,
            cancel_requested: false,
            cancel_failed: false,
            idle_ticks: 0,
        }
    }
}

/// Everything the engine knows about one symbol.
///
/// `active_order` is `Some` exactly when `state` is `BuySubmitted` or
/// `SellSubmitted`. `entry_price` is `Some` while shares are held.
#[derive(Debug, Clone)]
pub struct InstrumentState {
    pub symbol: String,
    pub state: AlgoState,
    /// Session bars in arrival order. Append-only.
    pub bars: Vec<Bar>,
    pub active_order: Option<ActiveOrder>,
    pub entry_price: Option<f64>,
    pub held_quantity: f64,
    /// Submission time of the working buy.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Exit with market orders until flat.
    pub force_exit: bool,
    /// Set by liquidation; no more buys this session.
    pub session_closing: bool,
}

impl InstrumentState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: AlgoState::ToBuy,
            bars: Vec::new(),
            active_order: None,
            entry_price: None,
            held_quantity: 0.0,
            submitted_at: None,
            force_exit: false,
            session_closing: false,
        }
    }

    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    pub fn holds_position(&self) -> bool {
        self.held_quantity > 0.0
    }

    /// True when the active-order invariant holds for the current state.
    pub fn is_consistent(&self) -> bool {
        let expects_order = matches!(
            self.state,
            AlgoState::BuySubmitted | AlgoState::SellSubmitted
        );
        expects_order == self.active_order.is_some()
    }

    pub(crate) fn transition(&mut self, to: AlgoState) {
        if self.state != to {
            info!(symbol = %self.symbol, from = %self.state, to = %to, "State transition");
            self.state = to;
        }
    }

    /// Forget the position after it was sold or found flat.
    pub(crate) fn clear_position(&mut self) {
        self.held_quantity = 0.0;
        self.entry_price = None;
        self.force_exit = false;
    }

    /// Add shares bought at `price`, keeping `entry_price` volume-weighted.
    pub(crate) fn add_shares(&mut self, quantity: f64, price: f64) {
        if quantity <= 0.0 {
            return;
        }
        let cost = self.entry_price.unwrap_or(price) * self.held_quantity + price * quantity;
        self.held_quantity += quantity;
        self.entry_price = Some(cost / self.held_quantity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_flat_and_consistent() {
        let state = InstrumentState::new("TSLA");
        assert_eq!(state.state, AlgoState::ToBuy);
        assert!(!state.holds_position());
        assert!(state.is_consistent());
    }

    #[test]
    fn add_shares_weights_entry_price() {
        let mut state = InstrumentState::new("TSLA");
        state.add_shares(10.0, 100.0);
        state.add_shares(10.0, 110.0);
        assert_eq!(state.held_quantity, 20.0);
        assert!((state.entry_price.unwrap() - 105.0).abs() < 1e-9);
    }

    #[test]
    fn working_state_without_order_is_inconsistent() {
        let mut state = InstrumentState::new("TSLA");
        state.state = AlgoState::SellSubmitted;
        assert!(!state.is_consistent());
    }
}
