use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::{
    Bar, Config, ExecutionClient, OrderEventKind, OrderRequest, OrderSide, OrderType, OrderUpdate,
};
use risk::{lot_quantity, protective_limit, ExitRules, RiskConfig};
use strategy::SignalEvaluator;

use crate::state::{ActiveOrder, AlgoState, InstrumentState};

/// Sweep ticks to wait for a cancel confirmation before asking the broker.
const CANCEL_CONFIRM_TICKS: u32 = 2;
/// Sweep ticks after which any working order is checked against the broker.
const AUDIT_TICKS: u32 = 10;

/// Trading parameters shared by every instrument.
#[derive(Debug, Clone)]
pub struct AlgoConfig {
    /// USD notional per buy.
    pub lot_notional: f64,
    /// Age after which a working buy is canceled.
    pub buy_timeout: Duration,
    pub risk: RiskConfig,
}

impl AlgoConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            lot_notional: cfg.lot_notional,
            buy_timeout: cfg.buy_timeout,
            risk: RiskConfig::from(cfg),
        }
    }
}

/// Messages delivered to an instrument's task, processed one at a time.
#[derive(Debug, Clone)]
pub enum AlgoCommand {
    Bar(Bar),
    OrderUpdate(OrderUpdate),
    /// Sweep tick: cancel a stale buy, retry a missing protective sell.
    CheckExpiry { now: DateTime<Utc> },
    /// Session close is near: exit everything, stop buying.
    Liquidate,
}

/// Behavior around one `InstrumentState`.
///
/// Owned by exactly one task; every event for the symbol arrives through
/// that task's inbox, so state is never touched concurrently.
pub struct InstrumentAlgo {
    state: InstrumentState,
    evaluator: Arc<dyn SignalEvaluator>,
    client: Arc<dyn ExecutionClient>,
    config: AlgoConfig,
    exits: ExitRules,
}

impl InstrumentAlgo {
    pub fn new(
        symbol: impl Into<String>,
        evaluator: Arc<dyn SignalEvaluator>,
        client: Arc<dyn ExecutionClient>,
        config: AlgoConfig,
    ) -> Self {
        Self::from_state(InstrumentState::new(symbol), evaluator, client, config)
    }

    pub fn from_state(
        state: InstrumentState,
        evaluator: Arc<dyn SignalEvaluator>,
        client: Arc<dyn ExecutionClient>,
        config: AlgoConfig,
    ) -> Self {
        let exits = ExitRules::new(config.risk.clone());
        Self {
            state,
            evaluator,
            client,
            config,
            exits,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.state.symbol
    }

    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    /// Process commands until every sender is dropped.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<AlgoCommand>) {
        info!(
            symbol = %self.state.symbol,
            state = %self.state.state,
            evaluator = %self.evaluator.name(),
            "Instrument algo running"
        );
        while let Some(cmd) = inbox.recv().await {
            self.handle(cmd).await;
        }
        info!(
            symbol = %self.state.symbol,
            state = %self.state.state,
            held = self.state.held_quantity,
            "Instrument algo stopped"
        );
    }

    pub async fn handle(&mut self, cmd: AlgoCommand) {
        match cmd {
            AlgoCommand::Bar(bar) => self.on_bar(bar).await,
            AlgoCommand::OrderUpdate(update) => self.on_order_update(&update).await,
            AlgoCommand::CheckExpiry { now } => self.check_expiry(now).await,
            AlgoCommand::Liquidate => self.liquidate().await,
        }
    }

    // ── Market data ──────────────────────────────────────────────────────────

    pub async fn on_bar(&mut self, bar: Bar) {
        if bar.symbol != self.state.symbol {
            warn!(symbol = %self.state.symbol, bar_symbol = %bar.symbol, "Bar for another symbol ignored");
            return;
        }
        if self
            .state
            .bars
            .last()
            .is_some_and(|last| last.timestamp >= bar.timestamp)
        {
            debug!(symbol = %self.state.symbol, timestamp = %bar.timestamp, "Stale or duplicate bar skipped");
            return;
        }
        let close = bar.close;
        self.state.bars.push(bar);

        if matches!(self.state.state, AlgoState::ToSell | AlgoState::SellSubmitted)
            && !self.state.force_exit
        {
            if let Some(entry) = self.state.entry_price {
                if let Some(trigger) = self.exits.check(entry, close) {
                    info!(
                        symbol = %self.state.symbol,
                        trigger = %trigger,
                        entry = entry,
                        price = close,
                        "Exit threshold crossed"
                    );
                    self.force_exit().await;
                    return;
                }
            }
        }

        match self.state.state {
            AlgoState::ToBuy => self.consider_buy(close).await,
            AlgoState::ToSell => self.resume_sell().await,
            AlgoState::BuySubmitted | AlgoState::SellSubmitted => {
                debug!(symbol = %self.state.symbol, state = %self.state.state, "Order working; bar recorded");
            }
        }
    }

    async fn consider_buy(&mut self, close: f64) {
        if self.state.session_closing {
            info!(symbol = %self.state.symbol, "Buy signal check skipped: session closing");
            return;
        }
        if !self.evaluator.evaluate(&self.state.bars) {
            return;
        }

        let Some(quantity) = lot_quantity(self.config.lot_notional, close) else {
            info!(
                symbol = %self.state.symbol,
                lot = self.config.lot_notional,
                price = close,
                "Buy signal skipped: lot buys less than one share"
            );
            return;
        };

        info!(symbol = %self.state.symbol, price = close, qty = quantity, "Buy signal");
        let request = OrderRequest::limit(&self.state.symbol, OrderSide::Buy, quantity, close);
        match self.client.submit_order(&request).await {
            Ok(order) => {
                info!(
                    symbol = %self.state.symbol,
                    order_id = %order.id,
                    qty = quantity,
                    limit = close,
                    "Buy submitted"
                );
                self.state.submitted_at = Some(order.submitted_at);
                self.state.active_order = Some(ActiveOrder::from(&order));
                self.state.transition(AlgoState::BuySubmitted);
            }
            Err(e) => {
                warn!(symbol = %self.state.symbol, error = %e, "Buy submission failed");
            }
        }
    }

    // ── Order updates ────────────────────────────────────────────────────────

    pub async fn on_order_update(&mut self, update: &OrderUpdate) {
        let matches_active = self
            .state
            .active_order
            .as_ref()
            .is_some_and(|a| a.id == update.order_id);

        if !matches_active {
            match update.event {
                OrderEventKind::New | OrderEventKind::Other => {
                    debug!(symbol = %self.state.symbol, order_id = %update.order_id, event = %update.event, "Untracked order update");
                }
                _ => warn!(
                    symbol = %self.state.symbol,
                    order_id = %update.order_id,
                    event = %update.event,
                    state = %self.state.state,
                    "Order update does not match the active order; ignored"
                ),
            }
            return;
        }

        match update.event {
            OrderEventKind::New | OrderEventKind::Other => {
                debug!(symbol = %self.state.symbol, order_id = %update.order_id, event = %update.event, "Order acknowledged");
            }
            OrderEventKind::PartialFill => self.on_partial_fill(update),
            OrderEventKind::Fill => self.on_fill(update).await,
            OrderEventKind::Canceled | OrderEventKind::Rejected | OrderEventKind::Expired => {
                self.on_order_closed(update).await
            }
        }
    }

    /// Record newly executed shares on the active order; returns the delta.
    fn apply_execution(&mut self, update: &OrderUpdate) -> f64 {
        let Some(active) = self.state.active_order.as_mut() else {
            return 0.0;
        };
        let cumulative = if update.event == OrderEventKind::Fill && update.filled_quantity <= 0.0 {
            active.quantity
        } else {
            update.filled_quantity
        };
        let delta = (cumulative - active.filled_quantity).max(0.0);
        active.filled_quantity = cumulative.max(active.filled_quantity);
        let side = active.side;
        let price = update
            .fill_price
            .or(self.state.entry_price)
            .or_else(|| self.state.last_close())
            .unwrap_or(0.0);

        match side {
            OrderSide::Buy => self.state.add_shares(delta, price),
            OrderSide::Sell => {
                self.state.held_quantity = (self.state.held_quantity - delta).max(0.0);
            }
        }
        delta
    }

    fn on_partial_fill(&mut self, update: &OrderUpdate) {
        let delta = self.apply_execution(update);
        info!(
            symbol = %self.state.symbol,
            order_id = %update.order_id,
            qty = delta,
            price = ?update.fill_price,
            held = self.state.held_quantity,
            "Partial fill"
        );
    }

    async fn on_fill(&mut self, update: &OrderUpdate) {
        self.apply_execution(update);
        self.state.active_order = None;

        match self.state.state {
            AlgoState::BuySubmitted => {
                self.state.submitted_at = None;
                info!(
                    symbol = %self.state.symbol,
                    entry = ?self.state.entry_price,
                    qty = self.state.held_quantity,
                    "Buy filled"
                );
                self.state.transition(AlgoState::ToSell);
                self.submit_sell().await;
            }
            AlgoState::SellSubmitted => {
                info!(
                    symbol = %self.state.symbol,
                    price = ?update.fill_price,
                    entry = ?self.state.entry_price,
                    "Position closed"
                );
                self.state.clear_position();
                self.state.transition(AlgoState::ToBuy);
            }
            other => {
                warn!(symbol = %self.state.symbol, state = %other, "Fill in unexpected state");
            }
        }
    }

    async fn on_order_closed(&mut self, update: &OrderUpdate) {
        self.apply_execution(update);
        self.state.active_order = None;
        if update.event == OrderEventKind::Rejected {
            warn!(symbol = %self.state.symbol, order_id = %update.order_id, state = %self.state.state, "Order rejected");
        } else {
            info!(symbol = %self.state.symbol, order_id = %update.order_id, event = %update.event, "Order closed without fill");
        }

        match self.state.state {
            AlgoState::BuySubmitted => {
                self.state.submitted_at = None;
                if self.state.holds_position() {
                    self.state.transition(AlgoState::ToSell);
                    self.submit_sell().await;
                } else {
                    self.state.clear_position();
                    self.state.transition(AlgoState::ToBuy);
                }
            }
            AlgoState::SellSubmitted => {
                self.state.transition(AlgoState::ToSell);
                self.resume_sell().await;
            }
            other => {
                warn!(symbol = %self.state.symbol, state = %other, "Order closed in unexpected state");
            }
        }
    }

    // ── Supervision ──────────────────────────────────────────────────────────

    pub async fn check_expiry(&mut self, now: DateTime<Utc>) {
        if self.audit_due() && !self.reconcile_with_broker().await {
            return;
        }

        match self.state.state {
            AlgoState::BuySubmitted => {
                let Some(submitted_at) = self.state.submitted_at else {
                    return;
                };
                let age = (now - submitted_at).to_std().unwrap_or_default();
                if age > self.config.buy_timeout {
                    info!(
                        symbol = %self.state.symbol,
                        age_secs = age.as_secs(),
                        "Buy order expired"
                    );
                    self.request_cancel("buy timeout").await;
                }
            }
            AlgoState::ToSell => self.resume_sell().await,
            AlgoState::ToBuy | AlgoState::SellSubmitted => {}
        }
    }

    /// Exit the position and stop buying for the rest of the session.
    pub async fn liquidate(&mut self) {
        if !self.state.session_closing {
            info!(
                symbol = %self.state.symbol,
                state = %self.state.state,
                held = self.state.held_quantity,
                "Liquidating for session close"
            );
            self.state.session_closing = true;
        }
        self.force_exit().await;
    }

    /// Cancel whatever is working and get flat with a market sell.
    /// Safe to repeat: pending cancels and market exits are not duplicated.
    async fn force_exit(&mut self) {
        match self.state.state {
            AlgoState::ToBuy => {}
            AlgoState::BuySubmitted => {
                self.state.force_exit = true;
                self.request_cancel("forced exit").await;
            }
            AlgoState::ToSell => {
                self.state.force_exit = true;
                self.submit_sell().await;
            }
            AlgoState::SellSubmitted => {
                self.state.force_exit = true;
                let market_exit_working = self
                    .state
                    .active_order
                    .as_ref()
                    .is_some_and(|a| a.order_type == OrderType::Market);
                if market_exit_working {
                    debug!(symbol = %self.state.symbol, "Market exit already working");
                } else {
                    self.request_cancel("forced exit").await;
                }
            }
        }
    }

    async fn request_cancel(&mut self, reason: &str) {
        let order_id = match self.state.active_order.as_ref() {
            Some(a) if !a.cancel_requested => a.id.clone(),
            Some(a) => {
                debug!(symbol = %self.state.symbol, order_id = %a.id, "Cancel already pending");
                return;
            }
            None => return,
        };

        match self.client.cancel_order(&order_id).await {
            Ok(()) => {
                if let Some(active) = self.state.active_order.as_mut() {
                    active.cancel_requested = true;
                    active.cancel_failed = false;
                    active.idle_ticks = 0;
                }
                info!(symbol = %self.state.symbol, order_id = %order_id, reason = reason, "Cancel requested");
            }
            Err(e) => {
                if let Some(active) = self.state.active_order.as_mut() {
                    active.cancel_failed = true;
                }
                warn!(
                    symbol = %self.state.symbol,
                    order_id = %order_id,
                    error = %e,
                    "Cancel failed; retrying on next sweep"
                );
            }
        }
    }

    /// Count a sweep tick against the working order; true when the broker
    /// should be asked about it.
    fn audit_due(&mut self) -> bool {
        let Some(active) = self.state.active_order.as_mut() else {
            return false;
        };
        active.idle_ticks += 1;
        active.cancel_failed
            || (active.cancel_requested && active.idle_ticks >= CANCEL_CONFIRM_TICKS)
            || active.idle_ticks >= AUDIT_TICKS
    }

    /// Check the working order against the broker, which is authoritative
    /// when updates were lost. Returns true while the order is still working.
    ///
    /// A closed order is dropped and the state rebuilt from the broker's
    /// position. Query failures leave state untouched for the next sweep.
    async fn reconcile_with_broker(&mut self) -> bool {
        let Some(order_id) = self.state.active_order.as_ref().map(|a| a.id.clone()) else {
            return false;
        };
        let open = match self.client.get_open_orders(&self.state.symbol).await {
            Ok(open) => open,
            Err(e) => {
                warn!(symbol = %self.state.symbol, error = %e, "Open-order check failed; will retry");
                return false;
            }
        };

        if open.iter().any(|o| o.id == order_id) {
            let Some(active) = self.state.active_order.as_mut() else {
                return false;
            };
            active.idle_ticks = 0;
            if active.cancel_requested || active.cancel_failed {
                info!(symbol = %self.state.symbol, order_id = %order_id, "Order still working; re-sending cancel");
                active.cancel_requested = false;
                active.cancel_failed = false;
                self.request_cancel("unconfirmed cancel").await;
            } else {
                debug!(symbol = %self.state.symbol, order_id = %order_id, "Order still working at broker");
            }
            return true;
        }

        let position = match self.client.get_position(&self.state.symbol).await {
            Ok(position) => position.filter(|p| p.quantity > 0.0),
            Err(e) => {
                warn!(symbol = %self.state.symbol, error = %e, "Position check failed; will retry");
                return false;
            }
        };

        warn!(
            symbol = %self.state.symbol,
            order_id = %order_id,
            state = %self.state.state,
            held = ?position.as_ref().map(|p| p.quantity),
            "Order closed at broker without a matching update; resynced"
        );
        self.state.active_order = None;
        self.state.submitted_at = None;
        match position {
            Some(position) => {
                self.state.held_quantity = position.quantity;
                if self.state.entry_price.is_none() {
                    self.state.entry_price = Some(position.avg_entry_price);
                }
                self.state.transition(AlgoState::ToSell);
                self.submit_sell().await;
            }
            None => {
                self.state.clear_position();
                self.state.transition(AlgoState::ToBuy);
            }
        }
        false
    }

    // ── Selling ──────────────────────────────────────────────────────────────

    /// Submit the sell for the held quantity: a protective limit normally, a
    /// market order while force-exiting. Stays in `ToSell` on failure.
    pub(crate) async fn submit_sell(&mut self) {
        let quantity = self.state.held_quantity;
        if quantity <= 0.0 {
            warn!(symbol = %self.state.symbol, "No shares held; nothing to sell");
            self.state.clear_position();
            self.state.transition(AlgoState::ToBuy);
            return;
        }

        let reference = self.state.entry_price.or_else(|| self.state.last_close());
        let request = match reference {
            Some(entry) if !self.state.force_exit => {
                let limit = protective_limit(
                    entry,
                    self.state.last_close().unwrap_or(entry),
                    self.config.risk.sell_margin_pct,
                );
                OrderRequest::limit(&self.state.symbol, OrderSide::Sell, quantity, limit)
            }
            _ => OrderRequest::market(&self.state.symbol, OrderSide::Sell, quantity),
        };

        match self.client.submit_order(&request).await {
            Ok(order) => {
                info!(
                    symbol = %self.state.symbol,
                    order_id = %order.id,
                    order_type = %order.order_type,
                    qty = quantity,
                    limit = ?order.limit_price,
                    "Sell submitted"
                );
                self.state.active_order = Some(ActiveOrder::from(&order));
                self.state.transition(AlgoState::SellSubmitted);
            }
            Err(e) => {
                warn!(symbol = %self.state.symbol, error = %e, "Sell submission failed; will retry");
                self.state.transition(AlgoState::ToSell);
            }
        }
    }

    /// From `ToSell` without a working order: confirm the broker still holds
    /// shares, then sell them; go back to `ToBuy` if something else already did.
    async fn resume_sell(&mut self) {
        if self.state.state != AlgoState::ToSell || self.state.active_order.is_some() {
            return;
        }
        match self.client.get_position(&self.state.symbol).await {
            Ok(Some(position)) if position.quantity > 0.0 => {
                self.state.held_quantity = position.quantity;
                if self.state.entry_price.is_none() {
                    self.state.entry_price = Some(position.avg_entry_price);
                }
                self.submit_sell().await;
            }
            Ok(_) => {
                info!(symbol = %self.state.symbol, "Position already flat");
                self.state.clear_position();
                self.state.transition(AlgoState::ToBuy);
            }
            Err(e) => {
                warn!(symbol = %self.state.symbol, error = %e, "Position check failed; will retry");
            }
        }
    }
}
