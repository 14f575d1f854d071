use serde::{Deserialize, Serialize};

/// Per-deployment exit thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Loss from entry that forces an exit (e.g. 0.10 = 10%).
    pub stop_loss_pct: f64,
    /// Gain from entry that forces an exit (e.g. 0.20 = 20%).
    pub take_profit_pct: f64,
    /// Minimum markup of the protective sell over entry (0.0 = at entry).
    pub sell_margin_pct: f64,
    /// When false, `ExitRules::check` never fires.
    pub exit_rules_enabled: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.10,
            take_profit_pct: 0.20,
            sell_margin_pct: 0.0,
            exit_rules_enabled: true,
        }
    }
}

impl From<&common::Config> for RiskConfig {
    fn from(cfg: &common::Config) -> Self {
        Self {
            stop_loss_pct: cfg.stop_loss_pct,
            take_profit_pct: cfg.take_profit_pct,
            sell_margin_pct: cfg.sell_margin_pct,
            exit_rules_enabled: cfg.exit_rules_enabled,
        }
    }
}

/// Why a held position must be exited immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::StopLoss => write!(f, "stop-loss"),
            ExitTrigger::TakeProfit => write!(f, "take-profit"),
        }
    }
}

/// Stop-loss / take-profit check for a long position.
#[derive(Debug, Clone)]
pub struct ExitRules {
    config: RiskConfig,
}

impl ExitRules {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Returns a trigger when `price` is strictly below the stop level or
    /// strictly above the take-profit level for a position entered at `entry`.
    pub fn check(&self, entry: f64, price: f64) -> Option<ExitTrigger> {
        if !self.config.exit_rules_enabled
            || !entry.is_finite()
            || !price.is_finite()
            || entry <= 0.0
        {
            return None;
        }
        if price < entry * (1.0 - self.config.stop_loss_pct) {
            Some(ExitTrigger::StopLoss)
        } else if price > entry * (1.0 + self.config.take_profit_pct) {
            Some(ExitTrigger::TakeProfit)
        } else {
            None
        }
    }
}
