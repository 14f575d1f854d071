use std::collections::HashMap;
use std::sync::Arc;

use common::{Bar, Error, Result};
use tracing::info;

use crate::config::SignalConfig;
use crate::indicators::{RsiIndicator, SmaIndicator};
use crate::SignalEvaluator;

pub const DEFAULT_SMA_WINDOW: usize = 20;

/// Build the evaluator named in config, rejecting unknown types and bad params.
pub fn build_evaluator(cfg: &SignalConfig) -> Result<Arc<dyn SignalEvaluator>> {
    let evaluator = build(cfg)?;
    info!(evaluator = %evaluator.name(), "Signal evaluator configured");
    Ok(evaluator)
}

fn build(cfg: &SignalConfig) -> Result<Arc<dyn SignalEvaluator>> {
    match cfg.signal_type.as_str() {
        "sma" => {
            let window = param_usize(&cfg.params, "window", DEFAULT_SMA_WINDOW)?;
            if window < 2 {
                return Err(Error::Config(format!("sma window must be >= 2, got {window}")));
            }
            Ok(Arc::new(SmaCrossover::new(window)))
        }
        "rsi" => {
            let period = param_usize(&cfg.params, "period", 14)?;
            let oversold = param_f64(&cfg.params, "oversold", 30.0)?;
            if period < 2 {
                return Err(Error::Config(format!("rsi period must be >= 2, got {period}")));
            }
            if !(0.0..100.0).contains(&oversold) {
                return Err(Error::Config(format!(
                    "rsi oversold level must be in [0, 100), got {oversold}"
                )));
            }
            Ok(Arc::new(RsiReversal::new(period, oversold)))
        }
        other => Err(Error::Config(format!("unknown signal type '{other}'"))),
    }
}

fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_float()
            .or_else(|| v.as_integer().map(|i| i as f64))
            .ok_or_else(|| Error::Config(format!("signal param '{key}' must be a number, got {v}"))),
    }
}

fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
            .ok_or_else(|| {
                Error::Config(format!(
                    "signal param '{key}' must be a non-negative integer, got {v}"
                ))
            }),
    }
}

fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

// ─── Concrete evaluators ──────────────────────────────────────────────────────

/// Fires when the latest close crosses above its simple moving average.
///
/// Needs `window` bars. The previous bar's average uses up to `window` bars
/// ending at that bar, so the first full window can already produce a signal.
pub struct SmaCrossover {
    name: String,
    indicator: SmaIndicator,
}

impl SmaCrossover {
    pub fn new(window: usize) -> Self {
        let indicator = SmaIndicator::new(window);
        Self {
            name: format!("sma-crossover-{}", indicator.window),
            indicator,
        }
    }
}

impl Default for SmaCrossover {
    fn default() -> Self {
        Self::new(DEFAULT_SMA_WINDOW)
    }
}

impl SignalEvaluator for SmaCrossover {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, bars: &[Bar]) -> bool {
        let closes = closes(bars);
        let Some(current_avg) = self.indicator.compute(&closes) else {
            return false;
        };
        let n = closes.len();
        let Some(prev_avg) = self.indicator.compute_partial(&closes[..n - 1]) else {
            return false;
        };
        closes[n - 2] <= prev_avg && closes[n - 1] > current_avg
    }
}

/// Fires when RSI rebounds up through the oversold level.
pub struct RsiReversal {
    name: String,
    indicator: RsiIndicator,
    oversold: f64,
}

impl RsiReversal {
    pub fn new(period: usize, oversold: f64) -> Self {
        Self {
            name: format!("rsi-reversal-{period}"),
            indicator: RsiIndicator::new(period),
            oversold,
        }
    }
}

impl SignalEvaluator for RsiReversal {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, bars: &[Bar]) -> bool {
        self.indicator.crossed_above(&closes(bars), self.oversold)
    }
}
