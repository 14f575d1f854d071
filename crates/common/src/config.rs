use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result, TradingMode};

/// All configuration for one trading session.
///
/// Symbols and lot size come from the command line; everything else is read
/// from environment variables (and `.env` if present) at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // Broker credentials
    pub api_key_id: String,
    pub api_secret_key: String,

    pub trading_mode: TradingMode,
    /// Market-data feed name (`iex` or `sip`).
    pub data_feed: String,

    // Trading
    pub symbols: Vec<String>,
    /// USD notional allocated to each buy.
    pub lot_notional: f64,
    pub buy_timeout: Duration,
    pub sell_margin_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub exit_rules_enabled: bool,

    // Supervision
    pub sweep_interval: Duration,
    pub close_margin: Duration,
    pub recovery_attempts: u32,
    pub shutdown_grace: Duration,

    /// Signal evaluator config file path.
    pub signal_config_path: String,
}

impl Config {
    /// Load configuration from environment variables, loading `.env` first.
    pub fn from_env(symbols: Vec<String>, lot_notional: f64) -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(symbols, lot_notional, |key| std::env::var(key).ok())
    }

    /// Build and validate configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(symbols: Vec<String>, lot_notional: f64, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let trading_mode = match env
            .optional("TRADING_MODE")
            .unwrap_or_else(|| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => {
                return Err(Error::Config(format!(
                    "TRADING_MODE must be 'paper' or 'live', got: '{other}'"
                )))
            }
        };

        let config = Config {
            api_key_id: env.required("APCA_API_KEY_ID")?,
            api_secret_key: env.required("APCA_API_SECRET_KEY")?,
            trading_mode,
            data_feed: env
                .optional("APCA_DATA_FEED")
                .unwrap_or_else(|| "iex".to_string()),
            symbols: symbols.into_iter().map(|s| s.trim().to_uppercase()).collect(),
            lot_notional,
            buy_timeout: Duration::from_secs(env.parsed("BUY_TIMEOUT_SECS", 120)?),
            sell_margin_pct: env.parsed("SELL_MARGIN_PCT", 0.0)?,
            stop_loss_pct: env.parsed("STOP_LOSS_PCT", 0.10)?,
            take_profit_pct: env.parsed("TAKE_PROFIT_PCT", 0.20)?,
            exit_rules_enabled: env.parsed("EXIT_RULES_ENABLED", true)?,
            sweep_interval: Duration::from_secs(env.parsed("SWEEP_INTERVAL_SECS", 30)?),
            close_margin: Duration::from_secs(env.parsed("CLOSE_MARGIN_SECS", 300)?),
            recovery_attempts: env.parsed("RECOVERY_ATTEMPTS", 3)?,
            shutdown_grace: Duration::from_secs(env.parsed("SHUTDOWN_GRACE_SECS", 30)?),
            signal_config_path: env
                .optional("SIGNAL_CONFIG_PATH")
                .unwrap_or_else(|| "config/signal.toml".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot trade safely with.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(Error::Config("at least one symbol is required".into()));
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if !is_valid_symbol(symbol) {
                return Err(Error::Config(format!("invalid symbol '{symbol}'")));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(Error::Config(format!("duplicate symbol '{symbol}'")));
            }
        }

        if !self.lot_notional.is_finite() || self.lot_notional <= 0.0 {
            return Err(Error::Config(format!(
                "lot size must be a positive amount, got {}",
                self.lot_notional
            )));
        }

        for (name, pct) in [
            ("SELL_MARGIN_PCT", self.sell_margin_pct),
            ("STOP_LOSS_PCT", self.stop_loss_pct),
            ("TAKE_PROFIT_PCT", self.take_profit_pct),
        ] {
            if !(0.0..1.0).contains(&pct) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {pct}")));
            }
        }

        for (name, d) in [
            ("BUY_TIMEOUT_SECS", self.buy_timeout),
            ("SWEEP_INTERVAL_SECS", self.sweep_interval),
        ] {
            if d.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.recovery_attempts == 0 {
            return Err(Error::Config("RECOVERY_ATTEMPTS must be at least 1".into()));
        }

        Ok(())
    }
}

fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= 10
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.')
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String> {
        self.optional(key).ok_or_else(|| {
            Error::Config(format!(
                "Required environment variable '{key}' is not set. Check your .env file."
            ))
        })
    }

    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.optional(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} has an invalid value: '{raw}'"))),
            None => Ok(default),
        }
    }
}
