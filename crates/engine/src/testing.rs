//! Fixtures shared by the engine's unit tests.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use common::{Bar, Clock, OrderEventKind, OrderUpdate};
use risk::RiskConfig;

use crate::algo::AlgoConfig;

/// 09:30 New York on a regular trading day.
pub fn market_open() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap()
}

/// Open-session clock `minutes` after the open; the session lasts 390 minutes.
pub fn clock_at(minutes: i64) -> Clock {
    Clock {
        timestamp: market_open() + chrono::Duration::minutes(minutes),
        is_open: true,
        next_open: market_open() + chrono::Duration::days(1),
        next_close: market_open() + chrono::Duration::minutes(390),
    }
}

pub fn bar(symbol: &str, minute: i64, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: market_open() + chrono::Duration::minutes(minute),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000.0,
    }
}

/// 19 closes at `base` followed by one at `last`.
pub fn flat_then_up(base: f64, last: f64) -> Vec<f64> {
    let mut closes = vec![base; 19];
    closes.push(last);
    closes
}

pub fn test_config(lot: f64) -> AlgoConfig {
    AlgoConfig {
        lot_notional: lot,
        buy_timeout: Duration::from_secs(120),
        risk: RiskConfig::default(),
    }
}

/// A non-fill update as the broker would report it.
pub fn closed(order_id: &str, symbol: &str, event: OrderEventKind, filled: f64) -> OrderUpdate {
    OrderUpdate {
        order_id: order_id.to_string(),
        symbol: symbol.to_string(),
        event,
        fill_price: None,
        filled_quantity: filled,
        timestamp: market_open(),
    }
}
