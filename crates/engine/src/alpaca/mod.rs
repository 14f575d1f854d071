//! Alpaca brokerage adapters: REST for orders, positions and history,
//! WebSockets for minute bars and trade updates.

mod rest;
mod stream;

pub use rest::AlpacaClient;
pub use stream::{AlpacaBarStream, TradeUpdateStream};

use common::TradingMode;

const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

const PAPER_TRADING_STREAM: &str = "wss://paper-api.alpaca.markets/stream";
const LIVE_TRADING_STREAM: &str = "wss://api.alpaca.markets/stream";
const DATA_STREAM: &str = "wss://stream.data.alpaca.markets/v2";

fn trading_url(mode: TradingMode) -> &'static str {
    match mode {
        TradingMode::Paper => PAPER_TRADING_URL,
        TradingMode::Live => LIVE_TRADING_URL,
    }
}

fn trading_stream_url(mode: TradingMode) -> &'static str {
    match mode {
        TradingMode::Paper => PAPER_TRADING_STREAM,
        TradingMode::Live => LIVE_TRADING_STREAM,
    }
}
