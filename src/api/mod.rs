//! Exchange API clients for order execution and the master event stream.

mod binance;
mod exchange;
mod paper;
mod types;

pub use binance::{BinanceFuturesClient, FUTURES_REST_URL, FUTURES_WS_URL};
pub use exchange::{ExchangeClient, ExchangeError, FailureKind, RawEventStream};
#[cfg(test)]
pub use exchange::OrderAck;
pub use paper::PaperExchange;
pub use types::*;
