//! Master account events as delivered by the user data stream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order type of the master order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    /// Futures order types collapse to market or limit. Stop and take-profit
    /// orders fill at market once triggered.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MARKET" | "STOP_MARKET" | "TAKE_PROFIT_MARKET" | "TRAILING_STOP_MARKET"
            | "LIQUIDATION" => Some(OrderType::Market),
            "LIMIT" | "STOP" | "TAKE_PROFIT" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

/// Hedge-mode position side. One-way accounts always use `Both`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    #[default]
    Both,
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Both => "BOTH",
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BOTH" => Some(PositionSide::Both),
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// A fill on the master account. Never mutated after it leaves the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterEvent {
    /// Exchange-assigned unique id (`{orderId}-{tradeId}` for fills)
    pub event_id: String,

    /// Master order id the fill belongs to
    pub order_id: String,

    /// Trading pair, e.g. BTCUSDT
    pub symbol: String,

    pub side: Side,

    /// Filled quantity in base asset
    pub quantity: Decimal,

    /// Fill price
    pub price: Decimal,

    pub order_type: OrderType,

    #[serde(default)]
    pub position_side: PositionSide,

    #[serde(default)]
    pub reduce_only: bool,

    /// Exchange transaction time
    pub timestamp: DateTime<Utc>,
}
