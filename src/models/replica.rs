//! Follower-side replicas of master events and their outcomes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{MasterEvent, OrderType, PositionSide, Side};

/// Terminal state of one (event, follower) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaStatus {
    Submitted,
    Rejected,
    Skipped,
    Duplicate,
}

impl ReplicaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::Submitted => "submitted",
            ReplicaStatus::Rejected => "rejected",
            ReplicaStatus::Skipped => "skipped",
            ReplicaStatus::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a replica was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    BreakerOpen,
    FollowerDisabled,
    ZeroQuantity,
    BelowMinQuantity,
    BelowMinNotional,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::BreakerOpen => "breaker_open",
            SkipReason::FollowerDisabled => "follower_disabled",
            SkipReason::ZeroQuantity => "zero_quantity",
            SkipReason::BelowMinQuantity => "below_min_quantity",
            SkipReason::BelowMinNotional => "below_min_notional",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A follower-specific order ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,

    /// Limit price; for market orders the reference price used for notional
    pub price: Decimal,

    pub position_side: PositionSide,
    pub reduce_only: bool,

    /// Idempotency key on the exchange side
    pub client_order_id: String,
}

/// Derive the exchange client order id for an (event, follower) pair.
///
/// Deterministic so a retried submission reuses the same id. Binance limits
/// client ids to 36 characters; `cp` + 32 hex digits fits.
pub fn client_order_id(event_id: &str, follower_id: &str) -> String {
    let key = format!("{}/{}", event_id, follower_id);
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
    format!("cp{}", id.simple())
}

/// Record of what happened to one master event for one follower.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaOrder {
    pub id: String,
    pub source_event_id: String,
    pub follower_id: String,
    pub symbol: String,
    pub side: Side,

    /// Rounded quantity; zero when the order was never built
    pub quantity: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
    pub position_side: PositionSide,
    pub reduce_only: bool,
    pub client_order_id: String,

    pub status: ReplicaStatus,

    /// Skip reason or exchange error text
    pub reason: Option<String>,

    pub exchange_order_id: Option<String>,

    /// Number of submission attempts made
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
}

impl ReplicaOrder {
    /// Outcome for an event that never produced an order request.
    pub fn without_order(
        event: &MasterEvent,
        follower_id: &str,
        status: ReplicaStatus,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_event_id: event.event_id.clone(),
            follower_id: follower_id.to_string(),
            symbol: event.symbol.clone(),
            side: event.side,
            quantity: Decimal::ZERO,
            price: event.price,
            order_type: event.order_type,
            position_side: event.position_side,
            reduce_only: event.reduce_only,
            client_order_id: client_order_id(&event.event_id, follower_id),
            status,
            reason,
            exchange_order_id: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Outcome for an event that was translated into `request`.
    pub fn from_request(
        event: &MasterEvent,
        follower_id: &str,
        request: &OrderRequest,
        status: ReplicaStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_event_id: event.event_id.clone(),
            follower_id: follower_id.to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            order_type: request.order_type,
            position_side: request.position_side,
            reduce_only: request.reduce_only,
            client_order_id: request.client_order_id.clone(),
            status,
            reason: None,
            exchange_order_id: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}
