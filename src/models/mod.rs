//! Data models for master events, follower accounts, and replica orders.

mod event;
mod follower;
mod replica;

pub use event::{MasterEvent, OrderType, PositionSide, Side};
pub use follower::{mask_secret, Credentials, FollowerAccount, SymbolRules};
pub use replica::{client_order_id, OrderRequest, ReplicaOrder, ReplicaStatus, SkipReason};
