//! Exchange client contract the copier core depends on.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::{Credentials, OrderRequest, SymbolRules};

/// Raw text frames from a user data stream.
pub type RawEventStream = BoxStream<'static, Result<String, ExchangeError>>;

/// Failure classes the dispatcher branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TransientNetwork,
    RateLimitedByExchange,
    ExchangeRejection,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::RateLimitedByExchange => "rate_limited_by_exchange",
            FailureKind::ExchangeRejection => "exchange_rejection",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by exchange (retry after {retry_after:?}): {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("client order id already used: {0}")]
    DuplicateClientOrderId(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    /// 2xx order response whose body could not be read
    #[error("order accepted, unreadable acknowledgement: {0}")]
    UnreadableAck(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),
}

impl ExchangeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExchangeError::Network(_)
            | ExchangeError::Timeout(_)
            | ExchangeError::StreamClosed(_) => FailureKind::TransientNetwork,
            ExchangeError::RateLimited { .. } => FailureKind::RateLimitedByExchange,
            ExchangeError::Rejected { .. }
            | ExchangeError::DuplicateClientOrderId(_)
            | ExchangeError::Decode(_)
            | ExchangeError::UnreadableAck(_) => FailureKind::ExchangeRejection,
        }
    }

    /// Whether the order is known to be on the exchange despite the error.
    /// A duplicate client order id only proves that on a resubmission.
    pub fn confirms_placement(&self, resubmission: bool) -> bool {
        match self {
            ExchangeError::UnreadableAck(_) => true,
            ExchangeError::DuplicateClientOrderId(_) => resubmission,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::TransientNetwork
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Decode(e.to_string())
        } else {
            ExchangeError::Network(e.to_string())
        }
    }
}

/// Exchange acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: String,

    /// Request weight the exchange reports as used in the current minute
    pub used_weight: Option<u32>,
}

/// Authenticated request/stream interface to the exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Place an order on the account identified by `creds`.
    async fn submit_order(
        &self,
        creds: &Credentials,
        order: &OrderRequest,
    ) -> Result<OrderAck, ExchangeError>;

    /// Trading filters for a symbol.
    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError>;

    /// Open the private event stream of the account identified by `creds`.
    async fn open_user_stream(&self, creds: &Credentials) -> Result<RawEventStream, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_client_is_object_safe() {
        fn _assert_object_safe(_c: &dyn ExchangeClient) {}
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            ExchangeError::Timeout(Duration::from_secs(1)).kind(),
            FailureKind::TransientNetwork
        );
        assert_eq!(
            ExchangeError::Network("connection reset".into()).kind(),
            FailureKind::TransientNetwork
        );
        assert_eq!(
            ExchangeError::RateLimited {
                retry_after: None,
                message: "too many requests".into()
            }
            .kind(),
            FailureKind::RateLimitedByExchange
        );
        assert_eq!(
            ExchangeError::Rejected {
                code: -2019,
                message: "Margin is insufficient.".into()
            }
            .kind(),
            FailureKind::ExchangeRejection
        );
    }

    #[test]
    fn test_confirms_placement() {
        let dup = ExchangeError::DuplicateClientOrderId("ClientOrderId is duplicated.".into());
        assert!(dup.confirms_placement(true));
        assert!(!dup.confirms_placement(false));
        assert!(ExchangeError::UnreadableAck("EOF".into()).confirms_placement(false));
        assert!(!ExchangeError::Network("reset".into()).confirms_placement(true));
    }

    #[test]
    fn test_error_messages() {
        let err = ExchangeError::Rejected {
            code: -4164,
            message: "Order's notional must be no smaller than 100".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("-4164"));
        assert!(msg.contains("notional"));
    }
}
