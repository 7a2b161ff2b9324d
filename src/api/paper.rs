//! Dry-run exchange: real market data and master stream, simulated orders.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::models::{Credentials, OrderRequest, SymbolRules};

use super::exchange::{ExchangeClient, ExchangeError, OrderAck, RawEventStream};

/// Wraps a live client and accepts every order without sending it.
pub struct PaperExchange {
    inner: Arc<dyn ExchangeClient>,
    next_id: AtomicU64,
}

impl PaperExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>) -> Self {
        Self {
            inner,
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of simulated orders so far.
    #[cfg(test)]
    pub fn orders_placed(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed) - 1
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn submit_order(
        &self,
        _creds: &Credentials,
        order: &OrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        info!(
            symbol = %order.symbol,
            side = order.side.as_str(),
            order_type = order.order_type.as_str(),
            quantity = %order.quantity,
            price = %order.price,
            client_order_id = %order.client_order_id,
            "[DRY RUN] Would submit order"
        );

        Ok(OrderAck {
            exchange_order_id: format!("paper-{}", id),
            client_order_id: order.client_order_id.clone(),
            status: "NEW".to_string(),
            used_weight: None,
        })
    }

    async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        self.inner.get_symbol_rules(symbol).await
    }

    async fn open_user_stream(&self, creds: &Credentials) -> Result<RawEventStream, ExchangeError> {
        self.inner.open_user_stream(creds).await
    }
}
