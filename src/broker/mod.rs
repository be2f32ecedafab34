// =============================================================================
// Broker Adapters — submit / poll / cancel over a closed vendor set
// =============================================================================
//
// Variants: `paper` (local simulation, never network), `tradier`, `alpaca`.
// The preferred broker comes from configuration and is used only when fully
// configured; everything else falls back to paper.
// =============================================================================

pub mod alpaca;
pub mod paper;
pub mod tradier;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::domain::Order;
use crate::errors::BrokerError;
use crate::types::OrderStatus;

/// Broker-side view of an order, mapped into internal status.
#[derive(Debug, Clone)]
pub struct BrokerOrderUpdate {
    pub status: OrderStatus,
    pub filled_quantity: u32,
    pub avg_fill_price: Option<Decimal>,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit an order; returns the broker's order id.
    async fn submit(&self, order: &Order) -> Result<String, BrokerError>;

    /// Poll the broker for the order's current state.
    async fn poll(&self, broker_order_id: &str) -> Result<BrokerOrderUpdate, BrokerError>;

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError>;
}

/// Pick the configured broker, falling back to paper simulation when the
/// preferred vendor is not fully configured.
pub fn select_broker(config: &BrokerConfig) -> Arc<dyn BrokerAdapter> {
    match config.preferred.as_deref() {
        Some("tradier") => {
            if let (Some(account), Some(token)) = (
                config.tradier_account_id.clone(),
                config.tradier_access_token.clone(),
            ) {
                info!("broker adapter: tradier");
                return Arc::new(tradier::TradierBroker::new(account, token));
            }
            warn!("tradier preferred but not fully configured — using paper");
        }
        Some("alpaca") => {
            if let (Some(key), Some(secret)) = (
                config.alpaca_api_key.clone(),
                config.alpaca_api_secret.clone(),
            ) {
                info!("broker adapter: alpaca");
                return Arc::new(alpaca::AlpacaBroker::new(key, secret));
            }
            warn!("alpaca preferred but not fully configured — using paper");
        }
        Some("paper") | None => {}
        Some(other) => warn!(broker = other, "unknown broker preference — using paper"),
    }
    info!("broker adapter: paper");
    Arc::new(paper::PaperBroker::new())
}

// =============================================================================
// Tests
// =============================================================================
