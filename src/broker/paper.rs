// =============================================================================
// Paper broker — local order book, never touches the network
// =============================================================================
//
// Fills themselves are simulated by the paper executor; this adapter only
// hands out synthetic broker ids and answers polls for them so the shared
// worker code does not special-case paper mode.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::Order;
use crate::errors::BrokerError;
use crate::types::OrderStatus;

use super::{BrokerAdapter, BrokerOrderUpdate};

pub struct PaperBroker {
    orders: RwLock<HashMap<String, BrokerOrderUpdate>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit(&self, order: &Order) -> Result<String, BrokerError> {
        let broker_order_id = format!("paper-{}", Uuid::new_v4());
        self.orders.write().insert(
            broker_order_id.clone(),
            BrokerOrderUpdate {
                status: OrderStatus::Submitted,
                filled_quantity: 0,
                avg_fill_price: order.limit_price,
            },
        );
        Ok(broker_order_id)
    }

    async fn poll(&self, broker_order_id: &str) -> Result<BrokerOrderUpdate, BrokerError> {
        self.orders
            .read()
            .get(broker_order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Request {
                broker: "paper".into(),
                message: format!("unknown order {broker_order_id}"),
            })
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut orders = self.orders.write();
        match orders.get_mut(broker_order_id) {
            Some(update) if !update.status.is_terminal() => {
                update.status = OrderStatus::Cancelled;
                Ok(())
            }
            Some(_) => Err(BrokerError::Rejected {
                broker: "paper".into(),
                message: "order already terminal".into(),
            }),
            None => Err(BrokerError::Request {
                broker: "paper".into(),
                message: format!("unknown order {broker_order_id}"),
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
