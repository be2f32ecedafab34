// =============================================================================
// Tradier broker — options order REST client
// =============================================================================
//
// Orders go to POST /v1/accounts/{account}/orders with class=option; polls
// read GET /v1/accounts/{account}/orders/{id}.
//
// Status mapping (Tradier -> internal):
//   pending, open, received   -> SUBMITTED
//   partially_filled          -> PARTIAL
//   filled                    -> FILLED
//   canceled                  -> CANCELLED
//   rejected, error           -> REJECTED
//   expired                   -> EXPIRED
// =============================================================================

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::domain::Order;
use crate::errors::BrokerError;
use crate::types::{OrderSide, OrderStatus, OrderType};

use super::{BrokerAdapter, BrokerOrderUpdate};

pub struct TradierBroker {
    account_id: String,
    access_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl TradierBroker {
    pub fn new(account_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            access_token: access_token.into(),
            base_url: "https://api.tradier.com/v1".to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn request_err(&self, message: impl Into<String>) -> BrokerError {
        BrokerError::Request {
            broker: "tradier".into(),
            message: message.into(),
        }
    }
}

/// Map a Tradier order status string into the internal state machine.
pub fn map_status(status: &str) -> Result<OrderStatus, BrokerError> {
    match status.to_lowercase().as_str() {
        "pending" | "open" | "received" => Ok(OrderStatus::Submitted),
        "partially_filled" => Ok(OrderStatus::Partial),
        "filled" => Ok(OrderStatus::Filled),
        "canceled" => Ok(OrderStatus::Cancelled),
        "rejected" | "error" => Ok(OrderStatus::Rejected),
        "expired" => Ok(OrderStatus::Expired),
        other => Err(BrokerError::UnknownStatus {
            broker: "tradier".into(),
            status: other.to_string(),
        }),
    }
}

/// Tradier wants buy_to_open / sell_to_close for long option positions.
fn side_param(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy_to_open",
        OrderSide::Sell => "sell_to_close",
    }
}

#[async_trait]
impl BrokerAdapter for TradierBroker {
    fn name(&self) -> &'static str {
        "tradier"
    }

    async fn submit(&self, order: &Order) -> Result<String, BrokerError> {
        let url = format!("{}/accounts/{}/orders", self.base_url, self.account_id);

        let order_type = match order.order_type {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
        };
        let mut form = vec![
            ("class".to_string(), "option".to_string()),
            ("symbol".to_string(), order.underlying.clone()),
            ("option_symbol".to_string(), order.option_symbol.clone()),
            ("side".to_string(), side_param(order.side).to_string()),
            ("quantity".to_string(), order.quantity.to_string()),
            ("type".to_string(), order_type.to_string()),
            (
                "duration".to_string(),
                order.time_in_force.as_str().to_lowercase(),
            ),
            ("tag".to_string(), order.client_order_id.clone()),
        ];
        if let Some(limit) = order.limit_price {
            form.push(("price".to_string(), limit.to_string()));
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        if !status.is_success() {
            return Err(BrokerError::Rejected {
                broker: "tradier".into(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let broker_order_id = body
            .pointer("/order/id")
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string())
            .ok_or_else(|| self.request_err("response missing order.id"))?;

        debug!(
            order_id = %order.id,
            broker_order_id = %broker_order_id,
            "tradier order submitted"
        );
        Ok(broker_order_id)
    }

    async fn poll(&self, broker_order_id: &str) -> Result<BrokerOrderUpdate, BrokerError> {
        let url = format!(
            "{}/accounts/{}/orders/{}",
            self.base_url, self.account_id, broker_order_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(self.request_err(format!("HTTP {status}")));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        let order = body
            .get("order")
            .ok_or_else(|| self.request_err("response missing order"))?;
        let vendor_status = order
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.request_err("order missing status"))?;

        let filled_quantity = order
            .get("exec_quantity")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as u32;
        let avg_fill_price = order
            .get("avg_fill_price")
            .and_then(|v| v.as_f64())
            .and_then(Decimal::from_f64);

        Ok(BrokerOrderUpdate {
            status: map_status(vendor_status)?,
            filled_quantity,
            avg_fill_price,
        })
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!(
            "{}/accounts/{}/orders/{}",
            self.base_url, self.account_id, broker_order_id
        );
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(broker_order_id, status = %resp.status(), "tradier cancel failed");
            return Err(self.request_err(format!("cancel HTTP {}", resp.status())));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_table() {
        assert_eq!(map_status("open").unwrap(), OrderStatus::Submitted);
        assert_eq!(map_status("pending").unwrap(), OrderStatus::Submitted);
        assert_eq!(map_status("PARTIALLY_FILLED").unwrap(), OrderStatus::Partial);
        assert_eq!(map_status("filled").unwrap(), OrderStatus::Filled);
        assert_eq!(map_status("canceled").unwrap(), OrderStatus::Cancelled);
        assert_eq!(map_status("rejected").unwrap(), OrderStatus::Rejected);
        assert_eq!(map_status("expired").unwrap(), OrderStatus::Expired);
        assert!(matches!(
            map_status("weird"),
            Err(BrokerError::UnknownStatus { .. })
        ));
    }

    #[test]
    fn option_sides_open_and_close() {
        assert_eq!(side_param(OrderSide::Buy), "buy_to_open");
        assert_eq!(side_param(OrderSide::Sell), "sell_to_close");
    }
}
