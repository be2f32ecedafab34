// =============================================================================
// Alpaca broker — options order REST client
// =============================================================================
//
// Orders go to POST /v2/orders on the trading API with the OCC option
// symbol; polls read GET /v2/orders/{id}.
//
// Status mapping (Alpaca -> internal):
//   new, accepted, pending_new, accepted_for_bidding -> SUBMITTED
//   partially_filled                                 -> PARTIAL
//   filled                                           -> FILLED
//   canceled, done_for_day, stopped                  -> CANCELLED
//   rejected                                         -> REJECTED
//   expired                                          -> EXPIRED
// =============================================================================

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use crate::domain::Order;
use crate::errors::BrokerError;
use crate::types::{OrderSide, OrderStatus, OrderType};

use super::{BrokerAdapter, BrokerOrderUpdate};

pub struct AlpacaBroker {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl AlpacaBroker {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: "https://api.alpaca.markets/v2".to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn request_err(&self, message: impl Into<String>) -> BrokerError {
        BrokerError::Request {
            broker: "alpaca".into(),
            message: message.into(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }
}

/// Map an Alpaca order status string into the internal state machine.
pub fn map_status(status: &str) -> Result<OrderStatus, BrokerError> {
    match status.to_lowercase().as_str() {
        "new" | "accepted" | "pending_new" | "accepted_for_bidding" => Ok(OrderStatus::Submitted),
        "partially_filled" => Ok(OrderStatus::Partial),
        "filled" => Ok(OrderStatus::Filled),
        "canceled" | "done_for_day" | "stopped" => Ok(OrderStatus::Cancelled),
        "rejected" => Ok(OrderStatus::Rejected),
        "expired" => Ok(OrderStatus::Expired),
        other => Err(BrokerError::UnknownStatus {
            broker: "alpaca".into(),
            status: other.to_string(),
        }),
    }
}

#[async_trait]
impl BrokerAdapter for AlpacaBroker {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    async fn submit(&self, order: &Order) -> Result<String, BrokerError> {
        let url = format!("{}/orders", self.base_url);

        let mut body = json!({
            "symbol": order.option_symbol,
            "qty": order.quantity.to_string(),
            "side": match order.side {
                OrderSide::Buy => "buy",
                OrderSide::Sell => "sell",
            },
            "type": match order.order_type {
                OrderType::Market => "market",
                OrderType::Limit => "limit",
            },
            "time_in_force": order.time_in_force.as_str().to_lowercase(),
            "client_order_id": order.client_order_id,
        });
        if let Some(limit) = order.limit_price {
            body["limit_price"] = json!(limit.to_string());
        }

        let resp = self
            .authed(self.client.post(&url))
            .json(&body)
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
                broker: "alpaca".into(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let broker_order_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| self.request_err("response missing id"))?;

        debug!(
            order_id = %order.id,
            broker_order_id = %broker_order_id,
            "alpaca order submitted"
        );
        Ok(broker_order_id)
    }

    async fn poll(&self, broker_order_id: &str) -> Result<BrokerOrderUpdate, BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, broker_order_id);
        let resp = self
            .authed(self.client.get(&url))
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

        let vendor_status = body
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.request_err("order missing status"))?;

        let filled_quantity = body
            .get("filled_qty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0) as u32;
        let avg_fill_price = body
            .get("filled_avg_price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok());

        Ok(BrokerOrderUpdate {
            status: map_status(vendor_status)?,
            filled_quantity,
            avg_fill_price,
        })
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/orders/{}", self.base_url, broker_order_id);
        let resp = self
            .authed(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        if !resp.status().is_success() {
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
        assert_eq!(map_status("new").unwrap(), OrderStatus::Submitted);
        assert_eq!(map_status("accepted").unwrap(), OrderStatus::Submitted);
        assert_eq!(map_status("pending_new").unwrap(), OrderStatus::Submitted);
        assert_eq!(map_status("partially_filled").unwrap(), OrderStatus::Partial);
        assert_eq!(map_status("FILLED").unwrap(), OrderStatus::Filled);
        assert_eq!(map_status("canceled").unwrap(), OrderStatus::Cancelled);
        assert_eq!(map_status("rejected").unwrap(), OrderStatus::Rejected);
        assert_eq!(map_status("expired").unwrap(), OrderStatus::Expired);
        assert!(matches!(
            map_status("halted"),
            Err(BrokerError::UnknownStatus { .. })
        ));
    }
}
