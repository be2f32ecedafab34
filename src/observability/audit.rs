// =============================================================================
// Audit — entry constructors, best-effort logger, and the query surface
// =============================================================================
//
// Every signal-received / decision-made / trade-opened / trade-closed event
// lands in the audit log. Entries written alongside other mutations are
// built here and committed inside the store's transactions; standalone
// writes go through `record`, which logs failures instead of propagating
// them (an audit miss must never halt the pipeline).
// =============================================================================

use chrono::Utc;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{AuditLogEntry, Decision, Order, Position, Signal, Trade};
use crate::errors::StoreError;
use crate::store::{AuditFilter, Store};
use crate::types::AuditEvent;

pub struct AuditLogger {
    store: Store,
}

impl AuditLogger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // -------------------------------------------------------------------------
    // Entry constructors (used both standalone and inside store txs)
    // -------------------------------------------------------------------------

    pub fn signal_received(signal: &Signal) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            event: AuditEvent::SignalReceived,
            signal_id: Some(signal.id.clone()),
            symbol: Some(signal.symbol.clone()),
            correlation_id: Some(signal.correlation_id.clone()),
            decision_type: None,
            decision: None,
            details: json!({
                "source": signal.source,
                "direction": signal.direction,
                "timeframe": signal.timeframe,
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn decision_made(signal: &Signal, decision: &Decision) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            event: AuditEvent::DecisionMade,
            signal_id: Some(signal.id.clone()),
            symbol: Some(signal.symbol.clone()),
            correlation_id: Some(signal.correlation_id.clone()),
            decision_type: Some(decision.decision_type),
            decision: Some(decision.decision),
            details: json!({
                "confidence": decision.confidence,
                "position_size": decision.position_size,
                "rule_hits": decision.reasoning.len(),
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn trade_opened(order: &Order, trade: &Trade, position: &Position) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            event: AuditEvent::TradeOpened,
            signal_id: Some(order.signal_id.clone()),
            symbol: Some(order.underlying.clone()),
            correlation_id: None,
            decision_type: None,
            decision: None,
            details: json!({
                "order_id": order.id,
                "position_id": position.id,
                "option_symbol": order.option_symbol,
                "quantity": trade.quantity,
                "execution_price": trade.execution_price,
                "total_cost": trade.total_cost,
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn trade_closed(
        order: &Order,
        trade: &Trade,
        position_id: &str,
        realized_pnl: rust_decimal::Decimal,
    ) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            event: AuditEvent::TradeClosed,
            signal_id: Some(order.signal_id.clone()),
            symbol: Some(order.underlying.clone()),
            correlation_id: None,
            decision_type: None,
            decision: None,
            details: json!({
                "order_id": order.id,
                "position_id": position_id,
                "quantity": trade.quantity,
                "execution_price": trade.execution_price,
                "realized_pnl": realized_pnl,
                "exit_action": order.exit_action,
            }),
            timestamp: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Standalone write
    // -------------------------------------------------------------------------

    /// Best-effort write outside a transaction.
    pub async fn record(&self, entry: AuditLogEntry) {
        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(event = entry.event.as_str(), error = %e, "audit write failed");
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger").finish()
    }
}

// =============================================================================
// Query service
// =============================================================================

/// Filtered, paginated access to the audit log (newest first).
pub struct AuditQueryService {
    store: Store,
}

impl AuditQueryService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>, StoreError> {
        self.store.query_audit(filter).await
    }
}

// =============================================================================
// Tests
// =============================================================================
