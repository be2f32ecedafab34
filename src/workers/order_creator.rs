// =============================================================================
// Order Creator — turn approved signals into PENDING orders
// =============================================================================
//
// Fetches approved signals that have no order yet, derives the contract from
// the parser-attached option parameters, sizes from the entry decision, and
// inserts the PENDING order in the same transaction that bumps the signal
// status. A conflict means another run got there first.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::{occ_symbol, OptionParams, Order, Signal};
use crate::errors::StoreError;
use crate::types::{OrderSide, OrderStatus, OrderType, TimeInForce, TradingMode};

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let (batch, mode) = {
        let cfg = state.config.read();
        (cfg.workers.batch_size, cfg.mode)
    };

    let signals = state.store.approved_signals_without_orders(batch).await?;
    if signals.is_empty() {
        return Ok(());
    }
    debug!(approved = signals.len(), "order creator run");

    for signal in signals {
        let Some(params) = OptionParams::from_metadata(&signal.metadata) else {
            warn!(signal_id = %signal.id, "approved signal lacks option parameters — skipping");
            continue;
        };

        // The entry decision's sizing is authoritative; the parser's derived
        // quantity is only the fallback.
        let quantity = match state.store.entry_decision(&signal.id).await {
            Ok(Some(decision)) => decision.position_size.max(1),
            Ok(None) => {
                warn!(signal_id = %signal.id, "approved signal missing its entry decision");
                params.quantity
            }
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "decision lookup failed for item");
                continue;
            }
        };

        let order = build_entry_order(&signal, &params, quantity, mode);
        match state.store.create_entry_order(&order).await {
            Ok(()) => {
                state.note_order_activity();
                info!(
                    order_id = %order.id,
                    signal_id = %signal.id,
                    option_symbol = %order.option_symbol,
                    quantity = order.quantity,
                    "entry order created"
                );
            }
            Err(StoreError::Conflict(_)) => {
                debug!(signal_id = %signal.id, "signal no longer awaiting an order — skipping");
            }
            Err(StoreError::Duplicate(what)) => {
                warn!(signal_id = %signal.id, what = %what, "duplicate order suppressed");
            }
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "order insert failed for item");
            }
        }
    }
    Ok(())
}

fn build_entry_order(
    signal: &Signal,
    params: &OptionParams,
    quantity: u32,
    mode: TradingMode,
) -> Order {
    let now = Utc::now();
    Order {
        id: Uuid::new_v4().to_string(),
        signal_id: signal.id.clone(),
        client_order_id: Uuid::new_v4().to_string(),
        broker_order_id: None,
        underlying: signal.symbol.clone(),
        option_symbol: occ_symbol(
            &signal.symbol,
            params.expiration,
            signal.direction,
            params.strike,
        ),
        strike: params.strike,
        expiration: params.expiration,
        option_type: signal.direction,
        side: OrderSide::Buy,
        quantity,
        order_type: OrderType::Market,
        limit_price: None,
        time_in_force: TimeInForce::Day,
        mode,
        status: OrderStatus::Pending,
        filled_quantity: 0,
        avg_fill_price: None,
        exit_action: None,
        exit_quantity: None,
        refactored_position_id: None,
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use crate::types::Direction;

    async fn state_with_approved_signal() -> (Arc<AppState>, Signal) {
        let state = Arc::new(AppState::with_store(
            EngineConfig::default(),
            Store::open_in_memory().unwrap(),
        ));
        let signal = state
            .pipeline
            .process_payload(
                "corr-oc",
                json!({
                    "trend": "BULLISH",
                    "ticker": "SPY",
                    "current_price": 502.15,
                    "score": 8.5,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .await
            .unwrap();
        crate::workers::signal_processor::run_once(&state)
            .await
            .unwrap();
        (state, signal)
    }

    #[tokio::test]
    async fn approved_signal_becomes_pending_buy_order() {
        let (state, signal) = state_with_approved_signal().await;

        run_once(&state).await.unwrap();

        let orders = state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        assert_eq!(order.signal_id, signal.id);
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.option_type, Direction::Call);
        assert_eq!(order.strike, dec!(500));
        assert_eq!(order.status, OrderStatus::Pending);
        assert!((1..=10).contains(&order.quantity));
        // Next monthly third Friday.
        assert_eq!(order.expiration.weekday(), chrono::Weekday::Fri);
        assert!((15..=21).contains(&order.expiration.day()));
        assert!(order.option_symbol.starts_with("SPY"));
        assert!(state.last_order_at.read().is_some());
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let (state, _) = state_with_approved_signal().await;

        run_once(&state).await.unwrap();
        run_once(&state).await.unwrap();

        let orders = state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap();
        assert_eq!(orders.len(), 1);
    }
}
