// =============================================================================
// Order Poller — live-mode broker synchronization
// =============================================================================
//
// LIVE mode only. Submits PENDING live orders to the configured broker and
// polls SUBMITTED/PARTIAL ones, mapping vendor status into the internal
// state machine. Fills record the trade and the position change in one
// transaction, exactly like paper fills, so every invariant on orders,
// trades, and positions holds in both modes.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::broker::BrokerOrderUpdate;
use crate::domain::{Order, Position, Trade, CONTRACT_MULTIPLIER};
use crate::errors::{BrokerError, StoreError};
use crate::observability::audit::AuditLogger;
use crate::types::{OrderSide, OrderStatus, PositionStatus, TradingMode};

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    if state.mode() != TradingMode::Live {
        return Ok(());
    }

    let batch = state.config.read().workers.batch_size;
    let orders = state.store.open_live_orders(batch).await?;
    if orders.is_empty() {
        return Ok(());
    }
    debug!(in_flight = orders.len(), "order poller run");

    for order in orders {
        let result = match order.status {
            OrderStatus::Pending => submit(state, &order).await,
            OrderStatus::Submitted | OrderStatus::Partial => poll(state, &order).await,
            _ => Ok(()),
        };
        match result {
            Ok(()) => {}
            Err(PollError::Store(StoreError::Conflict(what))) => {
                debug!(order_id = %order.id, what = %what, "poller lost the race — next cycle re-reads");
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "order poll failed for item");
            }
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

async fn submit(state: &Arc<AppState>, order: &Order) -> Result<(), PollError> {
    match state.broker.submit(order).await {
        Ok(broker_order_id) => {
            state
                .store
                .mark_order_submitted(&order.id, &broker_order_id)
                .await?;
            info!(order_id = %order.id, broker_order_id = %broker_order_id, "live order submitted");
            Ok(())
        }
        Err(BrokerError::Rejected { message, .. }) => {
            warn!(order_id = %order.id, reason = %message, "broker rejected order");
            state
                .store
                .transition_order(
                    &order.id,
                    &[OrderStatus::Pending],
                    OrderStatus::Rejected,
                    0,
                    None,
                )
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn poll(state: &Arc<AppState>, order: &Order) -> Result<(), PollError> {
    let Some(broker_order_id) = order.broker_order_id.as_deref() else {
        warn!(order_id = %order.id, "submitted order missing broker id — skipping");
        return Ok(());
    };

    let update = state.broker.poll(broker_order_id).await?;
    match update.status {
        OrderStatus::Filled => record_live_fill(state, order, &update).await,
        OrderStatus::Partial => {
            state
                .store
                .transition_order(
                    &order.id,
                    &[OrderStatus::Submitted, OrderStatus::Partial],
                    OrderStatus::Partial,
                    update.filled_quantity,
                    update.avg_fill_price,
                )
                .await?;
            Ok(())
        }
        status @ (OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired) => {
            state
                .store
                .transition_order(
                    &order.id,
                    &[OrderStatus::Submitted, OrderStatus::Partial],
                    status,
                    update.filled_quantity,
                    update.avg_fill_price,
                )
                .await?;
            info!(order_id = %order.id, status = %status, "live order reached terminal state");
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn record_live_fill(
    state: &Arc<AppState>,
    order: &Order,
    update: &BrokerOrderUpdate,
) -> Result<(), PollError> {
    let fill = update
        .avg_fill_price
        .or(order.limit_price)
        .unwrap_or(dec!(0.05));
    let quantity = if update.filled_quantity > 0 {
        update.filled_quantity
    } else {
        order.quantity
    };

    let trade = Trade {
        id: Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        execution_price: fill,
        quantity,
        commission: dec!(0),
        fees: dec!(0),
        total_cost: fill * Decimal::from(quantity) * CONTRACT_MULTIPLIER,
        executed_at: Utc::now(),
    };

    match order.side {
        OrderSide::Buy => {
            let position = Position {
                id: Uuid::new_v4().to_string(),
                signal_id: order.signal_id.clone(),
                symbol: order.underlying.clone(),
                direction: order.option_type,
                strike: order.strike,
                expiration: order.expiration,
                quantity,
                entry_price: fill,
                entry_time: trade.executed_at,
                current_price: Some(fill),
                unrealized_pnl: Some(dec!(0)),
                exit_price: None,
                exit_time: None,
                realized_pnl: None,
                status: PositionStatus::Open,
                high_water_mark: Some(fill),
                entry_iv: None,
                partial_exit_taken: false,
            };
            let audit = AuditLogger::trade_opened(order, &trade, &position);
            state
                .store
                .record_entry_fill(&order.id, &trade, &position, &audit)
                .await?;
            info!(order_id = %order.id, position_id = %position.id, fill = %fill, "live entry filled");
        }
        OrderSide::Sell => {
            // Exit fills close by the refactored-position linkage; without
            // it a live position cannot be closed correctly.
            let Some(position_id) = order.refactored_position_id.clone() else {
                warn!(order_id = %order.id, "live exit fill without position linkage");
                return Ok(());
            };
            let Some(position) = state.store.position_by_id(&position_id).await? else {
                warn!(order_id = %order.id, position_id = %position_id, "linked position missing");
                return Ok(());
            };
            let realized =
                (fill - position.entry_price) * Decimal::from(quantity) * CONTRACT_MULTIPLIER;
            let partial = quantity < position.quantity;
            let audit = AuditLogger::trade_closed(order, &trade, &position_id, realized);
            state
                .store
                .record_exit_fill(&order.id, &trade, &position_id, fill, realized, partial, &audit)
                .await?;
            info!(
                order_id = %order.id,
                position_id = %position_id,
                realized_pnl = %realized,
                "live exit filled"
            );
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
