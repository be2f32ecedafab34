// =============================================================================
// Paper Executor — synthetic fills for PENDING paper orders
// =============================================================================
//
// Fill model: premium = max(0.05, intrinsic + DTE · 0.10), then ±2 % uniform
// slippage. BUY fills open a position; SELL fills close (or partially close)
// the position linked via `refactored_position_id`. Order transition, trade
// insert, and position change commit in one transaction.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::{Order, Position, Trade, CONTRACT_MULTIPLIER};
use crate::errors::StoreError;
use crate::observability::audit::AuditLogger;
use crate::observability::metrics::LatencyKind;
use crate::types::{Direction, OrderSide, OrderStatus, PositionStatus, TradingMode};

/// Per-contract commission applied to simulated fills.
const PAPER_COMMISSION_PER_CONTRACT: Decimal = dec!(0.65);
/// Minimum synthetic premium.
const MIN_PREMIUM: Decimal = dec!(0.05);
/// Time value accrued per day to expiration.
const TIME_VALUE_PER_DAY: Decimal = dec!(0.10);

/// Linear intrinsic + time model shared with the position refresher. A
/// pricing stub by design; real greeks are out of scope.
pub fn model_option_price(
    spot: Decimal,
    strike: Decimal,
    right: Direction,
    expiration: NaiveDate,
    today: NaiveDate,
) -> Decimal {
    let intrinsic = match right {
        Direction::Call => (spot - strike).max(dec!(0)),
        Direction::Put => (strike - spot).max(dec!(0)),
    };
    let dte = (expiration - today).num_days().max(0);
    (intrinsic + Decimal::from(dte) * TIME_VALUE_PER_DAY).max(MIN_PREMIUM)
}

/// Apply ±2 % uniform slippage to a modeled premium.
fn with_slippage(premium: Decimal) -> Decimal {
    let slip: f64 = rand::thread_rng().gen_range(-0.02..=0.02);
    let factor = Decimal::from_f64(1.0 + slip).unwrap_or(dec!(1));
    (premium * factor).round_dp(4).max(dec!(0.01))
}

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let batch = state.config.read().workers.batch_size;
    let orders = state.store.pending_orders(TradingMode::Paper, batch).await?;
    if orders.is_empty() {
        return Ok(());
    }
    debug!(pending = orders.len(), "paper executor run");

    for order in orders {
        let started = Instant::now();
        let result = match order.side {
            OrderSide::Buy => fill_entry(state, &order).await,
            OrderSide::Sell => fill_exit(state, &order).await,
        };
        match result {
            Ok(()) => {
                state.metrics.record_latency(
                    LatencyKind::Execution,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
            }
            Err(StoreError::Conflict(what)) => {
                debug!(order_id = %order.id, what = %what, "fill lost the race — next cycle re-reads");
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "paper fill failed for item");
            }
        }
    }
    Ok(())
}

async fn fill_price_for(state: &Arc<AppState>, order: &Order) -> Decimal {
    let quote = state.market_data.get_stock_price(&order.underlying).await;
    let modeled = model_option_price(
        quote.price,
        order.strike,
        order.option_type,
        order.expiration,
        Utc::now().date_naive(),
    );
    with_slippage(modeled)
}

fn trade_for(order: &Order, fill: Decimal) -> Trade {
    let commission = PAPER_COMMISSION_PER_CONTRACT * Decimal::from(order.quantity);
    Trade {
        id: Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        execution_price: fill,
        quantity: order.quantity,
        commission,
        fees: dec!(0),
        total_cost: fill * Decimal::from(order.quantity) * CONTRACT_MULTIPLIER + commission,
        executed_at: Utc::now(),
    }
}

async fn fill_entry(state: &Arc<AppState>, order: &Order) -> Result<(), StoreError> {
    let fill = fill_price_for(state, order).await;
    let trade = trade_for(order, fill);

    let position = Position {
        id: Uuid::new_v4().to_string(),
        signal_id: order.signal_id.clone(),
        symbol: order.underlying.clone(),
        direction: order.option_type,
        strike: order.strike,
        expiration: order.expiration,
        quantity: order.quantity,
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

    info!(
        order_id = %order.id,
        position_id = %position.id,
        symbol = %order.underlying,
        fill = %fill,
        quantity = order.quantity,
        "paper entry filled — position opened"
    );
    Ok(())
}

async fn fill_exit(state: &Arc<AppState>, order: &Order) -> Result<(), StoreError> {
    let Some(position_id) = order.refactored_position_id.clone() else {
        warn!(order_id = %order.id, "exit order has no linked position — cancelling");
        return state
            .store
            .transition_order(
                &order.id,
                &[OrderStatus::Pending],
                OrderStatus::Rejected,
                0,
                None,
            )
            .await;
    };

    let Some(position) = state.store.position_by_id(&position_id).await? else {
        warn!(order_id = %order.id, position_id = %position_id, "linked position missing — cancelling");
        return state
            .store
            .transition_order(
                &order.id,
                &[OrderStatus::Pending],
                OrderStatus::Cancelled,
                0,
                None,
            )
            .await;
    };

    let fill = fill_price_for(state, order).await;
    let trade = trade_for(order, fill);
    let realized = (fill - position.entry_price)
        * Decimal::from(order.quantity)
        * CONTRACT_MULTIPLIER;
    let partial = order.exit_action.as_deref() == Some(crate::orchestrator::exit::CLOSE_PARTIAL)
        || order.quantity < position.quantity;

    let audit = AuditLogger::trade_closed(order, &trade, &position_id, realized);
    state
        .store
        .record_exit_fill(&order.id, &trade, &position_id, fill, realized, partial, &audit)
        .await?;

    info!(
        order_id = %order.id,
        position_id = %position_id,
        fill = %fill,
        realized_pnl = %realized,
        partial,
        "paper exit filled"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use crate::types::{OrderType, TimeInForce};

    #[test]
    fn model_price_is_intrinsic_plus_time() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        let expiration = NaiveDate::from_ymd_opt(2026, 8, 21).unwrap(); // 18 DTE

        // ITM call: (502.15 - 500) + 18 * 0.10 = 3.95
        let price = model_option_price(
            dec!(502.15),
            dec!(500),
            Direction::Call,
            expiration,
            today,
        );
        assert_eq!(price, dec!(3.95));

        // Deep OTM put floors at 0.05.
        let otm = model_option_price(dec!(502.15), dec!(400), Direction::Put, today, today);
        assert_eq!(otm, MIN_PREMIUM);
    }

    #[test]
    fn slippage_stays_within_two_percent() {
        for _ in 0..200 {
            let fill = with_slippage(dec!(5.00));
            assert!(fill >= dec!(4.8999), "fill {fill} below band");
            assert!(fill <= dec!(5.1001), "fill {fill} above band");
        }
    }

    async fn state_with_pending_order() -> Arc<AppState> {
        let state = Arc::new(AppState::with_store(
            EngineConfig::default(),
            Store::open_in_memory().unwrap(),
        ));
        state
            .pipeline
            .process_payload(
                "corr-pe",
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
        crate::workers::order_creator::run_once(&state)
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn buy_fill_opens_position_with_modeled_premium() {
        let state = state_with_pending_order().await;
        run_once(&state).await.unwrap();

        let positions = state.store.open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        let position = &positions[0];
        assert_eq!(position.symbol, "SPY");
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.high_water_mark, Some(position.entry_price));
        // Demo SPY trades near 500 and the strike is 500, so the premium is
        // dominated by DTE·0.10 and slippage; sanity-band it.
        assert!(position.entry_price >= dec!(0.05));
        assert!(position.entry_price < dec!(20));

        // Order is terminal with matching fill bookkeeping.
        let orders = state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap();
        assert!(orders.is_empty());

        // trade_opened audit exists for the signal.
        let audit = state
            .store
            .query_audit(&crate::store::AuditFilter {
                signal_id: Some(position.signal_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(audit
            .iter()
            .any(|entry| entry.event == crate::types::AuditEvent::TradeOpened));
    }

    #[tokio::test]
    async fn sell_fill_closes_linked_position() {
        let state = state_with_pending_order().await;
        run_once(&state).await.unwrap();
        let position = state.store.open_positions().await.unwrap().remove(0);

        // Hand-built exit order linked through refactored_position_id.
        let now = Utc::now();
        let exit = Order {
            id: Uuid::new_v4().to_string(),
            signal_id: position.signal_id.clone(),
            client_order_id: Uuid::new_v4().to_string(),
            broker_order_id: None,
            underlying: position.symbol.clone(),
            option_symbol: "SPY261218C00500000".into(),
            strike: position.strike,
            expiration: position.expiration,
            option_type: position.direction,
            side: OrderSide::Sell,
            quantity: position.quantity,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Day,
            mode: TradingMode::Paper,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            avg_fill_price: None,
            exit_action: Some(crate::orchestrator::exit::CLOSE_FULL.to_string()),
            exit_quantity: Some(position.quantity),
            refactored_position_id: Some(position.id.clone()),
            created_at: now,
            updated_at: now,
        };
        state.store.create_exit_order(&exit).await.unwrap();

        run_once(&state).await.unwrap();

        let closed = state
            .store
            .position_by_id(&position.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!(closed.exit_time.is_some());
        let realized = closed.realized_pnl.unwrap();
        let exit_price = closed.exit_price.unwrap();
        // Realized equals (exit − entry) · qty · 100 under the model.
        let expected = (exit_price - closed.entry_price)
            * Decimal::from(exit.quantity)
            * CONTRACT_MULTIPLIER;
        assert_eq!(realized, expected);

        assert!(state.store.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlinked_exit_order_is_rejected_not_filled() {
        let state = state_with_pending_order().await;
        run_once(&state).await.unwrap();
        let position = state.store.open_positions().await.unwrap().remove(0);

        let now = Utc::now();
        let orphan = Order {
            id: Uuid::new_v4().to_string(),
            signal_id: position.signal_id.clone(),
            client_order_id: Uuid::new_v4().to_string(),
            broker_order_id: None,
            underlying: position.symbol.clone(),
            option_symbol: "SPY261218C00500000".into(),
            strike: position.strike,
            expiration: position.expiration,
            option_type: position.direction,
            side: OrderSide::Sell,
            quantity: position.quantity,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Day,
            mode: TradingMode::Paper,
            status: OrderStatus::Pending,
            filled_quantity: 0,
            avg_fill_price: None,
            exit_action: Some(crate::orchestrator::exit::CLOSE_FULL.to_string()),
            exit_quantity: Some(position.quantity),
            refactored_position_id: None,
            created_at: now,
            updated_at: now,
        };
        state.store.create_exit_order(&orphan).await.unwrap();

        run_once(&state).await.unwrap();

        let order = state.store.order_by_id(&orphan.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        // Position untouched.
        assert_eq!(state.store.open_positions().await.unwrap().len(), 1);
    }
}
