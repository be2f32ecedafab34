// =============================================================================
// Exit Monitor — evaluate exit rules and emit exit orders
// =============================================================================
//
// Walks every open position with a known mark, runs the exit ladder, and for
// CRITICAL alerts creates a SELL order (market when IMMEDIATE, else limit at
// the current premium) — unless an exit order is already in flight for the
// position, which keeps at most one live exit per position. Positions the
// ladder holds get a hold evaluation for advisory logging.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::{Decision, ExitAlert, Order, Position, TradePlan};
use crate::orchestrator::exit::{evaluate_exit, ExitInputs};
use crate::orchestrator::hold::{evaluate_hold, HoldAction, HoldInputs};
use crate::orchestrator::plan_from_exit_rules;
use crate::types::{
    AlertPriority, AuditEvent, DecisionType, DecisionVerdict, OrderSide, OrderStatus, OrderType,
    TimeInForce,
};

use super::GEX_TIMEFRAME;

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let mode = state.mode();
    let limits = state.store.active_risk_limits(mode).await?;
    let alerts = collect_alerts(state).await?;
    if alerts.is_empty() {
        return Ok(());
    }

    for alert in &alerts {
        if alert.priority != AlertPriority::Critical {
            debug!(
                position_id = %alert.position_id,
                rule = %alert.rule,
                priority = %alert.priority,
                "non-critical exit alert — advisory only"
            );
            continue;
        }
        if !limits.auto_close_enabled {
            warn!(
                position_id = %alert.position_id,
                rule = %alert.rule,
                "critical exit alert but auto-close is disabled"
            );
            continue;
        }
        if state.store.has_pending_exit_order(&alert.position_id).await? {
            debug!(
                position_id = %alert.position_id,
                "exit order already in flight — skipping"
            );
            continue;
        }

        let Some(position) = state.store.position_by_id(&alert.position_id).await? else {
            continue;
        };

        let order = build_exit_order(state, &position, alert);
        let decision = exit_decision(&position, alert);
        let audit = exit_decision_audit(&position, &decision);

        if let Err(e) = state.store.insert_exit_decision(&decision, &audit).await {
            warn!(position_id = %position.id, error = %e, "exit decision write failed");
        }
        match state.store.create_exit_order(&order).await {
            Ok(()) => {
                state.note_order_activity();
                info!(
                    position_id = %position.id,
                    order_id = %order.id,
                    rule = %alert.rule,
                    urgency = %alert.urgency,
                    order_type = %order.order_type,
                    quantity = order.quantity,
                    "exit order created"
                );
            }
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "exit order insert failed");
            }
        }
    }
    Ok(())
}

/// Evaluate every open, priced position and return alerts sorted by
/// priority (CRITICAL first). Shared with the `/exit-signals` surface.
pub async fn collect_alerts(state: &Arc<AppState>) -> anyhow::Result<Vec<ExitAlert>> {
    let mode = state.mode();
    let exit_rules = state.store.active_exit_rules(mode).await?;
    let context = state.context_cache.current().await;
    let positions = state.store.open_positions_with_price().await?;
    if positions.is_empty() {
        return Ok(Vec::new());
    }
    debug!(open = positions.len(), "exit monitor evaluating positions");

    let now = Utc::now();
    let mut alerts = Vec::new();

    for position in &positions {
        let gex = state
            .store
            .latest_gex_summary(&position.symbol, GEX_TIMEFRAME)
            .await
            .unwrap_or_default();
        let underlying = state
            .market_data
            .get_stock_price(&position.symbol)
            .await
            .price;
        let plan = plan_for(state, position, &exit_rules).await;

        let alert = evaluate_exit(&ExitInputs {
            position,
            plan: &plan,
            context: context.as_ref(),
            gex: gex.as_ref(),
            underlying_price: Some(underlying),
            now,
        });

        match alert {
            Some(alert) => alerts.push(alert),
            None => {
                // The ladder holds; run the softer hold evaluation for its
                // advisory value.
                let assessment = evaluate_hold(&HoldInputs {
                    position,
                    context: context.as_ref(),
                    gex: gex.as_ref(),
                    underlying_price: Some(underlying),
                    now,
                });
                if assessment.action != HoldAction::Hold {
                    info!(
                        position_id = %position.id,
                        hold_confidence = assessment.hold_confidence,
                        action = ?assessment.action,
                        warnings = assessment.warnings.len(),
                        "hold evaluation recommends action"
                    );
                }
            }
        }
    }

    alerts.sort_by_key(|alert| alert.priority);
    Ok(alerts)
}

async fn plan_for(
    state: &Arc<AppState>,
    position: &Position,
    exit_rules: &crate::domain::ExitRules,
) -> TradePlan {
    if let Ok(Some(decision)) = state.store.entry_decision(&position.signal_id).await {
        if let Some(plan) = decision.calculations.get("trade_plan") {
            if let Ok(plan) = serde_json::from_value::<TradePlan>(plan.clone()) {
                return plan;
            }
        }
    }
    plan_from_exit_rules(exit_rules)
}

fn build_exit_order(state: &Arc<AppState>, position: &Position, alert: &ExitAlert) -> Order {
    let now = Utc::now();
    let order_type = alert.urgency.order_type();
    let limit_price = match order_type {
        OrderType::Market => None,
        OrderType::Limit => alert.current_price.or(position.current_price),
    };

    Order {
        id: Uuid::new_v4().to_string(),
        signal_id: position.signal_id.clone(),
        client_order_id: Uuid::new_v4().to_string(),
        broker_order_id: None,
        underlying: position.symbol.clone(),
        option_symbol: crate::domain::occ_symbol(
            &position.symbol,
            position.expiration,
            position.direction,
            position.strike,
        ),
        strike: position.strike,
        expiration: position.expiration,
        option_type: position.direction,
        side: OrderSide::Sell,
        quantity: alert.quantity.min(position.quantity).max(1),
        order_type,
        limit_price,
        time_in_force: TimeInForce::Day,
        mode: state.mode(),
        status: OrderStatus::Pending,
        filled_quantity: 0,
        avg_fill_price: None,
        exit_action: Some(alert.action.clone()),
        exit_quantity: Some(alert.quantity),
        refactored_position_id: Some(position.id.clone()),
        created_at: now,
        updated_at: now,
    }
}

fn exit_decision(position: &Position, alert: &ExitAlert) -> Decision {
    Decision {
        id: Uuid::new_v4().to_string(),
        signal_id: position.signal_id.clone(),
        position_id: Some(position.id.clone()),
        decision_type: DecisionType::Exit,
        decision: DecisionVerdict::Exit,
        confidence: 100.0,
        position_size: alert.quantity,
        reasoning: vec![crate::domain::RuleHit {
            rule: alert.rule.clone(),
            adjustment: 0.0,
            reason: alert.reason.clone(),
        }],
        calculations: json!({
            "action": alert.action,
            "urgency": alert.urgency,
            "priority": alert.priority,
            "current_price": alert.current_price,
        }),
        context_snapshot: None,
        gex_snapshot: None,
        created_at: Utc::now(),
    }
}

fn exit_decision_audit(position: &Position, decision: &Decision) -> crate::domain::AuditLogEntry {
    crate::domain::AuditLogEntry {
        id: Uuid::new_v4().to_string(),
        event: AuditEvent::DecisionMade,
        signal_id: Some(position.signal_id.clone()),
        symbol: Some(position.symbol.clone()),
        correlation_id: None,
        decision_type: Some(DecisionType::Exit),
        decision: Some(DecisionVerdict::Exit),
        details: json!({
            "position_id": position.id,
            "rule": decision.reasoning.first().map(|hit| hit.rule.clone()),
        }),
        timestamp: Utc::now(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use crate::types::{Direction, PositionStatus, TradingMode};

    fn stopped_out_position() -> Position {
        // Entry 5.00 with the default 50% stop at 2.50; marked at 2.40.
        Position {
            id: Uuid::new_v4().to_string(),
            signal_id: Uuid::new_v4().to_string(),
            symbol: "SPY".into(),
            direction: Direction::Call,
            strike: dec!(500),
            expiration: Utc::now().date_naive() + chrono::Duration::days(14),
            quantity: 2,
            entry_price: dec!(5.00),
            entry_time: Utc::now() - chrono::Duration::hours(5),
            current_price: Some(dec!(2.40)),
            unrealized_pnl: Some(dec!(-520)),
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            high_water_mark: Some(dec!(5.00)),
            entry_iv: None,
            partial_exit_taken: false,
        }
    }

    async fn test_state() -> Arc<AppState> {
        Arc::new(AppState::with_store(
            EngineConfig::default(),
            Store::open_in_memory().unwrap(),
        ))
    }

    #[tokio::test]
    async fn stop_loss_creates_market_sell_order() {
        let state = test_state().await;
        let position = stopped_out_position();
        state.store.insert_position(&position).await.unwrap();

        run_once(&state).await.unwrap();

        let pending = state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let order = &pending[0];
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.order_type, OrderType::Market);
        assert_eq!(order.refactored_position_id.as_deref(), Some(position.id.as_str()));
        assert_eq!(order.exit_action.as_deref(), Some("CLOSE_FULL"));
        assert_eq!(order.quantity, 2);
    }

    #[tokio::test]
    async fn one_in_flight_exit_per_position() {
        let state = test_state().await;
        let position = stopped_out_position();
        state.store.insert_position(&position).await.unwrap();

        run_once(&state).await.unwrap();
        run_once(&state).await.unwrap();

        let pending = state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn auto_close_disabled_suppresses_orders() {
        let state = test_state().await;
        state
            .store
            .upsert_risk_limits(
                TradingMode::Paper,
                &crate::store::RiskLimitsPatch {
                    auto_close_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let position = stopped_out_position();
        state.store.insert_position(&position).await.unwrap();

        run_once(&state).await.unwrap();

        assert!(state
            .store
            .pending_orders(TradingMode::Paper, 10)
            .await
            .unwrap()
            .is_empty());
        // But the alert still surfaces for /exit-signals.
        let alerts = collect_alerts(&state).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, "stop_loss");
    }

    #[tokio::test]
    async fn alerts_sort_critical_first() {
        let state = test_state().await;
        // Critical: stop-loss.
        state
            .store
            .insert_position(&stopped_out_position())
            .await
            .unwrap();
        // Medium: stale trade with small gain.
        let mut stale = stopped_out_position();
        stale.signal_id = Uuid::new_v4().to_string();
        stale.current_price = Some(dec!(5.20));
        stale.entry_time = Utc::now() - chrono::Duration::hours(200);
        stale.partial_exit_taken = true;
        stale.strike = dec!(490); // keep theta quiet: mostly intrinsic
        state.store.insert_position(&stale).await.unwrap();

        let alerts = collect_alerts(&state).await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].priority, AlertPriority::Critical);
        assert_eq!(alerts[1].priority, AlertPriority::Medium);
    }
}
