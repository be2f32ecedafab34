// =============================================================================
// Signal Processor — entry orchestration for pending signals
// =============================================================================
//
// Fetches signals with no validation result (oldest first, capped batch),
// runs the entry branch of the orchestrator against cached context, the
// latest GEX summary, and current risk state, then persists the decision
// atomically. The guarded write makes the decision at-most-once: a conflict
// means another worker already decided and this one moves on.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::{Decision, GexSummary, Signal, ValidationResult};
use crate::errors::StoreError;
use crate::observability::audit::AuditLogger;
use crate::observability::metrics::LatencyKind;
use crate::orchestrator::entry::{evaluate_entry, EntryEvaluation, EntryInputs};
use crate::types::{DecisionType, DecisionVerdict};

use super::GEX_TIMEFRAME;

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let (batch, mode, risk_config, sizing) = {
        let cfg = state.config.read();
        (
            cfg.workers.batch_size,
            cfg.mode,
            cfg.risk.clone(),
            cfg.sizing.clone(),
        )
    };

    let signals = state.store.unprocessed_signals(batch).await?;
    if signals.is_empty() {
        return Ok(());
    }

    let context = state.context_cache.current().await;
    let risk_limits = state.store.active_risk_limits(mode).await?;
    let open_positions = state.store.count_open_positions().await?;
    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
        .and_utc();
    let realized_today = state.store.realized_pnl_since(midnight).await?;

    debug!(
        pending = signals.len(),
        open_positions,
        "signal processor run"
    );

    // Entries approved in this run count against the position cap before
    // their fills land.
    let mut approved_in_run: u32 = 0;

    for signal in signals {
        let started = Instant::now();

        let gex = match state
            .store
            .latest_gex_summary(&signal.symbol, GEX_TIMEFRAME)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "GEX lookup failed — deciding without it");
                None
            }
        };

        let evaluation = evaluate_entry(&EntryInputs {
            signal: &signal,
            context: context.as_ref(),
            gex: gex.as_ref(),
            risk_limits: &risk_limits,
            risk_config: &risk_config,
            sizing: &sizing,
            open_positions: open_positions + approved_in_run,
            realized_pnl_today: realized_today,
        });

        let decision = build_decision(&signal, &evaluation, context.as_ref(), gex.as_ref());
        let result = ValidationResult {
            valid: evaluation.verdict == DecisionVerdict::Enter,
            confidence: evaluation.confidence,
            reasons: evaluation
                .reasoning
                .iter()
                .map(|hit| hit.reason.clone())
                .collect(),
        };
        let audit = AuditLogger::decision_made(&signal, &decision);

        let mut write = state
            .store
            .finalize_entry_decision(&signal.id, &result, &decision, &audit)
            .await;
        if matches!(&write, Err(e) if e.is_retryable()) {
            warn!(signal_id = %signal.id, "transient store error — retrying decision write");
            write = state
                .store
                .finalize_entry_decision(&signal.id, &result, &decision, &audit)
                .await;
        }

        match write {
            Ok(()) => {
                if evaluation.verdict == DecisionVerdict::Enter {
                    approved_in_run += 1;
                }
                state.metrics.record_latency(
                    LatencyKind::Decision,
                    started.elapsed().as_secs_f64() * 1000.0,
                );
                info!(
                    signal_id = %signal.id,
                    symbol = %signal.symbol,
                    verdict = %evaluation.verdict,
                    confidence = evaluation.confidence,
                    quantity = evaluation.quantity,
                    "entry decision persisted"
                );
            }
            Err(StoreError::Conflict(_)) => {
                debug!(signal_id = %signal.id, "signal already decided elsewhere — skipping");
            }
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "decision write failed for item");
            }
        }
    }
    Ok(())
}

fn build_decision(
    signal: &Signal,
    evaluation: &EntryEvaluation,
    context: Option<&crate::domain::ContextSnapshot>,
    gex: Option<&GexSummary>,
) -> Decision {
    let mut calculations = evaluation.calculations.clone();
    if let Some(plan) = &evaluation.trade_plan {
        if let Some(obj) = calculations.as_object_mut() {
            obj.insert(
                "trade_plan".to_string(),
                serde_json::to_value(plan).expect("trade plan serializes"),
            );
        }
    }

    Decision {
        id: Uuid::new_v4().to_string(),
        signal_id: signal.id.clone(),
        position_id: None,
        decision_type: DecisionType::Entry,
        decision: evaluation.verdict,
        confidence: evaluation.confidence,
        position_size: evaluation.quantity,
        reasoning: evaluation.reasoning.clone(),
        calculations,
        context_snapshot: context.map(|c| serde_json::to_value(c).unwrap_or(json!({}))),
        gex_snapshot: gex.map(|g| serde_json::to_value(g).unwrap_or(json!({}))),
        created_at: Utc::now(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::{ContextSnapshot, TradePlan};
    use crate::store::Store;
    use crate::types::MarketBias;

    async fn seeded_state(payload: serde_json::Value) -> (Arc<AppState>, Signal) {
        let state = Arc::new(AppState::with_store(
            EngineConfig::default(),
            Store::open_in_memory().unwrap(),
        ));
        let signal = state
            .pipeline
            .process_payload("corr-t", payload)
            .await
            .unwrap();
        (state, signal)
    }

    fn bullish_payload() -> serde_json::Value {
        json!({
            "trend": "BULLISH",
            "ticker": "SPY",
            "current_price": 502.15,
            "score": 8.5,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    #[tokio::test]
    async fn pending_signal_gets_an_entry_decision() {
        let (state, signal) = seeded_state(bullish_payload()).await;
        // Favorable context so the decision lands ENTER.
        state
            .store
            .insert_context_snapshot(&ContextSnapshot::new(
                18.0,
                MarketBias::Bullish,
                MarketBias::Bullish,
                "TRENDING",
                80.0,
            ))
            .await
            .unwrap();

        run_once(&state).await.unwrap();

        let stored = state.store.signal_by_id(&signal.id).await.unwrap().unwrap();
        let validation = stored.validation_result.unwrap();
        assert!(validation.valid);

        let decision = state
            .store
            .entry_decision(&signal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.decision, DecisionVerdict::Enter);
        assert!(decision.confidence >= 35.0);
        // The trade plan rides along in calculations for the exit monitor.
        let plan: TradePlan =
            serde_json::from_value(decision.calculations["trade_plan"].clone()).unwrap();
        assert!(plan.stop_loss_pct > 0.0);

        // Second run finds nothing to do.
        run_once(&state).await.unwrap();
        assert!(state.store.unprocessed_signals(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn high_vix_context_rejects_with_vix_reason() {
        let (state, signal) = seeded_state(bullish_payload()).await;
        {
            let mut cfg = state.config.write();
            cfg.risk.vix_hard_reject = true;
            cfg.risk.max_vix_for_entry = 30.0;
        }
        state
            .store
            .insert_context_snapshot(&ContextSnapshot::new(
                35.0,
                MarketBias::Bullish,
                MarketBias::Bullish,
                "VOLATILE",
                60.0,
            ))
            .await
            .unwrap();

        run_once(&state).await.unwrap();

        let stored = state.store.signal_by_id(&signal.id).await.unwrap().unwrap();
        let validation = stored.validation_result.unwrap();
        assert!(!validation.valid);
        assert!(validation.reasons.iter().any(|r| r.contains("VIX")));

        let decision = state
            .store
            .entry_decision(&signal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.decision, DecisionVerdict::Reject);
        // No order candidate appears.
        assert!(state
            .store
            .approved_signals_without_orders(10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_context_and_gex_still_decides() {
        let (state, signal) = seeded_state(bullish_payload()).await;

        run_once(&state).await.unwrap();

        // Base confidence 50 with no adjustments clears the threshold.
        let decision = state
            .store
            .entry_decision(&signal.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.decision, DecisionVerdict::Enter);
        assert!((decision.confidence - 50.0).abs() < 1e-9);
        assert!(decision.context_snapshot.is_none());
    }
}
