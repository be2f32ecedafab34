// =============================================================================
// Entry orchestration — ordered rule stack with confidence scoring
// =============================================================================
//
// Rules run in a fixed order; each records its adjustment with a reason.
// Hard gates (risk caps, a high-confidence opposing regime, the VIX
// hard-reject) short-circuit with REJECT regardless of the running score.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::debug;

use crate::config::{RiskConfig, SizingConfig};
use crate::domain::{ContextSnapshot, GexSummary, OptionParams, RiskLimits, RuleHit, Signal, TradePlan};
use crate::types::{DealerPosition, DecisionVerdict, Direction};

use super::{
    default_trade_plan, BASE_CONFIDENCE, HIGH_CONVICTION_STRENGTH, MIN_CONFIDENCE_THRESHOLD,
    PC_RATIO_HIGH, PC_RATIO_LOW, WALL_PROXIMITY_FRACTION,
};

/// Everything the entry branch reads; assembled by the signal processor.
pub struct EntryInputs<'a> {
    pub signal: &'a Signal,
    pub context: Option<&'a ContextSnapshot>,
    pub gex: Option<&'a GexSummary>,
    pub risk_limits: &'a RiskLimits,
    pub risk_config: &'a RiskConfig,
    pub sizing: &'a SizingConfig,
    pub open_positions: u32,
    pub realized_pnl_today: Decimal,
}

/// Outcome of the entry branch.
#[derive(Debug, Clone)]
pub struct EntryEvaluation {
    pub verdict: DecisionVerdict,
    pub confidence: f64,
    pub quantity: u32,
    pub reasoning: Vec<RuleHit>,
    pub trade_plan: Option<TradePlan>,
    pub calculations: serde_json::Value,
}

fn hit(reasoning: &mut Vec<RuleHit>, rule: &str, adjustment: f64, reason: impl Into<String>) {
    reasoning.push(RuleHit {
        rule: rule.to_string(),
        adjustment,
        reason: reason.into(),
    });
}

fn reject(
    reasoning: Vec<RuleHit>,
    confidence: f64,
    calculations: serde_json::Value,
) -> EntryEvaluation {
    EntryEvaluation {
        verdict: DecisionVerdict::Reject,
        confidence: confidence.clamp(0.0, 100.0),
        quantity: 0,
        reasoning,
        trade_plan: None,
        calculations,
    }
}

/// Evaluate the entry branch for one pending signal.
pub fn evaluate_entry(inputs: &EntryInputs<'_>) -> EntryEvaluation {
    let signal = inputs.signal;
    let direction = signal.direction;
    let mut reasoning: Vec<RuleHit> = Vec::new();
    let mut confidence = BASE_CONFIDENCE;
    let mut qty_multiplier: f64 = 1.0;
    let mut wider_stops = false;
    let mut conflict_flags: Vec<String> = Vec::new();

    let params = OptionParams::from_metadata(&signal.metadata);
    let underlying = params.as_ref().map(|p| p.underlying_price);
    let dte = params
        .as_ref()
        .map(|p| (p.expiration - signal.timestamp.date_naive()).num_days());

    // ── Hard risk gates ─────────────────────────────────────────────────
    if inputs.open_positions >= inputs.risk_limits.max_open_positions {
        hit(
            &mut reasoning,
            "risk.max_open_positions",
            0.0,
            format!(
                "{} open positions at cap {}",
                inputs.open_positions, inputs.risk_limits.max_open_positions
            ),
        );
        return reject(reasoning, 0.0, json!({"gate": "MAX_OPEN_POSITIONS"}));
    }
    if inputs.realized_pnl_today <= -inputs.risk_limits.max_daily_loss {
        hit(
            &mut reasoning,
            "risk.max_daily_loss",
            0.0,
            format!(
                "daily realized P&L {} breaches -{}",
                inputs.realized_pnl_today, inputs.risk_limits.max_daily_loss
            ),
        );
        return reject(reasoning, 0.0, json!({"gate": "MAX_DAILY_LOSS"}));
    }

    // ── 1. Direction/bias alignment with GEX overall bias: ±20 ──────────
    if let Some(gex) = inputs.gex {
        if gex.direction.aligns_with(direction) {
            confidence += 20.0;
            hit(
                &mut reasoning,
                "gex.bias_alignment",
                20.0,
                format!("{} bias supports {direction}", gex.direction),
            );
        } else if gex.direction.opposes(direction) {
            confidence -= 20.0;
            hit(
                &mut reasoning,
                "gex.bias_alignment",
                -20.0,
                format!("{} bias opposes {direction}", gex.direction),
            );
        }

        // ── 2. GEX flip matching direction: ±15, quantity ±25 % ─────────
        if gex.flip_detected {
            if let Some(flip) = gex.flip_direction {
                if flip.aligns_with(direction) {
                    confidence += 15.0;
                    qty_multiplier += 0.25;
                    hit(
                        &mut reasoning,
                        "gex.flip",
                        15.0,
                        format!("gamma flip toward {flip} confirms {direction}"),
                    );
                } else if flip.opposes(direction) {
                    confidence -= 15.0;
                    qty_multiplier -= 0.25;
                    hit(
                        &mut reasoning,
                        "gex.flip",
                        -15.0,
                        format!("gamma flip toward {flip} fights {direction}"),
                    );
                }
            }
        }

        // ── 3. Zero-gamma breakout with HIGH conviction: +18 / −12 ──────
        if let (Some(zero_gamma), Some(price)) = (gex.zero_gamma_level, underlying) {
            if gex.strength.abs() >= HIGH_CONVICTION_STRENGTH && !zero_gamma.is_zero() {
                let above = price > zero_gamma;
                let aligned = matches!(
                    (direction, above),
                    (Direction::Call, true) | (Direction::Put, false)
                );
                if aligned {
                    confidence += 18.0;
                    hit(
                        &mut reasoning,
                        "gex.zero_gamma_breakout",
                        18.0,
                        format!("price {price} on the {direction} side of zero gamma {zero_gamma}"),
                    );
                } else {
                    confidence -= 12.0;
                    hit(
                        &mut reasoning,
                        "gex.zero_gamma_breakout",
                        -12.0,
                        format!("price {price} on the wrong side of zero gamma {zero_gamma}"),
                    );
                }
            }
        }

        // ── 4. Max-pain magnet: +12 aligned / −15 opposed ───────────────
        if let (Some(max_pain), Some(price)) = (gex.max_pain, underlying) {
            if !price.is_zero() {
                let distance = ((max_pain - price) / price).to_f64().unwrap_or(0.0);
                // Inside 0.2 % the magnet is spent.
                if distance.abs() >= 0.002 {
                    let pull_up = distance > 0.0;
                    let aligned = matches!(
                        (direction, pull_up),
                        (Direction::Call, true) | (Direction::Put, false)
                    );
                    if aligned {
                        confidence += 12.0;
                        hit(
                            &mut reasoning,
                            "gex.max_pain",
                            12.0,
                            format!("max pain {max_pain} pulls price toward the {direction}"),
                        );
                    } else {
                        confidence -= 15.0;
                        hit(
                            &mut reasoning,
                            "gex.max_pain",
                            -15.0,
                            format!("max pain {max_pain} pulls price against the {direction}"),
                        );
                    }
                    if distance.abs() >= 0.01 {
                        if let Some(dte) = dte {
                            if dte <= 3 {
                                conflict_flags.push("MAX_PAIN_MAGNET_NEAR_EXPIRY".to_string());
                            }
                        }
                    }
                }
            }
        }

        // ── 5. P/C-ratio extreme contrarian: ±10 ────────────────────────
        if let Some(pc) = gex.pc_ratio {
            if pc >= PC_RATIO_HIGH {
                // Crowded puts: contrarian bullish.
                let adj = if direction == Direction::Call { 10.0 } else { -10.0 };
                confidence += adj;
                hit(
                    &mut reasoning,
                    "gex.pc_ratio",
                    adj,
                    format!("P/C {pc:.2} is put-heavy — contrarian bullish"),
                );
            } else if pc <= PC_RATIO_LOW {
                let adj = if direction == Direction::Put { 10.0 } else { -10.0 };
                confidence += adj;
                hit(
                    &mut reasoning,
                    "gex.pc_ratio",
                    adj,
                    format!("P/C {pc:.2} is call-heavy — contrarian bearish"),
                );
            }
        }
    }

    // ── 6. Market-regime alignment: ±15·confidence/100, hard oppose ─────
    if let Some(ctx) = inputs.context {
        let magnitude = 15.0 * ctx.regime_confidence / 100.0;
        if ctx.bias.opposes(direction) {
            if ctx.regime_confidence >= 70.0 {
                hit(
                    &mut reasoning,
                    "context.regime",
                    -magnitude,
                    format!(
                        "{} regime at {:.0}% confidence opposes {direction}",
                        ctx.regime, ctx.regime_confidence
                    ),
                );
                return reject(
                    reasoning,
                    confidence - magnitude,
                    json!({"gate": "OPPOSING_REGIME", "regime": ctx.regime}),
                );
            }
            confidence -= magnitude;
            hit(
                &mut reasoning,
                "context.regime",
                -magnitude,
                format!("{} regime leans against {direction}", ctx.regime),
            );
        } else if ctx.bias.aligns_with(direction) {
            confidence += magnitude;
            hit(
                &mut reasoning,
                "context.regime",
                magnitude,
                format!("{} regime supports {direction}", ctx.regime),
            );
        }
    }

    // ── 7. GEX-wall proximity with direction polarity: ±10 / ±8 ─────────
    if let (Some(gex), Some(price)) = (inputs.gex, underlying) {
        let near = |wall: Decimal| -> bool {
            if wall.is_zero() {
                return false;
            }
            ((price - wall) / wall)
                .to_f64()
                .map(|d| d.abs() <= WALL_PROXIMITY_FRACTION)
                .unwrap_or(false)
        };
        match direction {
            Direction::Call => {
                if let Some(call_wall) = gex.call_wall {
                    if near(call_wall) {
                        confidence -= 10.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            -10.0,
                            format!("price {price} pressed into call wall {call_wall}"),
                        );
                    }
                }
                if let Some(put_wall) = gex.put_wall {
                    if near(put_wall) {
                        confidence += 8.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            8.0,
                            format!("price {price} bouncing off put wall {put_wall}"),
                        );
                    }
                }
            }
            Direction::Put => {
                if let Some(put_wall) = gex.put_wall {
                    if near(put_wall) {
                        confidence -= 10.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            -10.0,
                            format!("price {price} pressed into put wall {put_wall}"),
                        );
                    }
                }
                if let Some(call_wall) = gex.call_wall {
                    if near(call_wall) {
                        confidence += 8.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            8.0,
                            format!("price {price} fading from call wall {call_wall}"),
                        );
                    }
                }
            }
        }

        // ── 8. Dealer short gamma: smaller size, wider stops ────────────
        if gex.dealer_position == DealerPosition::ShortGamma {
            qty_multiplier *= 0.75;
            wider_stops = true;
            hit(
                &mut reasoning,
                "gex.dealer_position",
                0.0,
                "dealers short gamma — reducing size 25% and widening stops",
            );
        }
    }

    // ── VIX gate ────────────────────────────────────────────────────────
    let vix = inputs.context.map(|c| c.vix);
    if let Some(vix) = vix {
        if vix > inputs.risk_config.max_vix_for_entry {
            if inputs.risk_config.vix_hard_reject {
                hit(
                    &mut reasoning,
                    "risk.vix",
                    0.0,
                    format!(
                        "VIX {vix:.1} above cap {:.1}",
                        inputs.risk_config.max_vix_for_entry
                    ),
                );
                return reject(
                    reasoning,
                    confidence,
                    json!({"gate": "VIX", "vix": vix}),
                );
            }
            qty_multiplier *= inputs.risk_config.vix_position_size_reduction;
            hit(
                &mut reasoning,
                "risk.vix",
                0.0,
                format!(
                    "VIX {vix:.1} above cap {:.1} — size reduced",
                    inputs.risk_config.max_vix_for_entry
                ),
            );
        }
    }

    // ── Final score & sizing ────────────────────────────────────────────
    let confidence = confidence.clamp(0.0, 100.0);
    let base_quantity = params
        .as_ref()
        .map(|p| p.quantity)
        .unwrap_or(inputs.sizing.base_quantity);
    let quantity = ((base_quantity as f64 * qty_multiplier).round() as i64)
        .clamp(inputs.sizing.min_size as i64, inputs.sizing.max_size as i64)
        as u32;

    let calculations = json!({
        "base_confidence": BASE_CONFIDENCE,
        "qty_multiplier": qty_multiplier,
        "base_quantity": base_quantity,
        "wider_stops": wider_stops,
        "conflict_flags": conflict_flags,
        "vix": vix,
        "dte": dte,
        "underlying_price": underlying,
    });

    if confidence < MIN_CONFIDENCE_THRESHOLD {
        debug!(
            signal_id = %signal.id,
            confidence,
            "entry rejected below confidence threshold"
        );
        let mut evaluation = reject(reasoning, confidence, calculations);
        evaluation
            .reasoning
            .push(RuleHit {
                rule: "confidence.threshold".to_string(),
                adjustment: 0.0,
                reason: format!(
                    "final confidence {confidence:.1} below threshold {MIN_CONFIDENCE_THRESHOLD}"
                ),
            });
        return evaluation;
    }

    EntryEvaluation {
        verdict: DecisionVerdict::Enter,
        confidence,
        quantity,
        reasoning,
        trade_plan: Some(default_trade_plan(wider_stops)),
        calculations,
    }
}

// =============================================================================
// Tests
// =============================================================================
