// =============================================================================
// Hold evaluation — should an open position stay on?
// =============================================================================
//
// Runs per open position from the exit monitor. Starts at a hold confidence
// of 70, deducts for adverse structure shifts, and selects an action:
//
//   hold confidence < 30                  -> EXIT
//   hold confidence < 50 and profit > 20% -> PARTIAL_EXIT
//   three or more non-HIGH warnings       -> TIGHTEN_STOP to price · 0.9
//   otherwise                             -> HOLD
//
// A dealer flip to short gamma while sitting on >10 % profit recommends a
// 50 % partial exit on its own.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::domain::{ContextSnapshot, GexSummary, Position, RuleHit};
use crate::types::{DealerPosition, Direction};

use super::{HOLD_BASE_CONFIDENCE, WALL_PROXIMITY_FRACTION, PC_RATIO_HIGH, PC_RATIO_LOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WarningSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldWarning {
    pub kind: String,
    pub severity: WarningSeverity,
    pub message: String,
}

/// Selected action for the position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldAction {
    Hold,
    PartialExit { fraction: f64 },
    TightenStop { new_stop: Decimal },
    Exit,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldAssessment {
    pub hold_confidence: f64,
    pub action: HoldAction,
    pub warnings: Vec<HoldWarning>,
    pub reasoning: Vec<RuleHit>,
}

pub struct HoldInputs<'a> {
    pub position: &'a Position,
    pub context: Option<&'a ContextSnapshot>,
    pub gex: Option<&'a GexSummary>,
    pub underlying_price: Option<Decimal>,
    pub now: DateTime<Utc>,
}

fn warn(
    warnings: &mut Vec<HoldWarning>,
    kind: &str,
    severity: WarningSeverity,
    message: impl Into<String>,
) {
    warnings.push(HoldWarning {
        kind: kind.to_string(),
        severity,
        message: message.into(),
    });
}

fn hit(reasoning: &mut Vec<RuleHit>, rule: &str, adjustment: f64, reason: impl Into<String>) {
    reasoning.push(RuleHit {
        rule: rule.to_string(),
        adjustment,
        reason: reason.into(),
    });
}

/// Evaluate hold confidence for one open position.
pub fn evaluate_hold(inputs: &HoldInputs<'_>) -> HoldAssessment {
    let position = inputs.position;
    let direction = position.direction;
    let mut confidence = HOLD_BASE_CONFIDENCE;
    let mut warnings: Vec<HoldWarning> = Vec::new();
    let mut reasoning: Vec<RuleHit> = Vec::new();
    let mut partial_exit_recommended = false;

    let gain = position.gain_fraction().unwrap_or(0.0);

    // ── Regime change against the position: −25, HIGH ───────────────────
    if let Some(ctx) = inputs.context {
        if ctx.bias.opposes(direction) {
            confidence -= 25.0;
            hit(
                &mut reasoning,
                "context.regime_change",
                -25.0,
                format!("{} regime turned against the {direction}", ctx.regime),
            );
            warn(
                &mut warnings,
                "REGIME_CHANGE",
                WarningSeverity::High,
                format!("market bias {} opposes position", ctx.bias),
            );
        }
    }

    if let Some(gex) = inputs.gex {
        // ── Dealer flip to short gamma with >10 % profit ────────────────
        if gex.flip_detected
            && gex.dealer_position == DealerPosition::ShortGamma
            && gain > 0.10
        {
            partial_exit_recommended = true;
            hit(
                &mut reasoning,
                "gex.dealer_flip",
                0.0,
                format!(
                    "dealers flipped short gamma with {:.1}% open profit — bank half",
                    gain * 100.0
                ),
            );
            warn(
                &mut warnings,
                "DEALER_FLIP",
                WarningSeverity::High,
                "short-gamma flip while profitable",
            );
        }

        // ── Zero-gamma crossover against the position: −20 ──────────────
        if let (Some(zero_gamma), Some(price)) = (gex.zero_gamma_level, inputs.underlying_price) {
            let adverse = match direction {
                Direction::Call => price < zero_gamma,
                Direction::Put => price > zero_gamma,
            };
            if adverse {
                confidence -= 20.0;
                hit(
                    &mut reasoning,
                    "gex.zero_gamma_cross",
                    -20.0,
                    format!("price {price} crossed zero gamma {zero_gamma} against the {direction}"),
                );
                warn(
                    &mut warnings,
                    "ZERO_GAMMA_CROSS",
                    WarningSeverity::Medium,
                    "price on the adverse side of zero gamma",
                );
            }
        }

        // ── Wall proximity adverse: −5 to −10 ───────────────────────────
        if let Some(price) = inputs.underlying_price {
            let adverse_wall = match direction {
                Direction::Call => gex.call_wall,
                Direction::Put => gex.put_wall,
            };
            if let Some(wall) = adverse_wall {
                if !wall.is_zero() {
                    let distance = ((price - wall) / wall).abs().to_f64().unwrap_or(f64::MAX);
                    if distance <= WALL_PROXIMITY_FRACTION / 2.0 {
                        confidence -= 10.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            -10.0,
                            format!("price {price} hard against wall {wall}"),
                        );
                        warn(
                            &mut warnings,
                            "WALL_PROXIMITY",
                            WarningSeverity::Medium,
                            "price pinned at the wall",
                        );
                    } else if distance <= WALL_PROXIMITY_FRACTION {
                        confidence -= 5.0;
                        hit(
                            &mut reasoning,
                            "gex.wall_proximity",
                            -5.0,
                            format!("price {price} approaching wall {wall}"),
                        );
                        warn(
                            &mut warnings,
                            "WALL_PROXIMITY",
                            WarningSeverity::Low,
                            "price nearing the wall",
                        );
                    }
                }
            }
        }

        // ── P/C contrarian against the position: −10 ────────────────────
        if let Some(pc) = gex.pc_ratio {
            let contrarian_against = (pc >= PC_RATIO_HIGH && direction == Direction::Put)
                || (pc <= PC_RATIO_LOW && direction == Direction::Call);
            if contrarian_against {
                confidence -= 10.0;
                hit(
                    &mut reasoning,
                    "gex.pc_ratio",
                    -10.0,
                    format!("P/C {pc:.2} extreme leans against the {direction}"),
                );
                warn(
                    &mut warnings,
                    "PC_EXTREME",
                    WarningSeverity::Medium,
                    "positioning extreme against the trade",
                );
            }
        }

        // ── Max-pain pull adverse: −8 ───────────────────────────────────
        if let (Some(max_pain), Some(price)) = (gex.max_pain, inputs.underlying_price) {
            if !price.is_zero() {
                let pull_up = max_pain > price;
                let adverse = matches!(
                    (direction, pull_up),
                    (Direction::Call, false) | (Direction::Put, true)
                );
                if adverse {
                    confidence -= 8.0;
                    hit(
                        &mut reasoning,
                        "gex.max_pain",
                        -8.0,
                        format!("max pain {max_pain} drags against the {direction}"),
                    );
                    warn(
                        &mut warnings,
                        "MAX_PAIN_PULL",
                        WarningSeverity::Low,
                        "expiration magnet works against the trade",
                    );
                }
            }
        }
    }

    // ── Profit-target and time-decay advisories ─────────────────────────
    if gain >= 0.50 {
        warn(
            &mut warnings,
            "PROFIT_TARGET",
            WarningSeverity::Medium,
            format!("open profit {:.1}% at the profit target", gain * 100.0),
        );
    }
    let age_hours = position.age_hours(inputs.now);
    if age_hours >= 72.0 && gain < 0.10 {
        warn(
            &mut warnings,
            "TIME_DECAY",
            WarningSeverity::Medium,
            format!("{age_hours:.0}h in trade with {:.1}% to show", gain * 100.0),
        );
    }

    let confidence = confidence.clamp(0.0, 100.0);

    // ── Action selection ────────────────────────────────────────────────
    let non_high_warnings = warnings
        .iter()
        .filter(|w| w.severity != WarningSeverity::High)
        .count();

    let action = if confidence < 30.0 {
        HoldAction::Exit
    } else if confidence < 50.0 && gain > 0.20 {
        HoldAction::PartialExit { fraction: 0.5 }
    } else if partial_exit_recommended {
        HoldAction::PartialExit { fraction: 0.5 }
    } else if non_high_warnings >= 3 {
        let new_stop = position
            .current_price
            .unwrap_or(position.entry_price)
            * dec!(0.9);
        HoldAction::TightenStop { new_stop }
    } else {
        HoldAction::Hold
    };

    HoldAssessment {
        hold_confidence: confidence,
        action,
        warnings,
        reasoning,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContextSnapshot;
    use crate::types::{MarketBias, PositionStatus};

    fn position(direction: Direction, entry: Decimal, current: Decimal) -> Position {
        Position {
            id: "p1".into(),
            signal_id: "s1".into(),
            symbol: "SPY".into(),
            direction,
            strike: dec!(500),
            expiration: Utc::now().date_naive() + chrono::Duration::days(14),
            quantity: 2,
            entry_price: entry,
            entry_time: Utc::now() - chrono::Duration::hours(4),
            current_price: Some(current),
            unrealized_pnl: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            high_water_mark: Some(current),
            entry_iv: None,
            partial_exit_taken: false,
        }
    }

    fn base_gex() -> GexSummary {
        GexSummary {
            id: "g1".into(),
            symbol: "SPY".into(),
            timeframe: "15m".into(),
            net_gex: 1.0e9,
            strength: 0.3,
            direction: MarketBias::Neutral,
            dealer_position: DealerPosition::LongGamma,
            zero_gamma_level: None,
            call_wall: None,
            put_wall: None,
            max_pain: None,
            pc_ratio: None,
            flip_detected: false,
            flip_direction: None,
            regime: "POSITIVE_GAMMA".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn quiet_market_holds() {
        let pos = position(Direction::Call, dec!(5.00), dec!(5.20));
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: None,
            gex: Some(&base_gex()),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        });
        assert_eq!(assessment.action, HoldAction::Hold);
        assert!((assessment.hold_confidence - 70.0).abs() < 1e-9);
    }

    #[test]
    fn adverse_structure_exits() {
        let pos = position(Direction::Call, dec!(5.00), dec!(4.80));
        let ctx = ContextSnapshot::new(22.0, MarketBias::Bearish, MarketBias::Bearish, "TRENDING", 80.0);
        let mut gex = base_gex();
        gex.zero_gamma_level = Some(dec!(505));
        gex.pc_ratio = Some(0.5); // call-heavy extreme against a long call

        // 70 - 25 (regime) - 20 (zero gamma) - 10 (pc) = 15 < 30 -> EXIT
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: Some(&ctx),
            gex: Some(&gex),
            underlying_price: Some(dec!(500)),
            now: Utc::now(),
        });
        assert_eq!(assessment.action, HoldAction::Exit);
        assert!(assessment.hold_confidence < 30.0);
    }

    #[test]
    fn profitable_weak_hold_takes_partial() {
        let pos = position(Direction::Call, dec!(5.00), dec!(6.50)); // +30%
        let ctx = ContextSnapshot::new(22.0, MarketBias::Bearish, MarketBias::Bearish, "TRENDING", 60.0);
        let mut gex = base_gex();
        gex.zero_gamma_level = Some(dec!(505));

        // 70 - 25 - 20 = 25... that's < 30 -> EXIT; soften: drop regime.
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: Some(&ctx),
            gex: Some(&gex),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        });
        // 70 - 25 - 20 = 25 -> EXIT beats partial here.
        assert_eq!(assessment.action, HoldAction::Exit);

        // With only the zero-gamma cross the confidence is 50..70 band.
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        });
        assert_eq!(assessment.hold_confidence, 50.0);
        assert_eq!(assessment.action, HoldAction::Hold);
    }

    #[test]
    fn partial_exit_in_the_forty_band_with_profit() {
        let pos = position(Direction::Call, dec!(5.00), dec!(6.50)); // +30%
        let mut gex = base_gex();
        gex.zero_gamma_level = Some(dec!(505)); // -20
        gex.pc_ratio = Some(0.5); // -10

        // 70 - 20 - 10 = 40 < 50 with profit 30% -> PARTIAL_EXIT(50%).
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        });
        assert_eq!(assessment.action, HoldAction::PartialExit { fraction: 0.5 });
    }

    #[test]
    fn dealer_flip_recommends_partial() {
        let pos = position(Direction::Call, dec!(5.00), dec!(5.80)); // +16%
        let mut gex = base_gex();
        gex.flip_detected = true;
        gex.dealer_position = DealerPosition::ShortGamma;

        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        });
        assert_eq!(assessment.action, HoldAction::PartialExit { fraction: 0.5 });
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.kind == "DEALER_FLIP"));
    }

    #[test]
    fn warning_pileup_tightens_stop() {
        let mut pos = position(Direction::Call, dec!(5.00), dec!(5.10));
        pos.entry_time = Utc::now() - chrono::Duration::hours(80); // TIME_DECAY
        let mut gex = base_gex();
        gex.zero_gamma_level = Some(dec!(505)); // ZERO_GAMMA_CROSS (medium)
        gex.max_pain = Some(dec!(495)); // adverse pull for a call (low)

        // 70 - 20 - 8 = 42, profit only 2% so no partial; three non-HIGH
        // warnings -> TIGHTEN_STOP at 0.9 · current.
        let assessment = evaluate_hold(&HoldInputs {
            position: &pos,
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(500)),
            now: Utc::now(),
        });
        assert_eq!(
            assessment.action,
            HoldAction::TightenStop {
                new_stop: dec!(5.10) * dec!(0.9)
            }
        );
        assert!(assessment.warnings.len() >= 3);
    }
}
