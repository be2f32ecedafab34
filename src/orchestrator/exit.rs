// =============================================================================
// Exit evaluation — priority ladder, first match wins
// =============================================================================
//
// Rules are checked in strict priority order; the first hit returns and no
// later rule is evaluated:
//
//    1. stop-loss          -> CLOSE_FULL,    IMMEDIATE
//    2. target-2           -> CLOSE_FULL,    IMMEDIATE
//    3. target-1, no prior -> CLOSE_PARTIAL, SOON
//    4. trailing stop      -> CLOSE_FULL,    IMMEDIATE
//    5. GEX flip + profit  -> CLOSE_FULL,    SOON
//    6. zero-gamma against -> CLOSE_FULL,    IMMEDIATE
//    7. regime change      -> CLOSE_FULL,    SOON
//    8. DTE <= 1           -> CLOSE_FULL,    IMMEDIATE
//    9. old trade, no gain -> CLOSE_FULL,    OPTIONAL
//   10. theta bleed        -> CLOSE_FULL,    SOON
//
// Urgency maps to order type downstream: IMMEDIATE -> market, else limit at
// the current price.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{ContextSnapshot, ExitAlert, GexSummary, Position, TradePlan};
use crate::types::{AlertPriority, Direction, ExitUrgency};

use super::{pct_level, HIGH_CONVICTION_STRENGTH, MAX_POSITION_AGE_HOURS};

pub const CLOSE_FULL: &str = "CLOSE_FULL";
pub const CLOSE_PARTIAL: &str = "CLOSE_PARTIAL";

/// Daily theta bleed beyond this percentage of premium forces an exit.
const THETA_BLEED_DAILY_PCT: f64 = 5.0;

pub struct ExitInputs<'a> {
    pub position: &'a Position,
    pub plan: &'a TradePlan,
    pub context: Option<&'a ContextSnapshot>,
    pub gex: Option<&'a GexSummary>,
    pub underlying_price: Option<Decimal>,
    pub now: DateTime<Utc>,
}

fn alert(
    position: &Position,
    rule: &str,
    reason: String,
    action: &str,
    quantity: u32,
    urgency: ExitUrgency,
    priority: AlertPriority,
) -> ExitAlert {
    ExitAlert {
        position_id: position.id.clone(),
        symbol: position.symbol.clone(),
        rule: rule.to_string(),
        reason,
        action: action.to_string(),
        quantity,
        urgency,
        priority,
        current_price: position.current_price,
    }
}

/// Evaluate the exit ladder for one open position with a known mark.
/// Returns `None` when every rule passes (HOLD).
pub fn evaluate_exit(inputs: &ExitInputs<'_>) -> Option<ExitAlert> {
    let position = inputs.position;
    let plan = inputs.plan;
    let current = position.current_price?;
    let entry = position.entry_price;
    let gain = position.gain_fraction().unwrap_or(0.0);
    let full = position.quantity;

    // ── 1. Stop-loss ────────────────────────────────────────────────────
    let stop = pct_level(entry, plan.stop_loss_pct, false);
    if current <= stop {
        return Some(alert(
            position,
            "stop_loss",
            format!("premium {current} through stop {stop}"),
            CLOSE_FULL,
            full,
            ExitUrgency::Immediate,
            AlertPriority::Critical,
        ));
    }

    // ── 2. Target-2 ─────────────────────────────────────────────────────
    let target2 = pct_level(entry, plan.target2_pct, true);
    if current >= target2 {
        return Some(alert(
            position,
            "target_2",
            format!("premium {current} through target-2 {target2}"),
            CLOSE_FULL,
            full,
            ExitUrgency::Immediate,
            AlertPriority::Critical,
        ));
    }

    // ── 3. Target-1, first touch only ───────────────────────────────────
    let target1 = pct_level(entry, plan.target1_pct, true);
    if current >= target1 && !position.partial_exit_taken {
        let half = (full / 2).max(1);
        return Some(alert(
            position,
            "target_1",
            format!("premium {current} through target-1 {target1} — bank half"),
            CLOSE_PARTIAL,
            half,
            ExitUrgency::Soon,
            AlertPriority::High,
        ));
    }

    // ── 4. Trailing stop off the high-water mark ────────────────────────
    if let Some(hwm) = position.high_water_mark {
        let trail = pct_level(hwm, plan.trailing_stop_pct, false);
        if current <= trail && current > entry {
            return Some(alert(
                position,
                "trailing_stop",
                format!("premium {current} off high-water {hwm} through trail {trail}"),
                CLOSE_FULL,
                full,
                ExitUrgency::Immediate,
                AlertPriority::Critical,
            ));
        }
    }

    if let Some(gex) = inputs.gex {
        // ── 5. GEX flip against the position with >10 % profit ──────────
        if gex.flip_detected && gain > 0.10 {
            if let Some(flip) = gex.flip_direction {
                if flip.opposes(position.direction) {
                    return Some(alert(
                        position,
                        "gex_flip",
                        format!(
                            "gamma flipped {flip} against the {} with {:.1}% open profit",
                            position.direction,
                            gain * 100.0
                        ),
                        CLOSE_FULL,
                        full,
                        ExitUrgency::Soon,
                        AlertPriority::High,
                    ));
                }
            }
        }

        // ── 6. Zero-gamma high-conviction breakout against ──────────────
        if let (Some(zero_gamma), Some(price)) = (gex.zero_gamma_level, inputs.underlying_price) {
            if gex.strength.abs() >= HIGH_CONVICTION_STRENGTH {
                let adverse = match position.direction {
                    Direction::Call => price < zero_gamma,
                    Direction::Put => price > zero_gamma,
                };
                if adverse {
                    return Some(alert(
                        position,
                        "zero_gamma_breakout",
                        format!(
                            "high-conviction break of zero gamma {zero_gamma} against the {}",
                            position.direction
                        ),
                        CLOSE_FULL,
                        full,
                        ExitUrgency::Immediate,
                        AlertPriority::Critical,
                    ));
                }
            }
        }
    }

    // ── 7. Regime change at ≥70 % confidence against ────────────────────
    if let Some(ctx) = inputs.context {
        if ctx.bias.opposes(position.direction) && ctx.regime_confidence >= 70.0 {
            return Some(alert(
                position,
                "regime_change",
                format!(
                    "{} regime at {:.0}% confidence opposes the {}",
                    ctx.regime, ctx.regime_confidence, position.direction
                ),
                CLOSE_FULL,
                full,
                ExitUrgency::Soon,
                AlertPriority::High,
            ));
        }
    }

    // ── 8. Expiration risk: DTE ≤ 1 ─────────────────────────────────────
    let dte = position.days_to_expiration(inputs.now);
    if dte <= 1 {
        return Some(alert(
            position,
            "expiration",
            format!("{dte} days to expiration"),
            CLOSE_FULL,
            full,
            ExitUrgency::Immediate,
            AlertPriority::Critical,
        ));
    }

    // ── 9. Old trade without progress ───────────────────────────────────
    let age_hours = position.age_hours(inputs.now);
    if age_hours >= MAX_POSITION_AGE_HOURS && gain < 0.10 {
        return Some(alert(
            position,
            "max_age",
            format!(
                "{age_hours:.0}h in trade with only {:.1}% gain",
                gain * 100.0
            ),
            CLOSE_FULL,
            full,
            ExitUrgency::Optional,
            AlertPriority::Medium,
        ));
    }

    // ── 10. Theta bleed over 5 % of premium per day ─────────────────────
    if let Some(price) = inputs.underlying_price {
        let intrinsic = match position.direction {
            Direction::Call => (price - position.strike).max(dec!(0)),
            Direction::Put => (position.strike - price).max(dec!(0)),
        };
        let time_value = (current - intrinsic).max(dec!(0));
        if dte > 0 && !current.is_zero() {
            let daily_bleed_pct = (time_value / Decimal::from(dte) / current * dec!(100))
                .to_f64()
                .unwrap_or(0.0);
            if daily_bleed_pct > THETA_BLEED_DAILY_PCT {
                return Some(alert(
                    position,
                    "theta_decay",
                    format!("losing {daily_bleed_pct:.1}% of premium per day to theta"),
                    CLOSE_FULL,
                    full,
                    ExitUrgency::Soon,
                    AlertPriority::High,
                ));
            }
        }
    }

    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContextSnapshot;
    use crate::types::{MarketBias, PositionStatus};

    fn plan() -> TradePlan {
        TradePlan {
            stop_loss_pct: 50.0,
            target1_pct: 25.0,
            target2_pct: 50.0,
            trailing_stop_pct: 15.0,
            max_hold_hours: 168,
        }
    }

    fn position(entry: Decimal, current: Decimal) -> Position {
        Position {
            id: "p1".into(),
            signal_id: "s1".into(),
            symbol: "SPY".into(),
            direction: Direction::Call,
            strike: dec!(500),
            expiration: Utc::now().date_naive() + chrono::Duration::days(14),
            quantity: 4,
            entry_price: entry,
            entry_time: Utc::now() - chrono::Duration::hours(6),
            current_price: Some(current),
            unrealized_pnl: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            high_water_mark: Some(current.max(entry)),
            entry_iv: None,
            partial_exit_taken: false,
        }
    }

    fn eval(position: &Position, plan: &TradePlan) -> Option<ExitAlert> {
        evaluate_exit(&ExitInputs {
            position,
            plan,
            context: None,
            gex: None,
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        })
    }

    #[test]
    fn stop_loss_fires_first_and_market() {
        let pos = position(dec!(5.00), dec!(2.40));
        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "stop_loss");
        assert_eq!(alert.action, CLOSE_FULL);
        assert_eq!(alert.urgency, ExitUrgency::Immediate);
        assert_eq!(alert.priority, AlertPriority::Critical);
        assert_eq!(alert.quantity, 4);
        assert_eq!(alert.urgency.order_type(), crate::types::OrderType::Market);
    }

    #[test]
    fn target_two_beats_target_one() {
        let pos = position(dec!(5.00), dec!(7.60)); // +52%
        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "target_2");
        assert_eq!(alert.action, CLOSE_FULL);
    }

    #[test]
    fn target_one_takes_half_once() {
        let mut pos = position(dec!(5.00), dec!(6.30)); // +26%
        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "target_1");
        assert_eq!(alert.action, CLOSE_PARTIAL);
        assert_eq!(alert.quantity, 2);
        assert_eq!(alert.urgency, ExitUrgency::Soon);

        // A prior partial suppresses the rule.
        pos.partial_exit_taken = true;
        pos.high_water_mark = Some(dec!(6.30));
        assert!(eval(&pos, &plan()).is_none());
    }

    #[test]
    fn trailing_stop_requires_positive_pnl() {
        let mut pos = position(dec!(5.00), dec!(5.30));
        pos.high_water_mark = Some(dec!(6.40));
        pos.partial_exit_taken = true; // keep target-1 quiet
        // trail = 6.40 * 0.85 = 5.44; current 5.30 below it and above entry.
        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "trailing_stop");
        assert_eq!(alert.urgency, ExitUrgency::Immediate);
    }

    #[test]
    fn gex_flip_with_profit_exits_soon() {
        let mut pos = position(dec!(5.00), dec!(5.80)); // +16%
        pos.partial_exit_taken = true;
        let mut gex = sample_gex();
        gex.flip_detected = true;
        gex.flip_direction = Some(MarketBias::Bearish);

        let alert = evaluate_exit(&ExitInputs {
            position: &pos,
            plan: &plan(),
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        })
        .unwrap();
        assert_eq!(alert.rule, "gex_flip");
        assert_eq!(alert.urgency, ExitUrgency::Soon);
        assert_eq!(alert.urgency.order_type(), crate::types::OrderType::Limit);
    }

    #[test]
    fn zero_gamma_breakout_against_is_immediate() {
        let mut pos = position(dec!(5.00), dec!(5.10));
        pos.partial_exit_taken = true;
        let mut gex = sample_gex();
        gex.zero_gamma_level = Some(dec!(505));
        gex.strength = -0.6;

        let alert = evaluate_exit(&ExitInputs {
            position: &pos,
            plan: &plan(),
            context: None,
            gex: Some(&gex),
            underlying_price: Some(dec!(500)), // below zero gamma, call adverse
            now: Utc::now(),
        })
        .unwrap();
        assert_eq!(alert.rule, "zero_gamma_breakout");
        assert_eq!(alert.priority, AlertPriority::Critical);
    }

    #[test]
    fn regime_change_exits_soon() {
        let mut pos = position(dec!(5.00), dec!(5.10));
        pos.partial_exit_taken = true;
        let ctx = ContextSnapshot::new(25.0, MarketBias::Bearish, MarketBias::Bearish, "TRENDING", 85.0);

        let alert = evaluate_exit(&ExitInputs {
            position: &pos,
            plan: &plan(),
            context: Some(&ctx),
            gex: None,
            underlying_price: Some(dec!(502)),
            now: Utc::now(),
        })
        .unwrap();
        assert_eq!(alert.rule, "regime_change");
        assert_eq!(alert.urgency, ExitUrgency::Soon);
    }

    #[test]
    fn near_expiration_is_critical() {
        let mut pos = position(dec!(5.00), dec!(5.10));
        pos.partial_exit_taken = true;
        pos.expiration = Utc::now().date_naive() + chrono::Duration::days(1);

        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "expiration");
        assert_eq!(alert.urgency, ExitUrgency::Immediate);
    }

    #[test]
    fn stale_trade_is_optional() {
        let mut pos = position(dec!(5.00), dec!(5.20)); // +4%
        pos.partial_exit_taken = true;
        pos.entry_time = Utc::now() - chrono::Duration::hours(200);

        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "max_age");
        assert_eq!(alert.urgency, ExitUrgency::Optional);
        assert_eq!(alert.priority, AlertPriority::Medium);
    }

    #[test]
    fn theta_bleed_forces_soon_exit() {
        let mut pos = position(dec!(5.00), dec!(4.00));
        pos.partial_exit_taken = true;
        pos.strike = dec!(510); // OTM call: all premium is time value
        pos.expiration = Utc::now().date_naive() + chrono::Duration::days(3);

        // time value 4.00 over 3 days ≈ 33%/day of premium.
        let alert = eval(&pos, &plan()).unwrap();
        assert_eq!(alert.rule, "theta_decay");
        assert_eq!(alert.urgency, ExitUrgency::Soon);
    }

    #[test]
    fn healthy_position_holds() {
        let mut pos = position(dec!(5.00), dec!(5.40)); // +8%, below target-1
        pos.partial_exit_taken = true;
        // Deep ITM so time value is tiny.
        pos.strike = dec!(490);
        assert!(eval(&pos, &plan()).is_none());
    }

    fn sample_gex() -> GexSummary {
        GexSummary {
            id: "g1".into(),
            symbol: "SPY".into(),
            timeframe: "15m".into(),
            net_gex: 1.0e9,
            strength: 0.3,
            direction: MarketBias::Neutral,
            dealer_position: crate::types::DealerPosition::LongGamma,
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
}
