// =============================================================================
// Decision Orchestrator — entry / hold / exit rule stacks
// =============================================================================
//
// Three decision functions share one confidence model: start at the base,
// apply additive adjustments from independent factor rules, clamp to
// [0, 100], and reject below the minimum threshold. Every rule records its
// adjustment and reason so decisions audit cleanly.
// =============================================================================

pub mod entry;
pub mod exit;
pub mod hold;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::{ExitRules, TradePlan};

/// Starting confidence for entry decisions.
pub const BASE_CONFIDENCE: f64 = 50.0;
/// Entries below this final confidence are rejected.
pub const MIN_CONFIDENCE_THRESHOLD: f64 = 35.0;
/// Starting confidence for hold evaluation.
pub const HOLD_BASE_CONFIDENCE: f64 = 70.0;

/// |strength| at or above this counts as a high-conviction GEX reading.
pub const HIGH_CONVICTION_STRENGTH: f64 = 0.5;
/// Price within this fraction of a wall counts as "at the wall".
pub const WALL_PROXIMITY_FRACTION: f64 = 0.01;
/// P/C ratio beyond these bounds is an extreme worth fading.
pub const PC_RATIO_HIGH: f64 = 1.2;
pub const PC_RATIO_LOW: f64 = 0.7;
/// Positions older than this count as old trades in exit evaluation.
pub const MAX_POSITION_AGE_HOURS: f64 = 168.0;

/// Default trade plan attached to ENTER decisions. Stops widen 20 % under
/// short gamma.
pub fn default_trade_plan(wider_stops: bool) -> TradePlan {
    let widen = if wider_stops { 1.2 } else { 1.0 };
    TradePlan {
        stop_loss_pct: 30.0 * widen,
        target1_pct: 25.0,
        target2_pct: 50.0,
        trailing_stop_pct: 15.0 * widen,
        max_hold_hours: 168,
    }
}

/// Fall back to the mode's exit rules when an entry decision carried no
/// trade plan.
pub fn plan_from_exit_rules(rules: &ExitRules) -> TradePlan {
    TradePlan {
        stop_loss_pct: rules.stop_loss_pct,
        target1_pct: rules.profit_target_pct / 2.0,
        target2_pct: rules.profit_target_pct,
        trailing_stop_pct: rules.trailing_stop_pct,
        max_hold_hours: rules.max_days_in_trade * 24,
    }
}

/// Percentage threshold applied to an entry premium, e.g. stop and target
/// levels.
pub fn pct_level(entry: Decimal, pct: f64, above: bool) -> Decimal {
    let pct = rust_decimal::prelude::FromPrimitive::from_f64(pct).unwrap_or(dec!(0));
    let fraction: Decimal = pct / dec!(100);
    if above {
        entry * (dec!(1) + fraction)
    } else {
        entry * (dec!(1) - fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradingMode;

    #[test]
    fn wider_stops_widen_by_twenty_percent() {
        let normal = default_trade_plan(false);
        let wide = default_trade_plan(true);
        assert!((wide.stop_loss_pct - normal.stop_loss_pct * 1.2).abs() < 1e-9);
        assert!((wide.trailing_stop_pct - normal.trailing_stop_pct * 1.2).abs() < 1e-9);
        assert!((wide.target1_pct - normal.target1_pct).abs() < 1e-9);
    }

    #[test]
    fn exit_rules_map_into_a_plan() {
        let rules = ExitRules::defaults_for(TradingMode::Paper);
        let plan = plan_from_exit_rules(&rules);
        assert!((plan.stop_loss_pct - rules.stop_loss_pct).abs() < 1e-9);
        assert!((plan.target2_pct - rules.profit_target_pct).abs() < 1e-9);
        assert_eq!(plan.max_hold_hours, rules.max_days_in_trade * 24);
    }

    #[test]
    fn pct_levels() {
        assert_eq!(pct_level(dec!(5.00), 50.0, false), dec!(2.5000));
        assert_eq!(pct_level(dec!(5.00), 50.0, true), dec!(7.5000));
    }
}
