// =============================================================================
// GEX analytics — net gamma exposure, walls, zero-gamma, max pain, P/C
// =============================================================================
//
// Dealer gamma per contract is approximated as
//   gamma · open_interest · 100 · spot² · 0.01
// signed positive for calls and negative for puts (dealers are net short
// customer flow). The summary feeds the decision orchestrator; it is regime
// classification, not pricing.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::market_data::{OptionChain, OptionContract};
use crate::types::{DealerPosition, Direction, MarketBias};

/// Bias cutoff on normalized strength.
const BIAS_THRESHOLD: f64 = 0.15;

/// Chain-derived analytics, before flip detection (which needs the previous
/// summary).
#[derive(Debug, Clone, Serialize)]
pub struct GexAnalysis {
    pub net_gex: f64,
    /// Net over gross, in [-1, 1].
    pub strength: f64,
    pub direction: MarketBias,
    pub dealer_position: DealerPosition,
    pub zero_gamma_level: Option<Decimal>,
    pub call_wall: Option<Decimal>,
    pub put_wall: Option<Decimal>,
    pub max_pain: Option<Decimal>,
    pub pc_ratio: Option<f64>,
    pub regime: String,
}

/// Per-contract signed dealer gamma contribution in dollar terms.
fn contract_gex(contract: &OptionContract, spot: f64) -> f64 {
    let sign = match contract.right {
        Direction::Call => 1.0,
        Direction::Put => -1.0,
    };
    sign * contract.gamma * contract.open_interest as f64 * 100.0 * spot * spot * 0.01
}

/// Analyze one chain into a GEX summary skeleton.
pub fn analyze_chain(chain: &OptionChain) -> GexAnalysis {
    let spot = chain.spot.to_f64().unwrap_or(0.0);

    let mut net_gex = 0.0;
    let mut gross_gex = 0.0;
    let mut call_oi: u64 = 0;
    let mut put_oi: u64 = 0;
    let mut call_volume: u64 = 0;
    let mut put_volume: u64 = 0;

    // Per-strike net gamma, ordered by strike.
    let mut strikes: Vec<(f64, f64)> = Vec::new();

    for contract in &chain.contracts {
        let strike = contract.strike.to_f64().unwrap_or(0.0);
        let gex = contract_gex(contract, spot);
        net_gex += gex;
        gross_gex += gex.abs();

        match contract.right {
            Direction::Call => {
                call_oi += contract.open_interest;
                call_volume += contract.volume;
            }
            Direction::Put => {
                put_oi += contract.open_interest;
                put_volume += contract.volume;
            }
        }

        match strikes.iter_mut().find(|(k, _)| (*k - strike).abs() < 1e-9) {
            Some((_, acc)) => *acc += gex,
            None => strikes.push((strike, gex)),
        }
    }
    strikes.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let strength = if gross_gex > 0.0 {
        (net_gex / gross_gex).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let direction = if strength > BIAS_THRESHOLD {
        MarketBias::Bullish
    } else if strength < -BIAS_THRESHOLD {
        MarketBias::Bearish
    } else {
        MarketBias::Neutral
    };

    let dealer_position = if net_gex >= 0.0 {
        DealerPosition::LongGamma
    } else {
        DealerPosition::ShortGamma
    };

    let regime = match dealer_position {
        DealerPosition::LongGamma => "POSITIVE_GAMMA".to_string(),
        DealerPosition::ShortGamma => "NEGATIVE_GAMMA".to_string(),
    };

    let pc_ratio = if call_oi > 0 {
        Some(put_oi as f64 / call_oi as f64)
    } else if call_volume > 0 {
        Some(put_volume as f64 / call_volume as f64)
    } else {
        None
    };

    GexAnalysis {
        net_gex,
        strength,
        direction,
        dealer_position,
        zero_gamma_level: zero_gamma_level(&strikes),
        call_wall: call_wall(&strikes),
        put_wall: put_wall(&strikes),
        max_pain: max_pain(&chain.contracts),
        pc_ratio,
        regime,
    }
}

/// Strike with the largest positive per-strike gamma (calls dominate there):
/// the level dealers defend from above.
fn call_wall(strikes: &[(f64, f64)]) -> Option<Decimal> {
    strikes
        .iter()
        .filter(|(_, gex)| *gex > 0.0)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .and_then(|(strike, _)| Decimal::from_f64(*strike))
        .map(|d| d.round_dp(2))
}

/// Strike with the most negative per-strike gamma: the put support level.
fn put_wall(strikes: &[(f64, f64)]) -> Option<Decimal> {
    strikes
        .iter()
        .filter(|(_, gex)| *gex < 0.0)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .and_then(|(strike, _)| Decimal::from_f64(*strike))
        .map(|d| d.round_dp(2))
}

/// Price where cumulative net gamma flips sign, interpolated between the
/// two strikes that straddle the flip.
fn zero_gamma_level(strikes: &[(f64, f64)]) -> Option<Decimal> {
    if strikes.len() < 2 {
        return None;
    }

    let mut cumulative = 0.0;
    let mut prev: Option<(f64, f64)> = None;
    for (strike, gex) in strikes {
        let next = cumulative + gex;
        if let Some((prev_strike, prev_cum)) = prev {
            if (prev_cum < 0.0) != (next < 0.0) && (next - prev_cum).abs() > f64::EPSILON {
                // Linear interpolation between the straddling strikes.
                let fraction = (0.0 - prev_cum) / (next - prev_cum);
                let level = prev_strike + fraction * (strike - prev_strike);
                return Decimal::from_f64(level).map(|d| d.round_dp(2));
            }
        }
        prev = Some((*strike, next));
        cumulative = next;
    }
    None
}

/// Strike minimizing total option-holder payoff at expiration.
fn max_pain(contracts: &[OptionContract]) -> Option<Decimal> {
    if contracts.is_empty() {
        return None;
    }

    let mut candidates: Vec<f64> = contracts
        .iter()
        .filter_map(|c| c.strike.to_f64())
        .collect();
    candidates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    candidates.dedup_by(|a, b| (*a - *b).abs() < 1e-9);

    let mut best: Option<(f64, f64)> = None;
    for settle in &candidates {
        let mut payoff = 0.0;
        for contract in contracts {
            let strike = contract.strike.to_f64().unwrap_or(0.0);
            let oi = contract.open_interest as f64;
            payoff += match contract.right {
                Direction::Call => (settle - strike).max(0.0) * oi,
                Direction::Put => (strike - settle).max(0.0) * oi,
            };
        }
        match best {
            Some((_, best_payoff)) if payoff >= best_payoff => {}
            _ => best = Some((*settle, payoff)),
        }
    }

    best.and_then(|(strike, _)| Decimal::from_f64(strike))
        .map(|d| d.round_dp(2))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;

    fn contract(strike: f64, right: Direction, gamma: f64, oi: u64) -> OptionContract {
        OptionContract {
            strike: Decimal::from_f64(strike).unwrap(),
            right,
            expiration: Utc::now().date_naive() + chrono::Duration::days(7),
            gamma,
            open_interest: oi,
            volume: oi / 10,
            implied_volatility: Some(0.2),
        }
    }

    fn chain(contracts: Vec<OptionContract>) -> OptionChain {
        OptionChain {
            symbol: "SPY".into(),
            spot: dec!(500),
            contracts,
            provider: "demo".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn call_heavy_chain_is_long_gamma_bullish() {
        let analysis = analyze_chain(&chain(vec![
            contract(495.0, Direction::Put, 0.05, 1_000),
            contract(500.0, Direction::Call, 0.08, 10_000),
            contract(505.0, Direction::Call, 0.06, 8_000),
        ]));
        assert!(analysis.net_gex > 0.0);
        assert_eq!(analysis.dealer_position, DealerPosition::LongGamma);
        assert_eq!(analysis.direction, MarketBias::Bullish);
        assert_eq!(analysis.regime, "POSITIVE_GAMMA");
        assert!(analysis.strength > 0.0 && analysis.strength <= 1.0);
    }

    #[test]
    fn put_heavy_chain_is_short_gamma_bearish() {
        let analysis = analyze_chain(&chain(vec![
            contract(495.0, Direction::Put, 0.08, 12_000),
            contract(490.0, Direction::Put, 0.06, 9_000),
            contract(505.0, Direction::Call, 0.04, 1_000),
        ]));
        assert!(analysis.net_gex < 0.0);
        assert_eq!(analysis.dealer_position, DealerPosition::ShortGamma);
        assert_eq!(analysis.direction, MarketBias::Bearish);
        assert_eq!(analysis.regime, "NEGATIVE_GAMMA");
    }

    #[test]
    fn walls_pick_dominant_strikes() {
        let analysis = analyze_chain(&chain(vec![
            contract(480.0, Direction::Put, 0.07, 20_000),
            contract(500.0, Direction::Call, 0.05, 5_000),
            contract(510.0, Direction::Call, 0.09, 25_000),
        ]));
        assert_eq!(analysis.call_wall, Some(dec!(510)));
        assert_eq!(analysis.put_wall, Some(dec!(480)));
    }

    #[test]
    fn zero_gamma_interpolates_between_strikes() {
        // Cumulative flips between 490 (negative) and 510 (positive).
        let analysis = analyze_chain(&chain(vec![
            contract(490.0, Direction::Put, 0.08, 10_000),
            contract(510.0, Direction::Call, 0.10, 15_000),
        ]));
        let level = analysis.zero_gamma_level.unwrap();
        assert!(level > dec!(490) && level < dec!(510));
    }

    #[test]
    fn max_pain_minimizes_holder_payoff() {
        // Heavy OI pinned at 500 from both sides; 500 minimizes payoff.
        let analysis = analyze_chain(&chain(vec![
            contract(490.0, Direction::Call, 0.05, 5_000),
            contract(500.0, Direction::Call, 0.08, 20_000),
            contract(500.0, Direction::Put, 0.08, 20_000),
            contract(510.0, Direction::Put, 0.05, 5_000),
        ]));
        assert_eq!(analysis.max_pain, Some(dec!(500)));
    }

    #[test]
    fn pc_ratio_from_open_interest() {
        let analysis = analyze_chain(&chain(vec![
            contract(495.0, Direction::Put, 0.05, 9_000),
            contract(505.0, Direction::Call, 0.05, 10_000),
        ]));
        let pc = analysis.pc_ratio.unwrap();
        assert!((pc - 0.9).abs() < 1e-9);
    }

    #[test]
    fn empty_chain_is_neutral() {
        let analysis = analyze_chain(&chain(Vec::new()));
        assert_eq!(analysis.direction, MarketBias::Neutral);
        assert!(analysis.max_pain.is_none());
        assert!(analysis.pc_ratio.is_none());
        assert!((analysis.strength - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn demo_chain_analyzes_cleanly() {
        let chain = crate::market_data::providers::demo_chain("SPY", Utc::now());
        let analysis = analyze_chain(&chain);
        assert!(analysis.strength >= -1.0 && analysis.strength <= 1.0);
        assert!(analysis.max_pain.is_some());
        assert!(analysis.pc_ratio.is_some());
    }
}
