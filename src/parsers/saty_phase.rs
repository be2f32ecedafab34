// =============================================================================
// saty-phase dialect — market-phase oscillator alerts
// =============================================================================
//
// Shape:
//   { "phase": "ACCUMULATION"|"MARKUP"|"DISTRIBUTION"|"MARKDOWN",
//     "symbol": "SPY", "price": 502.15, "timeframe": "10m",
//     "strength": 0.8, "time": ... }
//
// Only MARKUP (calls) and MARKDOWN (puts) imply a trade; the transitional
// phases are non-actionable. Intraday horizon: next weekly Friday expiry.
// =============================================================================

use serde_json::Value;

use crate::types::{Direction, SignalSource};

use super::{build_signal, derive, f64_field, price_field, str_field, timestamp_field, ParseOutcome};

pub(super) fn parse(correlation_id: &str, payload: Value) -> ParseOutcome {
    let mut errors = Vec::new();

    let symbol = str_field(&payload, &["symbol", "ticker"]);
    if symbol.is_none() {
        errors.push("missing symbol".to_string());
    }

    let direction = match str_field(&payload, &["phase"]).map(str::to_uppercase).as_deref() {
        Some("MARKUP") => Some(Direction::Call),
        Some("MARKDOWN") => Some(Direction::Put),
        Some(phase @ ("ACCUMULATION" | "DISTRIBUTION")) => {
            errors.push(format!("phase '{phase}' does not imply a trade"));
            None
        }
        Some(other) => {
            errors.push(format!("unknown phase '{other}'"));
            None
        }
        None => {
            errors.push("missing phase".to_string());
            None
        }
    };

    let price = price_field(&payload, &["price", "current_price", "close"]);
    if price.is_none() {
        errors.push("missing price".to_string());
    }

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    // Strength is 0–1 when present.
    let confidence = f64_field(&payload, &["strength"])
        .map(|s| (s * 100.0).clamp(0.0, 100.0))
        .unwrap_or(60.0);
    let timeframe = str_field(&payload, &["timeframe", "tf"]).unwrap_or("10m").to_string();
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 50.0, confidence);

    let mut extra = serde_json::Map::new();
    if let Some(phase) = str_field(&payload, &["phase"]) {
        extra.insert("phase".into(), phase.to_uppercase().into());
    }

    let signal = build_signal(
        correlation_id,
        SignalSource::SatyPhase,
        symbol,
        direction,
        &timeframe,
        timestamp,
        confidence,
        price,
        true,
        quantity,
        extra,
    );
    ParseOutcome::signal(signal, payload)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use serde_json::json;

    use super::*;
    use crate::domain::OptionParams;

    #[test]
    fn markup_is_a_call_with_weekly_expiry() {
        let payload = json!({
            "phase": "MARKUP",
            "symbol": "SPY",
            "price": 498.40,
            "strength": 0.8,
            "timeframe": "10m",
            "time": "2026-08-03T15:00:00Z"
        });
        let signal = parse("c1", payload).signal.unwrap();
        assert_eq!(signal.direction, Direction::Call);
        assert!((signal.source_confidence() - 80.0).abs() < f64::EPSILON);

        let params = OptionParams::from_metadata(&signal.metadata).unwrap();
        // Monday 2026-08-03 -> Friday 2026-08-07, a weekly.
        assert_eq!(params.expiration.to_string(), "2026-08-07");
        assert_eq!(params.expiration.weekday(), chrono::Weekday::Fri);
        assert_eq!(params.quantity, 3);
    }

    #[test]
    fn markdown_is_a_put() {
        let signal = parse(
            "c1",
            json!({"phase": "markdown", "symbol": "IWM", "price": 198.2}),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Put);
        assert!((signal.source_confidence() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn transitional_phases_are_non_actionable() {
        for phase in ["ACCUMULATION", "DISTRIBUTION"] {
            let outcome = parse(
                "c1",
                json!({"phase": phase, "symbol": "SPY", "price": 500.0}),
            );
            assert!(outcome.signal.is_none());
            assert!(outcome.errors[0].contains("does not imply a trade"));
        }
    }

    #[test]
    fn unknown_phase_is_rejected() {
        let outcome = parse(
            "c1",
            json!({"phase": "LIFTOFF", "symbol": "SPY", "price": 500.0}),
        );
        assert!(outcome.signal.is_none());
        assert!(outcome.errors[0].contains("unknown phase"));
    }
}
