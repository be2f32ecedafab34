// =============================================================================
// strat-engine dialect — Strat candle-pattern alerts
// =============================================================================
//
// Shape:
//   { "strat": {"pattern": "2-1-2", "bias": "LONG", "confidence": 72},
//     "symbol": "AAPL", "price": 190.4, "tf": "30m", "time": ... }
//
// A flat `pattern` + `bias` pair is accepted too. LONG biases are calls,
// SHORT biases puts. Swing horizon: monthly third Friday.
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

    let price = price_field(&payload, &["price", "current_price", "close"]);
    if price.is_none() {
        errors.push("missing price".to_string());
    }

    // Nested block wins; flat fields are the fallback.
    let strat = payload.get("strat").and_then(|v| v.as_object());
    let bias = strat
        .and_then(|s| s.get("bias"))
        .and_then(|v| v.as_str())
        .or_else(|| str_field(&payload, &["bias"]))
        .map(str::to_uppercase);
    let pattern = strat
        .and_then(|s| s.get("pattern"))
        .and_then(|v| v.as_str())
        .or_else(|| str_field(&payload, &["pattern"]))
        .map(str::to_uppercase);

    let direction = match bias.as_deref() {
        Some("LONG") | Some("BULLISH") | Some("BUY") => Some(Direction::Call),
        Some("SHORT") | Some("BEARISH") | Some("SELL") => Some(Direction::Put),
        Some(other) => {
            errors.push(format!("non-actionable bias '{other}'"));
            None
        }
        None => {
            errors.push("missing bias".to_string());
            None
        }
    };

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    let confidence = strat
        .and_then(|s| s.get("confidence"))
        .and_then(|v| v.as_f64())
        .or_else(|| f64_field(&payload, &["confidence"]))
        .unwrap_or(65.0)
        .clamp(0.0, 100.0);
    let timeframe = str_field(&payload, &["tf", "timeframe"]).unwrap_or("30m").to_string();
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 30.0, confidence);

    let mut extra = serde_json::Map::new();
    if let Some(pattern) = pattern {
        extra.insert("pattern".into(), pattern.into());
    }

    let signal = build_signal(
        correlation_id,
        SignalSource::StratEngine,
        symbol,
        direction,
        &timeframe,
        timestamp,
        confidence,
        price,
        false,
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
    use serde_json::json;

    use super::*;
    use crate::domain::OptionParams;

    #[test]
    fn nested_strat_block_parses() {
        let signal = parse(
            "c1",
            json!({
                "strat": {"pattern": "2-1-2", "bias": "LONG", "confidence": 72},
                "symbol": "AAPL",
                "price": 190.4,
                "tf": "30m"
            }),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Call);
        assert!((signal.source_confidence() - 72.0).abs() < f64::EPSILON);
        assert_eq!(signal.metadata["pattern"], "2-1-2");

        let params = OptionParams::from_metadata(&signal.metadata).unwrap();
        assert_eq!(params.quantity, 3);
    }

    #[test]
    fn flat_pattern_bias_parses() {
        let signal = parse(
            "c1",
            json!({"pattern": "3-1-2", "bias": "short", "symbol": "TSLA", "price": 250.6}),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Put);
        assert!((signal.source_confidence() - 65.0).abs() < f64::EPSILON);
    }

    #[test]
    fn inside_bar_bias_is_non_actionable() {
        let outcome = parse(
            "c1",
            json!({"strat": {"pattern": "1", "bias": "INSIDE"}, "symbol": "SPY", "price": 500.0}),
        );
        assert!(outcome.signal.is_none());
        assert!(outcome.errors[0].contains("non-actionable"));
    }
}
