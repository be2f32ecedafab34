// =============================================================================
// mtf-trend-dots dialect — multi-timeframe trend dot matrix
// =============================================================================
//
// Shape:
//   { "dots": {"5m": "UP", "15m": "UP", "1h": "UP", "4h": "DOWN"},
//     "symbol": "QQQ", "price": 430.5, "time": ... }
//
// Direction is the majority of the dots; a tie is non-actionable.
// Confidence is the aligned fraction. Intraday horizon: weekly Friday.
// =============================================================================

use serde_json::Value;

use crate::types::{Direction, SignalSource};

use super::{build_signal, derive, price_field, str_field, timestamp_field, ParseOutcome};

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

    let dots = payload
        .get("dots")
        .or_else(|| payload.get("mtf_dots"))
        .and_then(|v| v.as_object());

    let mut up = 0usize;
    let mut down = 0usize;
    if let Some(dots) = dots {
        for value in dots.values() {
            match value.as_str().map(str::to_uppercase).as_deref() {
                Some("UP") | Some("BULL") | Some("GREEN") => up += 1,
                Some("DOWN") | Some("BEAR") | Some("RED") => down += 1,
                _ => {}
            }
        }
        if up + down == 0 {
            errors.push("dots carry no recognizable trend values".to_string());
        }
    } else {
        errors.push("missing dots map".to_string());
    }

    let direction = if up > down {
        Some(Direction::Call)
    } else if down > up {
        Some(Direction::Put)
    } else {
        if up + down > 0 {
            errors.push("timeframes tied — no majority trend".to_string());
        }
        None
    };

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    let total = (up + down) as f64;
    let aligned = up.max(down) as f64;
    let confidence = (aligned / total * 100.0).clamp(0.0, 100.0);
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 40.0, confidence);

    let mut extra = serde_json::Map::new();
    extra.insert("dots_up".into(), up.into());
    extra.insert("dots_down".into(), down.into());

    let signal = build_signal(
        correlation_id,
        SignalSource::MtfTrendDots,
        symbol,
        direction,
        "mtf",
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
    use serde_json::json;

    use super::*;

    #[test]
    fn majority_up_is_a_call() {
        let signal = parse(
            "c1",
            json!({
                "dots": {"5m": "UP", "15m": "UP", "1h": "UP", "4h": "DOWN"},
                "symbol": "QQQ",
                "price": 430.5
            }),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Call);
        assert!((signal.source_confidence() - 75.0).abs() < f64::EPSILON);
        assert_eq!(signal.timeframe, "mtf");
    }

    #[test]
    fn majority_down_is_a_put() {
        let signal = parse(
            "c1",
            json!({
                "dots": {"5m": "RED", "15m": "DOWN", "1h": "UP"},
                "symbol": "SPY",
                "price": 500.0
            }),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Put);
    }

    #[test]
    fn tie_is_non_actionable() {
        let outcome = parse(
            "c1",
            json!({
                "dots": {"5m": "UP", "1h": "DOWN"},
                "symbol": "SPY",
                "price": 500.0
            }),
        );
        assert!(outcome.signal.is_none());
        assert!(outcome.errors.iter().any(|e| e.contains("tied")));
    }

    #[test]
    fn unrecognized_dots_are_rejected() {
        let outcome = parse(
            "c1",
            json!({"dots": {"5m": "SIDEWAYS"}, "symbol": "SPY", "price": 500.0}),
        );
        assert!(outcome.signal.is_none());
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("no recognizable trend")));
    }
}
