// =============================================================================
// generic dialect — structural fallback for unrecognized sources
// =============================================================================
//
// Accepts any object carrying a symbol, a recognizable directional word, and
// a price. Swing horizon by default: monthly third Friday.
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

    let word = str_field(&payload, &["direction", "side", "trend", "sentiment", "signal"])
        .map(str::to_uppercase);
    let direction = match word.as_deref() {
        Some("CALL") | Some("BUY") | Some("LONG") | Some("BULLISH") | Some("UP") => {
            Some(Direction::Call)
        }
        Some("PUT") | Some("SELL") | Some("SHORT") | Some("BEARISH") | Some("DOWN") => {
            Some(Direction::Put)
        }
        Some(other) => {
            errors.push(format!("unrecognized direction '{other}'"));
            None
        }
        None => {
            errors.push("missing direction".to_string());
            None
        }
    };

    let price = price_field(&payload, &["price", "current_price", "close", "last"]);
    if price.is_none() {
        errors.push("missing price".to_string());
    }

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    let confidence = f64_field(&payload, &["confidence", "score"])
        .map(|c| if c <= 10.0 { c * 10.0 } else { c })
        .unwrap_or(50.0)
        .clamp(0.0, 100.0);
    let timeframe = str_field(&payload, &["timeframe", "tf"]).unwrap_or("1d").to_string();
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 25.0, confidence);

    let signal = build_signal(
        correlation_id,
        SignalSource::Generic,
        symbol,
        direction,
        &timeframe,
        timestamp,
        confidence,
        price,
        false,
        quantity,
        serde_json::Map::new(),
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
    fn minimal_payload_parses() {
        let signal = parse(
            "c1",
            json!({"symbol": "SPY", "direction": "CALL", "price": 500.0}),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Call);
        assert_eq!(signal.source, SignalSource::Generic);
        assert!((signal.source_confidence() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ten_point_scores_rescale() {
        let signal = parse(
            "c1",
            json!({"symbol": "SPY", "side": "SELL", "price": 500.0, "score": 7.0}),
        )
        .signal
        .unwrap();
        assert_eq!(signal.direction, Direction::Put);
        assert!((signal.source_confidence() - 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_everything_collects_all_errors() {
        let outcome = parse("c1", json!({"note": "hello"}));
        assert!(outcome.signal.is_none());
        assert_eq!(outcome.errors.len(), 3);
    }

    #[test]
    fn unknown_direction_word_is_rejected() {
        let outcome = parse(
            "c1",
            json!({"symbol": "SPY", "direction": "SIDEWAYS", "price": 500.0}),
        );
        assert!(outcome.signal.is_none());
        assert!(outcome.errors[0].contains("unrecognized direction"));
    }
}
