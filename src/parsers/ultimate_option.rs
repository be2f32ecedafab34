// =============================================================================
// ultimate-option dialect — trend + score alerts
// =============================================================================
//
// Shape:
//   { "trend": "BULLISH"|"BEARISH", "ticker": "SPY", "current_price": 502.15,
//     "score": 8.5, "timestamp": ..., "timeframe": "15m" }
//
// Score is 0–10; confidence is score·10. Positional horizon is swing-length,
// so expiration is the next monthly third Friday.
// =============================================================================

use serde_json::Value;

use crate::types::{Direction, SignalSource};

use super::{build_signal, derive, f64_field, price_field, str_field, timestamp_field, ParseOutcome};

pub(super) fn parse(correlation_id: &str, payload: Value) -> ParseOutcome {
    let mut errors = Vec::new();

    let symbol = str_field(&payload, &["ticker", "symbol"]);
    if symbol.is_none() {
        errors.push("missing ticker".to_string());
    }

    let direction = match str_field(&payload, &["trend"]).map(str::to_uppercase).as_deref() {
        Some("BULLISH") => Some(Direction::Call),
        Some("BEARISH") => Some(Direction::Put),
        Some(other) => {
            errors.push(format!("non-actionable trend '{other}'"));
            None
        }
        None => {
            errors.push("missing trend".to_string());
            None
        }
    };

    let price = price_field(&payload, &["current_price", "price", "close"]);
    if price.is_none() {
        errors.push("missing current_price".to_string());
    }

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    let score = f64_field(&payload, &["score"]).unwrap_or(5.0);
    let confidence = (score * 10.0).clamp(0.0, 100.0);
    let timeframe = str_field(&payload, &["timeframe", "tf"]).unwrap_or("15m").to_string();
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 25.0, confidence);

    let mut extra = serde_json::Map::new();
    extra.insert("score".into(), score.into());

    let signal = build_signal(
        correlation_id,
        SignalSource::UltimateOption,
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
