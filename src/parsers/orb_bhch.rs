// =============================================================================
// orb-bhch dialect — opening-range breakout / break-high-close-high events
// =============================================================================
//
// Shape:
//   { "event": "ORB_BREAKOUT_HIGH"|"ORB_BREAKOUT_LOW"|"BHCH"|"BLCL",
//     "ticker": "IWM", "price": 199.2,
//     "range_high": 198.9, "range_low": 197.5, "time": ... }
//
// Breakouts above the range are calls, below are puts. Confidence grows
// with the breakout margin beyond the range bound. Intraday: weekly Friday.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;

use crate::types::{Direction, SignalSource};

use super::{build_signal, derive, price_field, str_field, timestamp_field, ParseOutcome};

pub(super) fn parse(correlation_id: &str, payload: Value) -> ParseOutcome {
    let mut errors = Vec::new();

    let symbol = str_field(&payload, &["ticker", "symbol"]);
    if symbol.is_none() {
        errors.push("missing ticker".to_string());
    }

    let price = price_field(&payload, &["price", "current_price", "close"]);
    if price.is_none() {
        errors.push("missing price".to_string());
    }

    let event = str_field(&payload, &["event"]).map(str::to_uppercase);
    let direction = match event.as_deref() {
        Some("ORB_BREAKOUT_HIGH") | Some("BHCH") => Some(Direction::Call),
        Some("ORB_BREAKOUT_LOW") | Some("BLCL") => Some(Direction::Put),
        Some(other) => {
            errors.push(format!("non-actionable event '{other}'"));
            None
        }
        None => {
            // Range bounds without an event: infer from price vs range.
            match (
                price,
                price_field(&payload, &["range_high"]),
                price_field(&payload, &["range_low"]),
            ) {
                (Some(p), Some(high), _) if p > high => Some(Direction::Call),
                (Some(p), _, Some(low)) if p < low => Some(Direction::Put),
                _ => {
                    errors.push("price inside opening range — no breakout".to_string());
                    None
                }
            }
        }
    };

    let (Some(symbol), Some(direction), Some(price)) = (symbol, direction, price) else {
        return ParseOutcome::rejected(errors, payload);
    };

    // Margin beyond the broken bound, as a percentage of it.
    let margin_pct = match direction {
        Direction::Call => price_field(&payload, &["range_high"])
            .filter(|h| !h.is_zero())
            .map(|h| ((price - h) / h * rust_decimal_macros::dec!(100)).to_f64().unwrap_or(0.0)),
        Direction::Put => price_field(&payload, &["range_low"])
            .filter(|l| !l.is_zero())
            .map(|l| ((l - price) / l * rust_decimal_macros::dec!(100)).to_f64().unwrap_or(0.0)),
    }
    .unwrap_or(0.0)
    .max(0.0);

    let confidence = (50.0 + margin_pct * 20.0).clamp(0.0, 100.0);
    let timeframe = str_field(&payload, &["timeframe", "tf"]).unwrap_or("5m").to_string();
    let timestamp = timestamp_field(&payload, &["timestamp", "time"]);
    let quantity = derive::scale_quantity(1.0, 35.0, confidence);

    let mut extra = serde_json::Map::new();
    if let Some(event) = event {
        extra.insert("event".into(), event.into());
    }
    extra.insert("breakout_margin_pct".into(), margin_pct.into());

    let signal = build_signal(
        correlation_id,
        SignalSource::OrbBhch,
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
