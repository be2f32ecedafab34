// =============================================================================
// Indicator Parsers — dialect detection and normalization registry
// =============================================================================
//
// `detect_indicator_source` inspects structural markers most-specific-first
// and returns the dialect tag; `parse_payload` dispatches to that dialect's
// parser. Every parser yields a `ParseOutcome`: a normalized signal, or the
// reasons it was rejected (malformed / non-actionable / validation), plus a
// test-ping flag.
//
// All actionable signals are admitted here — scoring is the orchestrator's
// concern.
// =============================================================================

pub mod derive;
mod generic;
mod mtf_trend_dots;
mod orb_bhch;
mod saty_phase;
mod strat_engine;
mod ultimate_option;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::{OptionParams, Signal};
use crate::types::{Direction, SignalSource};

// =============================================================================
// Outcome
// =============================================================================

/// Result of normalizing one webhook payload.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub signal: Option<Signal>,
    pub errors: Vec<String>,
    pub raw_payload: Value,
    pub is_test: bool,
}

impl ParseOutcome {
    fn signal(signal: Signal, raw_payload: Value) -> Self {
        Self {
            signal: Some(signal),
            errors: Vec::new(),
            raw_payload,
            is_test: false,
        }
    }

    fn rejected(errors: Vec<String>, raw_payload: Value) -> Self {
        Self {
            signal: None,
            errors,
            raw_payload,
            is_test: false,
        }
    }

    fn test_ping(raw_payload: Value) -> Self {
        Self {
            signal: None,
            errors: Vec::new(),
            raw_payload,
            is_test: true,
        }
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Identify the payload dialect by structural markers, most specific first.
pub fn detect_indicator_source(payload: &Value) -> SignalSource {
    let Some(obj) = payload.as_object() else {
        return SignalSource::Generic;
    };

    // saty-phase: a phase field is unique to the Saty phase oscillator.
    if obj.contains_key("phase") {
        return SignalSource::SatyPhase;
    }
    // mtf-trend-dots: per-timeframe dot map.
    if obj.contains_key("dots") || obj.contains_key("mtf_dots") {
        return SignalSource::MtfTrendDots;
    }
    // strat-engine: nested strat block or pattern+bias pair.
    if obj.contains_key("strat") || (obj.contains_key("pattern") && obj.contains_key("bias")) {
        return SignalSource::StratEngine;
    }
    // orb-bhch: opening-range events or range bounds.
    let orb_event = obj
        .get("event")
        .and_then(|v| v.as_str())
        .map(|e| {
            let e = e.to_uppercase();
            e.starts_with("ORB") || e == "BHCH" || e == "BLCL"
        })
        .unwrap_or(false);
    if orb_event || (obj.contains_key("range_high") && obj.contains_key("range_low")) {
        return SignalSource::OrbBhch;
    }
    // ultimate-option: trend + score pair.
    if obj.contains_key("trend") && obj.contains_key("score") {
        return SignalSource::UltimateOption;
    }

    SignalSource::Generic
}

/// Detect the dialect and run its parser.
pub fn parse_payload(correlation_id: &str, payload: Value) -> (SignalSource, ParseOutcome) {
    let source = detect_indicator_source(&payload);

    if !payload.is_object() {
        return (
            source,
            ParseOutcome::rejected(vec!["payload is not a JSON object".into()], payload),
        );
    }
    if is_test_ping(&payload) {
        return (source, ParseOutcome::test_ping(payload));
    }

    let outcome = match source {
        SignalSource::UltimateOption => ultimate_option::parse(correlation_id, payload),
        SignalSource::SatyPhase => saty_phase::parse(correlation_id, payload),
        SignalSource::MtfTrendDots => mtf_trend_dots::parse(correlation_id, payload),
        SignalSource::OrbBhch => orb_bhch::parse(correlation_id, payload),
        SignalSource::StratEngine => strat_engine::parse(correlation_id, payload),
        SignalSource::Generic => generic::parse(correlation_id, payload),
    };
    (source, outcome)
}

// =============================================================================
// Shared field helpers
// =============================================================================

fn is_test_ping(payload: &Value) -> bool {
    if payload.get("test").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }
    matches!(
        payload
            .get("event")
            .or_else(|| payload.get("type"))
            .and_then(|v| v.as_str())
            .map(str::to_uppercase)
            .as_deref(),
        Some("TEST") | Some("PING")
    )
}

/// First present string among `keys`, trimmed and non-empty.
fn str_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// First present numeric among `keys` (accepts numbers or numeric strings).
fn f64_field(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| payload.get(*k)).find_map(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    })
}

/// Underlying price as a Decimal.
fn price_field(payload: &Value, keys: &[&str]) -> Option<Decimal> {
    f64_field(payload, keys).and_then(Decimal::from_f64)
}

/// Timestamp from RFC 3339 strings or epoch seconds/milliseconds; defaults
/// to now when the source sent none.
fn timestamp_field(payload: &Value, keys: &[&str]) -> DateTime<Utc> {
    for key in keys {
        let Some(value) = payload.get(*key) else {
            continue;
        };
        if let Some(s) = value.as_str() {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s.trim()) {
                return dt.with_timezone(&Utc);
            }
            if let Ok(epoch) = s.trim().parse::<i64>() {
                if let Some(dt) = epoch_to_datetime(epoch) {
                    return dt;
                }
            }
        }
        if let Some(epoch) = value.as_i64() {
            if let Some(dt) = epoch_to_datetime(epoch) {
                return dt;
            }
        }
    }
    Utc::now()
}

fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    // Heuristic: values beyond the year ~33658 in seconds are milliseconds.
    if epoch > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// Assemble the normalized signal with derived option parameters in the
/// metadata bag.
#[allow(clippy::too_many_arguments)]
fn build_signal(
    correlation_id: &str,
    source: SignalSource,
    symbol: &str,
    direction: Direction,
    timeframe: &str,
    timestamp: DateTime<Utc>,
    confidence: f64,
    underlying_price: Decimal,
    weekly_expiry: bool,
    quantity: u32,
    extra_metadata: serde_json::Map<String, Value>,
) -> Signal {
    let today = timestamp.date_naive();
    let expiration = if weekly_expiry {
        derive::next_weekly_friday(today)
    } else {
        derive::next_monthly_expiration(today)
    };

    let params = OptionParams {
        strike: derive::atm_strike(underlying_price),
        expiration,
        quantity,
        underlying_price,
    };

    let mut metadata = extra_metadata;
    metadata.insert("confidence".into(), confidence.clamp(0.0, 100.0).into());
    metadata.insert(
        "option_params".into(),
        serde_json::to_value(&params).expect("option params serialize"),
    );

    Signal::new(
        correlation_id,
        source,
        symbol,
        direction,
        timeframe,
        timestamp,
        Value::Object(metadata),
    )
}

// =============================================================================
// Tests
// =============================================================================
