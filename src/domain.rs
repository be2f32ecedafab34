// =============================================================================
// Domain entities — signals, decisions, orders, trades, positions
// =============================================================================
//
// Ownership is by identifier reference; no entity mutates another's fields
// directly. Monetary values are `rust_decimal::Decimal` end to end and are
// persisted as TEXT, never as binary floats.
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    AlertPriority, DealerPosition, Direction, DecisionType, DecisionVerdict, ExitUrgency,
    MarketBias, OrderSide, OrderStatus, OrderType, PositionStatus, SignalSource, TimeInForce,
    TradingMode,
};

/// The per-options-contract multiplier. Applied exactly once, in position
/// P&L: `(current − entry) · quantity · 100`.
pub const CONTRACT_MULTIPLIER: Decimal = dec!(100);

/// Build an OCC-style option symbol, e.g. `SPY241219C00500000`.
pub fn occ_symbol(
    underlying: &str,
    expiration: NaiveDate,
    right: Direction,
    strike: Decimal,
) -> String {
    let right_char = match right {
        Direction::Call => 'C',
        Direction::Put => 'P',
    };
    // Strike is encoded as a zero-padded integer of price * 1000.
    let millis = (strike * dec!(1000)).trunc().to_i64().unwrap_or(0);
    format!(
        "{}{}{}{:0>8}",
        underlying.to_uppercase(),
        expiration.format("%y%m%d"),
        right_char,
        millis
    )
}

// =============================================================================
// Signal
// =============================================================================

/// Result of the entry decision for a signal. Written exactly once; a signal
/// with a non-null validation result is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// An external opinion, normalized from one of the webhook dialects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    /// Correlation id linking webhook receipt, decision, orders, and audit.
    pub correlation_id: String,
    pub source: SignalSource,
    pub symbol: String,
    pub direction: Direction,
    pub timeframe: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque bag carrying per-source confidence/score and derived option
    /// parameters.
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub validation_result: Option<ValidationResult>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        correlation_id: impl Into<String>,
        source: SignalSource,
        symbol: impl Into<String>,
        direction: Direction,
        timeframe: impl Into<String>,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.into(),
            source,
            symbol: symbol.into().to_uppercase(),
            direction,
            timeframe: timeframe.into(),
            timestamp,
            metadata,
            validation_result: None,
            created_at: Utc::now(),
        }
    }

    /// Per-source confidence in [0, 100], defaulting to 50 when the dialect
    /// did not supply one.
    pub fn source_confidence(&self) -> f64 {
        self.metadata
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(50.0)
            .clamp(0.0, 100.0)
    }
}

/// Option parameters derived at parse time and carried in signal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionParams {
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub quantity: u32,
    pub underlying_price: Decimal,
}

impl OptionParams {
    /// Read the derived parameters back out of a signal's metadata bag.
    pub fn from_metadata(metadata: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(metadata.get("option_params")?.clone()).ok()
    }
}

// =============================================================================
// Decision
// =============================================================================

/// One rule's contribution to a decision, in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule: String,
    pub adjustment: f64,
    pub reason: String,
}

/// Exit thresholds attached to an ENTER decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    pub stop_loss_pct: f64,
    pub target1_pct: f64,
    pub target2_pct: f64,
    pub trailing_stop_pct: f64,
    pub max_hold_hours: u32,
}

/// The orchestrator's output for a signal (entry) or a position (exit).
/// Append-only: one ENTRY decision per signal, zero or more EXIT decisions
/// per position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub signal_id: String,
    #[serde(default)]
    pub position_id: Option<String>,
    pub decision_type: DecisionType,
    pub decision: DecisionVerdict,
    /// Final confidence in [0, 100].
    pub confidence: f64,
    pub position_size: u32,
    pub reasoning: Vec<RuleHit>,
    pub calculations: serde_json::Value,
    #[serde(default)]
    pub context_snapshot: Option<serde_json::Value>,
    #[serde(default)]
    pub gex_snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Order
// =============================================================================

/// An intent to trade one option contract series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub signal_id: String,
    /// Pipeline-generated, globally unique.
    pub client_order_id: String,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    pub underlying: String,
    pub option_symbol: String,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub option_type: Direction,
    pub side: OrderSide,
    pub quantity: u32,
    pub order_type: OrderType,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub mode: TradingMode,
    pub status: OrderStatus,
    pub filled_quantity: u32,
    #[serde(default)]
    pub avg_fill_price: Option<Decimal>,
    /// For exit orders: CLOSE_FULL or CLOSE_PARTIAL.
    #[serde(default)]
    pub exit_action: Option<String>,
    #[serde(default)]
    pub exit_quantity: Option<u32>,
    /// For exit orders: the OPEN position this order closes. This is the
    /// authoritative linkage; exit fills never resolve positions by signal id.
    #[serde(default)]
    pub refactored_position_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_exit(&self) -> bool {
        self.refactored_position_id.is_some()
    }
}

// =============================================================================
// Trade
// =============================================================================

/// A broker-confirmed fill event (or paper simulation). Immutable after
/// insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub order_id: String,
    /// Per-contract premium.
    pub execution_price: Decimal,
    pub quantity: u32,
    pub commission: Decimal,
    pub fees: Decimal,
    /// `execution_price · quantity · 100 + commission + fees`.
    pub total_cost: Decimal,
    pub executed_at: DateTime<Utc>,
}

// =============================================================================
// Position
// =============================================================================

/// Net exposure resulting from an entry fill. At most one OPEN row per
/// signal id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub signal_id: String,
    /// Underlying symbol.
    pub symbol: String,
    pub direction: Direction,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub quantity: u32,
    /// Per-contract premium paid at entry.
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub exit_price: Option<Decimal>,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: Option<Decimal>,
    pub status: PositionStatus,
    /// Highest per-contract premium seen since entry.
    #[serde(default)]
    pub high_water_mark: Option<Decimal>,
    #[serde(default)]
    pub entry_iv: Option<f64>,
    /// Set once a CLOSE_PARTIAL exit has filled; gates target-1 re-entry.
    #[serde(default)]
    pub partial_exit_taken: bool,
}

impl Position {
    /// Unrealized gain as a fraction of entry premium (0.10 = +10 %).
    pub fn gain_fraction(&self) -> Option<f64> {
        let current = self.current_price?;
        if self.entry_price.is_zero() {
            return None;
        }
        ((current - self.entry_price) / self.entry_price).to_f64()
    }

    /// Hours the position has been open as of `now`.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.entry_time).num_seconds() as f64 / 3600.0
    }

    /// Calendar days to expiration as of `now`.
    pub fn days_to_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expiration - now.date_naive()).num_days()
    }
}

// =============================================================================
// Market context & GEX
// =============================================================================

/// Time-stamped market regime data, produced externally; the context cache
/// reads the most recent row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub vix: f64,
    pub trend: MarketBias,
    pub bias: MarketBias,
    pub regime: String,
    /// Confidence of the regime classification in [0, 100].
    pub regime_confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Gamma-exposure summary per (symbol, timeframe), persisted by the GEX
/// refresher and read by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GexSummary {
    pub id: String,
    pub symbol: String,
    pub timeframe: String,
    /// Net dealer gamma in dollar terms.
    pub net_gex: f64,
    /// Normalized signal strength in [-1, 1].
    pub strength: f64,
    pub direction: MarketBias,
    pub dealer_position: DealerPosition,
    #[serde(default)]
    pub zero_gamma_level: Option<Decimal>,
    #[serde(default)]
    pub call_wall: Option<Decimal>,
    #[serde(default)]
    pub put_wall: Option<Decimal>,
    #[serde(default)]
    pub max_pain: Option<Decimal>,
    #[serde(default)]
    pub pc_ratio: Option<f64>,
    /// Set when net gamma flipped sign since the previous summary.
    pub flip_detected: bool,
    #[serde(default)]
    pub flip_direction: Option<MarketBias>,
    pub regime: String,
    pub timestamp: DateTime<Utc>,
}

impl GexSummary {
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }
}

// =============================================================================
// Risk limits & exit rules
// =============================================================================

/// Current-mode risk configuration; the most recent active row per mode is
/// authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    pub id: String,
    pub mode: TradingMode,
    pub max_open_positions: u32,
    pub max_daily_loss: Decimal,
    pub max_delta_exposure: f64,
    pub max_theta_exposure: f64,
    pub max_vega_exposure: f64,
    /// Require multi-timeframe agreement before entries.
    pub require_mtf_agreement: bool,
    pub auto_close_enabled: bool,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl RiskLimits {
    pub fn defaults_for(mode: TradingMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            max_open_positions: 5,
            max_daily_loss: dec!(1000),
            max_delta_exposure: 500.0,
            max_theta_exposure: 100.0,
            max_vega_exposure: 200.0,
            require_mtf_agreement: false,
            auto_close_enabled: true,
            active: true,
            updated_at: Utc::now(),
        }
    }
}

/// Active exit thresholds per mode, used when an entry decision carried no
/// trade plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRules {
    pub id: String,
    pub mode: TradingMode,
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: f64,
    pub min_days_to_expiration: u32,
    pub max_days_in_trade: u32,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl ExitRules {
    pub fn defaults_for(mode: TradingMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mode,
            profit_target_pct: 50.0,
            stop_loss_pct: 50.0,
            trailing_stop_pct: 15.0,
            min_days_to_expiration: 1,
            max_days_in_trade: 7,
            active: true,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Audit & failures
// =============================================================================

/// Append-only audit record; queryable by date range, symbol, or signal id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub event: crate::types::AuditEvent,
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub decision_type: Option<DecisionType>,
    #[serde(default)]
    pub decision: Option<DecisionVerdict>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One row per pipeline rejection, tagged with the stage that rejected it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFailure {
    pub id: String,
    pub correlation_id: String,
    pub stage: crate::types::PipelineStage,
    pub reason: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Exit alerts (exit monitor & /exit-signals surface)
// =============================================================================

/// A recommendation produced by exit evaluation for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitAlert {
    pub position_id: String,
    pub symbol: String,
    pub rule: String,
    pub reason: String,
    /// CLOSE_FULL or CLOSE_PARTIAL.
    pub action: String,
    /// Contracts to close.
    pub quantity: u32,
    pub urgency: ExitUrgency,
    pub priority: AlertPriority,
    #[serde(default)]
    pub current_price: Option<Decimal>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occ_symbol_encoding() {
        let exp = NaiveDate::from_ymd_opt(2024, 12, 19).unwrap();
        assert_eq!(
            occ_symbol("SPY", exp, Direction::Call, dec!(500)),
            "SPY241219C00500000"
        );
        assert_eq!(
            occ_symbol("iwm", exp, Direction::Put, dec!(197.5)),
            "IWM241219P00197500"
        );
    }

    #[test]
    fn position_gain_fraction() {
        let mut pos = sample_position();
        pos.entry_price = dec!(5.00);
        pos.current_price = Some(dec!(6.00));
        let gain = pos.gain_fraction().unwrap();
        assert!((gain - 0.20).abs() < 1e-9);

        pos.current_price = None;
        assert!(pos.gain_fraction().is_none());
    }

    #[test]
    fn position_dte_and_age() {
        let pos = sample_position();
        let now = pos.entry_time + chrono::Duration::hours(36);
        assert!((pos.age_hours(now) - 36.0).abs() < 1e-9);
        let dte = pos.days_to_expiration(now);
        assert!(dte > 0);
    }

    #[test]
    fn option_params_metadata_roundtrip() {
        let params = OptionParams {
            strike: dec!(500),
            expiration: NaiveDate::from_ymd_opt(2026, 9, 18).unwrap(),
            quantity: 3,
            underlying_price: dec!(502.15),
        };
        let metadata = serde_json::json!({
            "confidence": 80.0,
            "option_params": params,
        });
        assert_eq!(OptionParams::from_metadata(&metadata), Some(params));
        assert_eq!(OptionParams::from_metadata(&serde_json::json!({})), None);
    }

    fn sample_position() -> Position {
        Position {
            id: "p1".into(),
            signal_id: "s1".into(),
            symbol: "SPY".into(),
            direction: Direction::Call,
            strike: dec!(500),
            expiration: Utc::now().date_naive() + chrono::Duration::days(14),
            quantity: 2,
            entry_price: dec!(5.00),
            entry_time: Utc::now() - chrono::Duration::hours(1),
            current_price: Some(dec!(5.50)),
            unrealized_pnl: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            high_water_mark: Some(dec!(5.50)),
            entry_iv: None,
            partial_exit_taken: false,
        }
    }
}
