// =============================================================================
// Shared types used across the Vega options engine
// =============================================================================
//
// Every enum here is a closed set that persists as TEXT in the store, so each
// one carries a stable `as_str` / `FromStr` pair in addition to serde derives.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a persisted enum string no longer matches a variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl std::fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {} value: '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable string form used for persistence and API payloads.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Engine mode
// =============================================================================

/// Whether orders are simulated locally or forwarded to a live broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Paper,
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paper
    }
}

text_enum!(TradingMode, "trading mode", {
    Paper => "PAPER",
    Live => "LIVE",
});

// =============================================================================
// Signals
// =============================================================================

/// Directional opinion carried by a signal; doubles as the option right on
/// derived orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Call,
    Put,
}

text_enum!(Direction, "direction", {
    Call => "CALL",
    Put => "PUT",
});

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Call => Self::Put,
            Self::Put => Self::Call,
        }
    }
}

/// Known webhook payload dialects plus the structural fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalSource {
    #[serde(rename = "ultimate-option")]
    UltimateOption,
    #[serde(rename = "saty-phase")]
    SatyPhase,
    #[serde(rename = "mtf-trend-dots")]
    MtfTrendDots,
    #[serde(rename = "orb-bhch")]
    OrbBhch,
    #[serde(rename = "strat-engine")]
    StratEngine,
    #[serde(rename = "generic")]
    Generic,
}

text_enum!(SignalSource, "signal source", {
    UltimateOption => "ultimate-option",
    SatyPhase => "saty-phase",
    MtfTrendDots => "mtf-trend-dots",
    OrbBhch => "orb-bhch",
    StratEngine => "strat-engine",
    Generic => "generic",
});

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

text_enum!(OrderSide, "order side", {
    Buy => "BUY",
    Sell => "SELL",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

text_enum!(OrderType, "order type", {
    Market => "MARKET",
    Limit => "LIMIT",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Day
    }
}

text_enum!(TimeInForce, "time in force", {
    Day => "DAY",
    Gtc => "GTC",
    Ioc => "IOC",
    Fok => "FOK",
});

/// Order state machine. Terminal states never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

text_enum!(OrderStatus, "order status", {
    Pending => "PENDING",
    Submitted => "SUBMITTED",
    Partial => "PARTIAL",
    Filled => "FILLED",
    Cancelled => "CANCELLED",
    Rejected => "REJECTED",
    Expired => "EXPIRED",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

text_enum!(PositionStatus, "position status", {
    Open => "OPEN",
    Closed => "CLOSED",
});

// =============================================================================
// Decisions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionType {
    Entry,
    Exit,
}

text_enum!(DecisionType, "decision type", {
    Entry => "ENTRY",
    Exit => "EXIT",
});

/// The orchestrator's verdict for a signal or an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionVerdict {
    Enter,
    Reject,
    Exit,
    Hold,
}

text_enum!(DecisionVerdict, "decision verdict", {
    Enter => "ENTER",
    Reject => "REJECT",
    Exit => "EXIT",
    Hold => "HOLD",
});

// =============================================================================
// Exits
// =============================================================================

/// How fast an exit should happen; maps to the order type used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitUrgency {
    Immediate,
    Soon,
    Optional,
}

text_enum!(ExitUrgency, "exit urgency", {
    Immediate => "IMMEDIATE",
    Soon => "SOON",
    Optional => "OPTIONAL",
});

impl ExitUrgency {
    /// IMMEDIATE exits go to market; everything else limits at current price.
    pub fn order_type(&self) -> OrderType {
        match self {
            Self::Immediate => OrderType::Market,
            Self::Soon | Self::Optional => OrderType::Limit,
        }
    }
}

/// Exit alert severity for the `/exit-signals` surface, sorted descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertPriority {
    Critical,
    High,
    Medium,
    Low,
}

text_enum!(AlertPriority, "alert priority", {
    Critical => "CRITICAL",
    High => "HIGH",
    Medium => "MEDIUM",
    Low => "LOW",
});

// =============================================================================
// Pipeline & audit
// =============================================================================

/// Stage of the signal pipeline; every rejection is tagged with one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineStage {
    Normalization,
    Validation,
    Deduplication,
    Decision,
    Persistence,
}

text_enum!(PipelineStage, "pipeline stage", {
    Normalization => "NORMALIZATION",
    Validation => "VALIDATION",
    Deduplication => "DEDUPLICATION",
    Decision => "DECISION",
    Persistence => "PERSISTENCE",
});

/// Audit log event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SignalReceived,
    DecisionMade,
    TradeOpened,
    TradeClosed,
}

text_enum!(AuditEvent, "audit event", {
    SignalReceived => "signal_received",
    DecisionMade => "decision_made",
    TradeOpened => "trade_opened",
    TradeClosed => "trade_closed",
});

// =============================================================================
// Market context
// =============================================================================

/// Directional bias of the broad market or of dealer positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketBias {
    Bullish,
    Bearish,
    Neutral,
}

text_enum!(MarketBias, "market bias", {
    Bullish => "BULLISH",
    Bearish => "BEARISH",
    Neutral => "NEUTRAL",
});

impl MarketBias {
    /// Whether this bias agrees with a trade direction (calls want bullish,
    /// puts want bearish; NEUTRAL agrees with neither).
    pub fn aligns_with(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Bullish, Direction::Call) | (Self::Bearish, Direction::Put)
        )
    }

    pub fn opposes(&self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Bullish, Direction::Put) | (Self::Bearish, Direction::Call)
        )
    }
}

/// Net dealer gamma positioning derived from the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealerPosition {
    LongGamma,
    ShortGamma,
}

text_enum!(DealerPosition, "dealer position", {
    LongGamma => "LONG_GAMMA",
    ShortGamma => "SHORT_GAMMA",
});

// =============================================================================
// Tests
// =============================================================================
