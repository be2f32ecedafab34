// =============================================================================
// Engine Configuration — file + environment, validated at boot
// =============================================================================
//
// Central configuration hub for the Vega options engine. Settings load from
// an optional JSON file with serde defaults, then environment variables
// override. Invalid configuration aborts the process before any traffic is
// served.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::FatalConfigError;
use crate::types::TradingMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> String {
    "engine.db".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["SPY".to_string(), "QQQ".to_string(), "IWM".to_string()]
}

fn default_max_signal_age_minutes() -> i64 {
    15
}

fn default_dedup_ttl_seconds() -> u64 {
    60
}

fn default_dedup_granularity_seconds() -> i64 {
    60
}

fn default_max_vix_for_entry() -> f64 {
    30.0
}

fn default_vix_position_size_reduction() -> f64 {
    0.5
}

fn default_base_quantity() -> u32 {
    2
}

fn default_min_position_size() -> u32 {
    1
}

fn default_max_position_size() -> u32 {
    10
}

fn default_signal_processor_secs() -> u64 {
    30
}

fn default_order_creator_secs() -> u64 {
    30
}

fn default_paper_executor_secs() -> u64 {
    10
}

fn default_position_refresher_secs() -> u64 {
    60
}

fn default_exit_monitor_secs() -> u64 {
    60
}

fn default_order_poller_secs() -> u64 {
    30
}

fn default_gex_refresher_secs() -> u64 {
    900
}

fn default_worker_batch_size() -> usize {
    100
}

// =============================================================================
// Provider & broker sections
// =============================================================================

/// Market-data provider credentials. A provider participates in failover
/// only when fully configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub tradier_api_key: Option<String>,
    #[serde(default)]
    pub alpaca_api_key: Option<String>,
    #[serde(default)]
    pub alpaca_api_secret: Option<String>,
    #[serde(default)]
    pub polygon_api_key: Option<String>,
    /// Primary provider name; remaining configured providers are tried in
    /// declared order (tradier, alpaca, polygon).
    #[serde(default)]
    pub primary: Option<String>,
}

impl ProviderConfig {
    pub fn tradier_configured(&self) -> bool {
        self.tradier_api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    pub fn alpaca_configured(&self) -> bool {
        self.alpaca_api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self
                .alpaca_api_secret
                .as_deref()
                .is_some_and(|k| !k.is_empty())
    }

    pub fn polygon_configured(&self) -> bool {
        self.polygon_api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Broker adapter credentials. The preferred broker is used only when fully
/// configured; otherwise paper simulation is the fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub preferred: Option<String>,
    #[serde(default)]
    pub tradier_account_id: Option<String>,
    #[serde(default)]
    pub tradier_access_token: Option<String>,
    #[serde(default)]
    pub alpaca_api_key: Option<String>,
    #[serde(default)]
    pub alpaca_api_secret: Option<String>,
}

// =============================================================================
// Rule tuning
// =============================================================================

/// Risk gates applied by the decision orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// VIX level above which position sizes are cut (or entries rejected).
    #[serde(default = "default_max_vix_for_entry")]
    pub max_vix_for_entry: f64,

    /// Multiplier applied to quantity when the VIX gate trips (0.5 = halve).
    #[serde(default = "default_vix_position_size_reduction")]
    pub vix_position_size_reduction: f64,

    /// When set, a tripped VIX gate rejects the entry outright.
    #[serde(default)]
    pub vix_hard_reject: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_vix_for_entry: default_max_vix_for_entry(),
            vix_position_size_reduction: default_vix_position_size_reduction(),
            vix_hard_reject: false,
        }
    }
}

/// Position sizing bounds shared by the entry rule stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    #[serde(default = "default_base_quantity")]
    pub base_quantity: u32,
    #[serde(default = "default_min_position_size")]
    pub min_size: u32,
    #[serde(default = "default_max_position_size")]
    pub max_size: u32,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_quantity: default_base_quantity(),
            min_size: default_min_position_size(),
            max_size: default_max_position_size(),
        }
    }
}

/// Worker schedule intervals in seconds. Overridable for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIntervals {
    #[serde(default = "default_signal_processor_secs")]
    pub signal_processor_secs: u64,
    #[serde(default = "default_order_creator_secs")]
    pub order_creator_secs: u64,
    #[serde(default = "default_paper_executor_secs")]
    pub paper_executor_secs: u64,
    #[serde(default = "default_position_refresher_secs")]
    pub position_refresher_secs: u64,
    #[serde(default = "default_exit_monitor_secs")]
    pub exit_monitor_secs: u64,
    #[serde(default = "default_order_poller_secs")]
    pub order_poller_secs: u64,
    #[serde(default = "default_gex_refresher_secs")]
    pub gex_refresher_secs: u64,
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            signal_processor_secs: default_signal_processor_secs(),
            order_creator_secs: default_order_creator_secs(),
            paper_executor_secs: default_paper_executor_secs(),
            position_refresher_secs: default_position_refresher_secs(),
            exit_monitor_secs: default_exit_monitor_secs(),
            order_poller_secs: default_order_poller_secs(),
            gex_refresher_secs: default_gex_refresher_secs(),
            batch_size: default_worker_batch_size(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Vega engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// PAPER or LIVE.
    #[serde(default)]
    pub mode: TradingMode,

    /// Safety interlock: LIVE mode refuses to start unless this is set.
    #[serde(default)]
    pub live_trading_enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Symbols tracked by the GEX refresher.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Secret for HS256 bearer tokens. Required for authenticated endpoints.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Shared secret for webhook `x-signature` HMAC verification. Optional;
    /// when unset signatures are not checked.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Signals older than this are rejected at validation.
    #[serde(default = "default_max_signal_age_minutes")]
    pub max_signal_age_minutes: i64,

    /// Dedup cache TTL.
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,

    /// Timestamp bucket width for the dedup hash.
    #[serde(default = "default_dedup_granularity_seconds")]
    pub dedup_granularity_seconds: i64,

    #[serde(default)]
    pub providers: ProviderConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub sizing: SizingConfig,

    #[serde(default)]
    pub workers: WorkerIntervals,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::Paper,
            live_trading_enabled: false,
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            symbols: default_symbols(),
            jwt_secret: None,
            webhook_secret: None,
            max_signal_age_minutes: default_max_signal_age_minutes(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            dedup_granularity_seconds: default_dedup_granularity_seconds(),
            providers: ProviderConfig::default(),
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            workers: WorkerIntervals::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            symbols = ?config.symbols,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides on top of file/default values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("APP_MODE") {
            match mode.trim().to_uppercase().parse::<TradingMode>() {
                Ok(m) => self.mode = m,
                Err(_) => warn!(value = %mode, "ignoring invalid APP_MODE"),
            }
        }
        if let Ok(v) = std::env::var("LIVE_TRADING_ENABLED") {
            self.live_trading_enabled = v.trim().eq_ignore_ascii_case("true");
        }
        if let Ok(addr) = std::env::var("ENGINE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(db) = std::env::var("ENGINE_DB_PATH") {
            self.db_path = db;
        }
        if let Ok(syms) = std::env::var("ENGINE_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                self.jwt_secret = Some(secret);
            }
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook_secret = Some(secret);
            }
        }
        if let Ok(key) = std::env::var("TRADIER_API_KEY") {
            if !key.is_empty() {
                self.providers.tradier_api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var("ALPACA_API_KEY") {
            if !key.is_empty() {
                self.providers.alpaca_api_key = Some(key.clone());
                self.broker.alpaca_api_key.get_or_insert(key);
            }
        }
        if let Ok(key) = std::env::var("ALPACA_API_SECRET") {
            if !key.is_empty() {
                self.providers.alpaca_api_secret = Some(key.clone());
                self.broker.alpaca_api_secret.get_or_insert(key);
            }
        }
        if let Ok(key) = std::env::var("POLYGON_API_KEY") {
            if !key.is_empty() {
                self.providers.polygon_api_key = Some(key);
            }
        }
        if let Ok(primary) = std::env::var("MARKET_DATA_PROVIDER") {
            if !primary.is_empty() {
                self.providers.primary = Some(primary.to_lowercase());
            }
        }
        if let Ok(vix) = std::env::var("MAX_VIX_FOR_ENTRY") {
            match vix.parse::<f64>() {
                Ok(v) => self.risk.max_vix_for_entry = v,
                Err(_) => warn!(value = %vix, "ignoring invalid MAX_VIX_FOR_ENTRY"),
            }
        }
    }

    /// Validate the assembled configuration. Called once at boot; any error
    /// here is fatal.
    pub fn validate(&self) -> Result<(), FatalConfigError> {
        if self.mode == TradingMode::Live && !self.live_trading_enabled {
            return Err(FatalConfigError::Invalid(
                "APP_MODE=LIVE requires LIVE_TRADING_ENABLED=true".into(),
            ));
        }
        if self.mode == TradingMode::Live
            && self.broker.preferred.as_deref().unwrap_or("paper") != "paper"
        {
            let preferred = self.broker.preferred.as_deref().unwrap_or_default();
            let configured = match preferred {
                "tradier" => {
                    self.broker.tradier_account_id.is_some()
                        && self.broker.tradier_access_token.is_some()
                }
                "alpaca" => {
                    self.broker.alpaca_api_key.is_some() && self.broker.alpaca_api_secret.is_some()
                }
                _ => false,
            };
            if !configured {
                return Err(FatalConfigError::Invalid(format!(
                    "LIVE mode broker '{preferred}' is not fully configured"
                )));
            }
        }
        if self.symbols.is_empty() {
            return Err(FatalConfigError::Missing("symbols".into()));
        }
        if self.max_signal_age_minutes <= 0 {
            return Err(FatalConfigError::Invalid(
                "max_signal_age_minutes must be positive".into(),
            ));
        }
        if self.dedup_granularity_seconds <= 0 {
            return Err(FatalConfigError::Invalid(
                "dedup_granularity_seconds must be positive".into(),
            ));
        }
        if self.sizing.min_size == 0 || self.sizing.min_size > self.sizing.max_size {
            return Err(FatalConfigError::Invalid(format!(
                "sizing bounds invalid: min={} max={}",
                self.sizing.min_size, self.sizing.max_size
            )));
        }
        if !(0.0..=1.0).contains(&self.risk.vix_position_size_reduction) {
            return Err(FatalConfigError::Invalid(
                "vix_position_size_reduction must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.mode, TradingMode::Paper);
        assert!(!cfg.live_trading_enabled);
        assert_eq!(cfg.symbols, vec!["SPY", "QQQ", "IWM"]);
        assert_eq!(cfg.max_signal_age_minutes, 15);
        assert_eq!(cfg.dedup_ttl_seconds, 60);
        assert_eq!(cfg.workers.paper_executor_secs, 10);
        assert_eq!(cfg.workers.gex_refresher_secs, 900);
        assert_eq!(cfg.workers.batch_size, 100);
        assert!((cfg.risk.max_vix_for_entry - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, TradingMode::Paper);
        assert_eq!(cfg.sizing.base_quantity, 2);
        assert_eq!(cfg.workers.signal_processor_secs, 30);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "LIVE", "symbols": ["SPY"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["SPY"]);
        assert_eq!(cfg.dedup_ttl_seconds, 60);
    }

    #[test]
    fn live_mode_requires_interlock() {
        let mut cfg = EngineConfig::default();
        cfg.mode = TradingMode::Live;
        assert!(cfg.validate().is_err());

        cfg.live_trading_enabled = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn live_mode_requires_configured_broker() {
        let mut cfg = EngineConfig::default();
        cfg.mode = TradingMode::Live;
        cfg.live_trading_enabled = true;
        cfg.broker.preferred = Some("tradier".into());
        assert!(cfg.validate().is_err());

        cfg.broker.tradier_account_id = Some("ACC123".into());
        cfg.broker.tradier_access_token = Some("token".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_sizing_bounds_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.sizing.min_size = 5;
        cfg.sizing.max_size = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.workers.batch_size, cfg2.workers.batch_size);
    }
}
