// =============================================================================
// Store — single transactional gateway over SQLite
// =============================================================================
//
// Every durable mutation in the engine goes through this type; no component
// issues ad-hoc SQL elsewhere. Multi-statement writes (order insert +
// position insert + signal status update) run inside one transaction via
// `with_transaction`.
//
// Monetary columns are TEXT-encoded `Decimal`. Enum columns are TEXT via the
// `as_str`/`FromStr` pairs in `types.rs`. Status transitions that can race
// between workers use guarded UPDATEs (`WHERE status = expected`); zero rows
// updated surfaces as `StoreError::Conflict`.
// =============================================================================

mod admin;
mod orders;
mod positions;
mod signals;

pub use admin::{AuditFilter, RiskLimitsPatch};
pub use positions::PositionAggregates;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Transaction};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use crate::errors::StoreError;

/// Transactional persistence gateway. Cheap to clone; all clones share one
/// serialized connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, path)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, path: &str) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        create_schema(&conn)?;
        info!(path, "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against a transaction; commit on Ok, roll back on Err.
    pub async fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only closure against the raw connection.
    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Liveness probe for the health surface.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

// =============================================================================
// Schema
// =============================================================================

fn create_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS signals (
            id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            source TEXT NOT NULL,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            metadata TEXT NOT NULL,
            validation_result TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_status_created
            ON signals(status, created_at);

        CREATE TABLE IF NOT EXISTS decisions (
            id TEXT PRIMARY KEY,
            signal_id TEXT NOT NULL,
            position_id TEXT,
            decision_type TEXT NOT NULL,
            decision TEXT NOT NULL,
            confidence REAL NOT NULL,
            position_size INTEGER NOT NULL,
            reasoning TEXT NOT NULL,
            calculations TEXT NOT NULL,
            context_snapshot TEXT,
            gex_snapshot TEXT,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_entry_signal
            ON decisions(signal_id) WHERE decision_type = 'ENTRY';

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            signal_id TEXT NOT NULL,
            client_order_id TEXT NOT NULL UNIQUE,
            broker_order_id TEXT,
            underlying TEXT NOT NULL,
            option_symbol TEXT NOT NULL,
            strike TEXT NOT NULL,
            expiration TEXT NOT NULL,
            option_type TEXT NOT NULL,
            side TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            order_type TEXT NOT NULL,
            limit_price TEXT,
            time_in_force TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            filled_quantity INTEGER NOT NULL DEFAULT 0,
            avg_fill_price TEXT,
            exit_action TEXT,
            exit_quantity INTEGER,
            refactored_position_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_orders_signal ON orders(signal_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status_mode ON orders(status, mode);
        CREATE INDEX IF NOT EXISTS idx_orders_position
            ON orders(refactored_position_id);

        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL,
            execution_price TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            commission TEXT NOT NULL,
            fees TEXT NOT NULL,
            total_cost TEXT NOT NULL,
            executed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(order_id);

        CREATE TABLE IF NOT EXISTS positions (
            id TEXT PRIMARY KEY,
            signal_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            direction TEXT NOT NULL,
            strike TEXT NOT NULL,
            expiration TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            entry_price TEXT NOT NULL,
            entry_time TEXT NOT NULL,
            current_price TEXT,
            unrealized_pnl TEXT,
            exit_price TEXT,
            exit_time TEXT,
            realized_pnl TEXT,
            status TEXT NOT NULL,
            high_water_mark TEXT,
            entry_iv REAL,
            partial_exit_taken INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_signal
            ON positions(signal_id) WHERE status = 'OPEN';
        CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status);

        CREATE TABLE IF NOT EXISTS context_snapshots (
            id TEXT PRIMARY KEY,
            vix REAL NOT NULL,
            trend TEXT NOT NULL,
            bias TEXT NOT NULL,
            regime TEXT NOT NULL,
            regime_confidence REAL NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_context_ts ON context_snapshots(timestamp DESC);

        CREATE TABLE IF NOT EXISTS gex_summaries (
            id TEXT PRIMARY KEY,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            net_gex REAL NOT NULL,
            strength REAL NOT NULL,
            direction TEXT NOT NULL,
            dealer_position TEXT NOT NULL,
            zero_gamma_level TEXT,
            call_wall TEXT,
            put_wall TEXT,
            max_pain TEXT,
            pc_ratio REAL,
            flip_detected INTEGER NOT NULL DEFAULT 0,
            flip_direction TEXT,
            regime TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_gex_symbol_tf_ts
            ON gex_summaries(symbol, timeframe, timestamp DESC);

        CREATE TABLE IF NOT EXISTS risk_limits (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            max_open_positions INTEGER NOT NULL,
            max_daily_loss TEXT NOT NULL,
            max_delta_exposure REAL NOT NULL,
            max_theta_exposure REAL NOT NULL,
            max_vega_exposure REAL NOT NULL,
            require_mtf_agreement INTEGER NOT NULL,
            auto_close_enabled INTEGER NOT NULL,
            active INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_risk_limits_mode
            ON risk_limits(mode, active, updated_at DESC);

        CREATE TABLE IF NOT EXISTS exit_rules (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            profit_target_pct REAL NOT NULL,
            stop_loss_pct REAL NOT NULL,
            trailing_stop_pct REAL NOT NULL,
            min_days_to_expiration INTEGER NOT NULL,
            max_days_in_trade INTEGER NOT NULL,
            active INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_exit_rules_mode
            ON exit_rules(mode, active, updated_at DESC);

        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            event TEXT NOT NULL,
            signal_id TEXT,
            symbol TEXT,
            correlation_id TEXT,
            decision_type TEXT,
            decision TEXT,
            details TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_audit_symbol ON audit_log(symbol);
        CREATE INDEX IF NOT EXISTS idx_audit_signal ON audit_log(signal_id);

        CREATE TABLE IF NOT EXISTS pipeline_failures (
            id TEXT PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            reason TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_failures_created
            ON pipeline_failures(created_at DESC);
        ",
    )?;
    Ok(())
}

// =============================================================================
// Row-mapping helpers
// =============================================================================

/// Wrap a column conversion failure so it can flow out of a `query_map`
/// closure; `Store` methods re-classify it as `StoreError::Corrupt`.
pub(crate) fn corrupt_col<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn parse_enum<T>(idx: usize, raw: &str) -> Result<T, rusqlite::Error>
where
    T: FromStr<Err = crate::types::ParseEnumError>,
{
    raw.parse::<T>().map_err(|e| corrupt_col(idx, e))
}

pub(crate) fn parse_enum_opt<T>(idx: usize, raw: Option<String>) -> Result<Option<T>, rusqlite::Error>
where
    T: FromStr<Err = crate::types::ParseEnumError>,
{
    raw.map(|s| parse_enum(idx, &s)).transpose()
}

pub(crate) fn parse_dec(idx: usize, raw: &str) -> Result<Decimal, rusqlite::Error> {
    Decimal::from_str(raw).map_err(|e| corrupt_col(idx, e))
}

pub(crate) fn parse_dec_opt(idx: usize, raw: Option<String>) -> Result<Option<Decimal>, rusqlite::Error> {
    raw.map(|s| parse_dec(idx, &s)).transpose()
}

pub(crate) fn parse_dt(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt_col(idx, e))
}

pub(crate) fn parse_dt_opt(idx: usize, raw: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.map(|s| parse_dt(idx, &s)).transpose()
}

pub(crate) fn parse_date(idx: usize, raw: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| corrupt_col(idx, e))
}

pub(crate) fn parse_json(idx: usize, raw: &str) -> Result<serde_json::Value, rusqlite::Error> {
    serde_json::from_str(raw).map_err(|e| corrupt_col(idx, e))
}

pub(crate) fn dec_sql(d: &Decimal) -> String {
    d.to_string()
}

pub(crate) fn dec_sql_opt(d: &Option<Decimal>) -> Option<String> {
    d.as_ref().map(|v| v.to_string())
}

pub(crate) fn dt_sql(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn dt_sql_opt(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(dt_sql)
}

pub(crate) fn date_sql(d: &NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn json_sql(v: &serde_json::Value) -> String {
    v.to_string()
}

/// Classify a raw rusqlite error: unique-constraint violations on identity
/// columns become `Duplicate`, conversion failures become `Corrupt`, the
/// rest stays `Transient`.
pub(crate) fn classify(err: rusqlite::Error, what: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate(what.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(_, _, source) => {
            StoreError::Corrupt(format!("{what}: {source}"))
        }
        _ => StoreError::Transient(err),
    }
}

// =============================================================================
// Tests
// =============================================================================
