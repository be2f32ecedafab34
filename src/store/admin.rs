// =============================================================================
// Store — risk limits, exit rules, GEX summaries, context, audit, failures
// =============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AuditLogEntry, ContextSnapshot, ExitRules, GexSummary, PipelineFailure, RiskLimits,
};
use crate::errors::StoreError;
use crate::types::TradingMode;

use super::signals::insert_audit_tx;
use super::{
    classify, dec_sql, dec_sql_opt, dt_sql, json_sql, parse_dec, parse_dec_opt, parse_dt,
    parse_enum, parse_enum_opt, parse_json, Store,
};

// =============================================================================
// Risk limits
// =============================================================================

/// Allow-listed subset of risk-limit fields accepted by the PUT surface.
/// Unknown payload fields are silently ignored at deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskLimitsPatch {
    #[serde(default)]
    pub max_open_positions: Option<u32>,
    #[serde(default)]
    pub max_daily_loss: Option<Decimal>,
    #[serde(default)]
    pub max_delta_exposure: Option<f64>,
    #[serde(default)]
    pub max_theta_exposure: Option<f64>,
    #[serde(default)]
    pub max_vega_exposure: Option<f64>,
    #[serde(default)]
    pub require_mtf_agreement: Option<bool>,
    #[serde(default)]
    pub auto_close_enabled: Option<bool>,
}

impl RiskLimitsPatch {
    fn apply(&self, limits: &mut RiskLimits) {
        if let Some(v) = self.max_open_positions {
            limits.max_open_positions = v;
        }
        if let Some(v) = self.max_daily_loss {
            limits.max_daily_loss = v;
        }
        if let Some(v) = self.max_delta_exposure {
            limits.max_delta_exposure = v;
        }
        if let Some(v) = self.max_theta_exposure {
            limits.max_theta_exposure = v;
        }
        if let Some(v) = self.max_vega_exposure {
            limits.max_vega_exposure = v;
        }
        if let Some(v) = self.require_mtf_agreement {
            limits.require_mtf_agreement = v;
        }
        if let Some(v) = self.auto_close_enabled {
            limits.auto_close_enabled = v;
        }
    }
}

fn risk_limits_from_row(row: &Row<'_>) -> Result<RiskLimits, rusqlite::Error> {
    let mode: String = row.get(1)?;
    let max_daily_loss: String = row.get(3)?;
    let require_mtf: i64 = row.get(7)?;
    let auto_close: i64 = row.get(8)?;
    let active: i64 = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(RiskLimits {
        id: row.get(0)?,
        mode: parse_enum(1, &mode)?,
        max_open_positions: row.get(2)?,
        max_daily_loss: parse_dec(3, &max_daily_loss)?,
        max_delta_exposure: row.get(4)?,
        max_theta_exposure: row.get(5)?,
        max_vega_exposure: row.get(6)?,
        require_mtf_agreement: require_mtf != 0,
        auto_close_enabled: auto_close != 0,
        active: active != 0,
        updated_at: parse_dt(10, &updated_at)?,
    })
}

impl Store {
    /// The active risk limits for a mode; defaults when no row exists yet.
    pub async fn active_risk_limits(&self, mode: TradingMode) -> Result<RiskLimits, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, mode, max_open_positions, max_daily_loss, max_delta_exposure,
                        max_theta_exposure, max_vega_exposure, require_mtf_agreement,
                        auto_close_enabled, active, updated_at
                 FROM risk_limits WHERE mode = ?1 AND active = 1
                 ORDER BY updated_at DESC LIMIT 1",
            )?;
            let row = stmt
                .query_row(params![mode.as_str()], risk_limits_from_row)
                .optional()
                .map_err(|e| classify(e, "risk_limits"))?;
            Ok(row.unwrap_or_else(|| RiskLimits::defaults_for(mode)))
        })
        .await
    }

    /// Upsert: update the active row for the mode if present, else insert a
    /// defaults row with the patch applied. Returns the resulting limits.
    pub async fn upsert_risk_limits(
        &self,
        mode: TradingMode,
        patch: &RiskLimitsPatch,
    ) -> Result<RiskLimits, StoreError> {
        let patch = patch.clone();
        self.with_transaction(move |tx| {
            let existing = tx
                .query_row(
                    "SELECT id, mode, max_open_positions, max_daily_loss, max_delta_exposure,
                            max_theta_exposure, max_vega_exposure, require_mtf_agreement,
                            auto_close_enabled, active, updated_at
                     FROM risk_limits WHERE mode = ?1 AND active = 1
                     ORDER BY updated_at DESC LIMIT 1",
                    params![mode.as_str()],
                    risk_limits_from_row,
                )
                .optional()
                .map_err(|e| classify(e, "risk_limits"))?;

            let mut limits = existing.unwrap_or_else(|| RiskLimits::defaults_for(mode));
            patch.apply(&mut limits);
            limits.updated_at = Utc::now();

            tx.execute(
                "INSERT INTO risk_limits
                 (id, mode, max_open_positions, max_daily_loss, max_delta_exposure,
                  max_theta_exposure, max_vega_exposure, require_mtf_agreement,
                  auto_close_enabled, active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                    max_open_positions = excluded.max_open_positions,
                    max_daily_loss = excluded.max_daily_loss,
                    max_delta_exposure = excluded.max_delta_exposure,
                    max_theta_exposure = excluded.max_theta_exposure,
                    max_vega_exposure = excluded.max_vega_exposure,
                    require_mtf_agreement = excluded.require_mtf_agreement,
                    auto_close_enabled = excluded.auto_close_enabled,
                    updated_at = excluded.updated_at",
                params![
                    limits.id,
                    limits.mode.as_str(),
                    limits.max_open_positions,
                    dec_sql(&limits.max_daily_loss),
                    limits.max_delta_exposure,
                    limits.max_theta_exposure,
                    limits.max_vega_exposure,
                    limits.require_mtf_agreement as i32,
                    limits.auto_close_enabled as i32,
                    dt_sql(&limits.updated_at),
                ],
            )
            .map_err(|e| classify(e, "risk_limits"))?;
            Ok(limits)
        })
        .await
    }

    /// The active exit rules for a mode; defaults when no row exists yet.
    pub async fn active_exit_rules(&self, mode: TradingMode) -> Result<ExitRules, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, mode, profit_target_pct, stop_loss_pct, trailing_stop_pct,
                        min_days_to_expiration, max_days_in_trade, active, updated_at
                 FROM exit_rules WHERE mode = ?1 AND active = 1
                 ORDER BY updated_at DESC LIMIT 1",
            )?;
            let row = stmt
                .query_row(params![mode.as_str()], |row| {
                    let mode: String = row.get(1)?;
                    let active: i64 = row.get(7)?;
                    let updated_at: String = row.get(8)?;
                    Ok(ExitRules {
                        id: row.get(0)?,
                        mode: parse_enum(1, &mode)?,
                        profit_target_pct: row.get(2)?,
                        stop_loss_pct: row.get(3)?,
                        trailing_stop_pct: row.get(4)?,
                        min_days_to_expiration: row.get(5)?,
                        max_days_in_trade: row.get(6)?,
                        active: active != 0,
                        updated_at: parse_dt(8, &updated_at)?,
                    })
                })
                .optional()
                .map_err(|e| classify(e, "exit_rules"))?;
            Ok(row.unwrap_or_else(|| ExitRules::defaults_for(mode)))
        })
        .await
    }
}

// =============================================================================
// GEX summaries
// =============================================================================

fn gex_from_row(row: &Row<'_>) -> Result<GexSummary, rusqlite::Error> {
    let direction: String = row.get(5)?;
    let dealer: String = row.get(6)?;
    let zero_gamma: Option<String> = row.get(7)?;
    let call_wall: Option<String> = row.get(8)?;
    let put_wall: Option<String> = row.get(9)?;
    let max_pain: Option<String> = row.get(10)?;
    let flip: i64 = row.get(12)?;
    let flip_direction: Option<String> = row.get(13)?;
    let timestamp: String = row.get(15)?;

    Ok(GexSummary {
        id: row.get(0)?,
        symbol: row.get(1)?,
        timeframe: row.get(2)?,
        net_gex: row.get(3)?,
        strength: row.get(4)?,
        direction: parse_enum(5, &direction)?,
        dealer_position: parse_enum(6, &dealer)?,
        zero_gamma_level: parse_dec_opt(7, zero_gamma)?,
        call_wall: parse_dec_opt(8, call_wall)?,
        put_wall: parse_dec_opt(9, put_wall)?,
        max_pain: parse_dec_opt(10, max_pain)?,
        pc_ratio: row.get(11)?,
        flip_detected: flip != 0,
        flip_direction: parse_enum_opt(13, flip_direction)?,
        regime: row.get(14)?,
        timestamp: parse_dt(15, &timestamp)?,
    })
}

impl Store {
    /// Append a GEX summary row; history is kept for flip detection.
    pub async fn insert_gex_summary(&self, summary: &GexSummary) -> Result<(), StoreError> {
        let summary = summary.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO gex_summaries
                 (id, symbol, timeframe, net_gex, strength, direction, dealer_position,
                  zero_gamma_level, call_wall, put_wall, max_pain, pc_ratio,
                  flip_detected, flip_direction, regime, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16)",
                params![
                    summary.id,
                    summary.symbol,
                    summary.timeframe,
                    summary.net_gex,
                    summary.strength,
                    summary.direction.as_str(),
                    summary.dealer_position.as_str(),
                    dec_sql_opt(&summary.zero_gamma_level),
                    dec_sql_opt(&summary.call_wall),
                    dec_sql_opt(&summary.put_wall),
                    dec_sql_opt(&summary.max_pain),
                    summary.pc_ratio,
                    summary.flip_detected as i32,
                    summary.flip_direction.map(|d| d.as_str()),
                    summary.regime,
                    dt_sql(&summary.timestamp),
                ],
            )
            .map_err(|e| classify(e, "gex_summaries"))?;
            Ok(())
        })
        .await
    }

    /// The latest GEX summary for a symbol/timeframe pair.
    pub async fn latest_gex_summary(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Option<GexSummary>, StoreError> {
        let symbol = symbol.to_uppercase();
        let timeframe = timeframe.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, symbol, timeframe, net_gex, strength, direction,
                        dealer_position, zero_gamma_level, call_wall, put_wall, max_pain,
                        pc_ratio, flip_detected, flip_direction, regime, timestamp
                 FROM gex_summaries WHERE symbol = ?1 AND timeframe = ?2
                 ORDER BY timestamp DESC LIMIT 1",
            )?;
            let row = stmt
                .query_row(params![symbol, timeframe], gex_from_row)
                .optional()
                .map_err(|e| classify(e, "gex_summaries"))?;
            Ok(row)
        })
        .await
    }
}

// =============================================================================
// Context snapshots
// =============================================================================

impl Store {
    pub async fn insert_context_snapshot(
        &self,
        snapshot: &ContextSnapshot,
    ) -> Result<(), StoreError> {
        let snapshot = snapshot.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO context_snapshots
                 (id, vix, trend, bias, regime, regime_confidence, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot.id,
                    snapshot.vix,
                    snapshot.trend.as_str(),
                    snapshot.bias.as_str(),
                    snapshot.regime,
                    snapshot.regime_confidence,
                    dt_sql(&snapshot.timestamp),
                ],
            )
            .map_err(|e| classify(e, "context_snapshots"))?;
            Ok(())
        })
        .await
    }

    /// The most recent context snapshot, if any exists.
    pub async fn latest_context_snapshot(&self) -> Result<Option<ContextSnapshot>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, vix, trend, bias, regime, regime_confidence, timestamp
                 FROM context_snapshots ORDER BY timestamp DESC LIMIT 1",
            )?;
            let row = stmt
                .query_row([], |row| {
                    let trend: String = row.get(2)?;
                    let bias: String = row.get(3)?;
                    let timestamp: String = row.get(6)?;
                    Ok(ContextSnapshot {
                        id: row.get(0)?,
                        vix: row.get(1)?,
                        trend: parse_enum(2, &trend)?,
                        bias: parse_enum(3, &bias)?,
                        regime: row.get(4)?,
                        regime_confidence: row.get(5)?,
                        timestamp: parse_dt(6, &timestamp)?,
                    })
                })
                .optional()
                .map_err(|e| classify(e, "context_snapshots"))?;
            Ok(row)
        })
        .await
    }
}

// =============================================================================
// Audit log
// =============================================================================

/// Query filter for the audit surface. All fields are optional and combine
/// with AND; results sort descending by timestamp.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub decision_type: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub limit: Option<u32>,
}

fn audit_from_row(row: &Row<'_>) -> Result<AuditLogEntry, rusqlite::Error> {
    let event: String = row.get(1)?;
    let decision_type: Option<String> = row.get(5)?;
    let decision: Option<String> = row.get(6)?;
    let details: String = row.get(7)?;
    let timestamp: String = row.get(8)?;

    Ok(AuditLogEntry {
        id: row.get(0)?,
        event: parse_enum(1, &event)?,
        signal_id: row.get(2)?,
        symbol: row.get(3)?,
        correlation_id: row.get(4)?,
        decision_type: parse_enum_opt(5, decision_type)?,
        decision: parse_enum_opt(6, decision)?,
        details: parse_json(7, &details)?,
        timestamp: parse_dt(8, &timestamp)?,
    })
}

impl Store {
    pub async fn insert_audit(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.with_transaction(move |tx| insert_audit_tx(tx, &entry)).await
    }

    /// Filtered audit query with offset/limit pagination, newest first.
    pub async fn query_audit(
        &self,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditLogEntry>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, event, signal_id, symbol, correlation_id, decision_type,
                        decision, details, timestamp
                 FROM audit_log WHERE 1=1",
            );
            let mut args: Vec<rusqlite::types::Value> = Vec::new();

            if let Some(from) = &filter.from {
                sql.push_str(" AND timestamp >= ?");
                args.push(dt_sql(from).into());
            }
            if let Some(to) = &filter.to {
                sql.push_str(" AND timestamp <= ?");
                args.push(dt_sql(to).into());
            }
            if let Some(symbol) = &filter.symbol {
                sql.push_str(" AND symbol = ?");
                args.push(symbol.to_uppercase().into());
            }
            if let Some(signal_id) = &filter.signal_id {
                sql.push_str(" AND signal_id = ?");
                args.push(signal_id.clone().into());
            }
            if let Some(decision_type) = &filter.decision_type {
                sql.push_str(" AND decision_type = ?");
                args.push(decision_type.to_uppercase().into());
            }
            if let Some(decision) = &filter.decision {
                sql.push_str(" AND decision = ?");
                args.push(decision.to_uppercase().into());
            }

            sql.push_str(" ORDER BY timestamp DESC LIMIT ? OFFSET ?");
            args.push((filter.limit.unwrap_or(100).min(1000) as i64).into());
            args.push((filter.offset.unwrap_or(0) as i64).into());

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), audit_from_row)
                .map_err(|e| classify(e, "audit_log"))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| classify(e, "audit_log"))?);
            }
            Ok(out)
        })
        .await
    }
}

// =============================================================================
// Pipeline failures
// =============================================================================

impl Store {
    pub async fn insert_pipeline_failure(
        &self,
        failure: &PipelineFailure,
    ) -> Result<(), StoreError> {
        let failure = failure.clone();
        self.with_transaction(move |tx| {
            tx.execute(
                "INSERT INTO pipeline_failures
                 (id, correlation_id, stage, reason, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    failure.id,
                    failure.correlation_id,
                    failure.stage.as_str(),
                    failure.reason,
                    json_sql(&failure.payload),
                    dt_sql(&failure.created_at),
                ],
            )
            .map_err(|e| classify(e, "pipeline_failures"))?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Convenience constructors
// =============================================================================

impl ContextSnapshot {
    pub fn new(
        vix: f64,
        trend: crate::types::MarketBias,
        bias: crate::types::MarketBias,
        regime: impl Into<String>,
        regime_confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vix,
            trend,
            bias,
            regime: regime.into(),
            regime_confidence,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
