// =============================================================================
// Store — signal & decision operations
// =============================================================================
//
// Signal lifecycle in the store:
//   PENDING -> APPROVED | REJECTED   (signal processor, guarded, exactly once)
//   APPROVED -> ORDER_CREATED        (order creator, guarded)
//
// `validation_result` is written in the same guarded UPDATE as the status
// flip, so a signal with a non-null result is terminal for the processor.
// =============================================================================

use rusqlite::{params, OptionalExtension, Row, Transaction};
use tracing::debug;

use crate::domain::{AuditLogEntry, Decision, Signal, ValidationResult};
use crate::errors::StoreError;
use crate::types::DecisionType;

use super::{
    classify, dt_sql, json_sql, parse_dt, parse_enum, parse_json, Store,
};

fn signal_from_row(row: &Row<'_>) -> Result<Signal, rusqlite::Error> {
    let source: String = row.get(2)?;
    let direction: String = row.get(4)?;
    let timestamp: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    let validation: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(Signal {
        id: row.get(0)?,
        correlation_id: row.get(1)?,
        source: parse_enum(2, &source)?,
        symbol: row.get(3)?,
        direction: parse_enum(4, &direction)?,
        timeframe: row.get(5)?,
        timestamp: parse_dt(6, &timestamp)?,
        metadata: parse_json(7, &metadata)?,
        validation_result: validation
            .map(|v| {
                serde_json::from_str::<ValidationResult>(&v)
                    .map_err(|e| super::corrupt_col(8, e))
            })
            .transpose()?,
        created_at: parse_dt(9, &created_at)?,
    })
}

const SIGNAL_COLUMNS: &str = "id, correlation_id, source, symbol, direction, timeframe, \
     timestamp, metadata, validation_result, created_at";

impl Store {
    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    /// Insert a freshly normalized signal together with its
    /// `signal_received` audit entry, in one transaction.
    pub async fn persist_signal(
        &self,
        signal: &Signal,
        audit: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        self.with_transaction(|tx| {
            insert_signal_tx(tx, signal)?;
            insert_audit_tx(tx, audit)?;
            Ok(())
        })
        .await
    }

    pub async fn signal_by_id(&self, id: &str) -> Result<Option<Signal>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"
            ))?;
            let signal = stmt
                .query_row(params![id], signal_from_row)
                .optional()
                .map_err(|e| classify(e, "signals"))?;
            Ok(signal)
        })
        .await
    }

    /// Signals awaiting an entry decision, oldest first.
    pub async fn unprocessed_signals(&self, limit: usize) -> Result<Vec<Signal>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals
                 WHERE status = 'PENDING' AND validation_result IS NULL
                 ORDER BY created_at ASC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], signal_from_row)
                .map_err(|e| classify(e, "signals"))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| classify(e, "signals"))?);
            }
            Ok(out)
        })
        .await
    }

    /// Approved signals that have not yet produced an order, oldest first.
    pub async fn approved_signals_without_orders(
        &self,
        limit: usize,
    ) -> Result<Vec<Signal>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals s
                 WHERE s.status = 'APPROVED'
                   AND NOT EXISTS (SELECT 1 FROM orders o WHERE o.signal_id = s.id)
                 ORDER BY s.created_at ASC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], signal_from_row)
                .map_err(|e| classify(e, "signals"))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| classify(e, "signals"))?);
            }
            Ok(out)
        })
        .await
    }

    /// Atomically write the entry decision for a signal: the decision row,
    /// the validation result, the status flip, and the `decision_made` audit
    /// entry commit together.
    ///
    /// The guarded UPDATE enforces write-once semantics — if another worker
    /// already decided this signal, the whole transaction fails with
    /// `Conflict` and nothing is written.
    pub async fn finalize_entry_decision(
        &self,
        signal_id: &str,
        result: &ValidationResult,
        decision: &Decision,
        audit: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        let signal_id = signal_id.to_string();
        let result = result.clone();
        let decision = decision.clone();
        let audit = audit.clone();

        self.with_transaction(move |tx| {
            let new_status = if result.valid { "APPROVED" } else { "REJECTED" };
            let result_json = serde_json::to_string(&result)
                .map_err(|e| StoreError::Corrupt(format!("validation_result: {e}")))?;

            let updated = tx
                .execute(
                    "UPDATE signals SET validation_result = ?1, status = ?2
                     WHERE id = ?3 AND validation_result IS NULL",
                    params![result_json, new_status, signal_id],
                )
                .map_err(|e| classify(e, "signals"))?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "signal {signal_id} already decided"
                )));
            }

            insert_decision_tx(tx, &decision)?;
            insert_audit_tx(tx, &audit)?;
            debug!(signal_id = %signal_id, status = new_status, "entry decision persisted");
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    /// Append an exit decision (plus audit) for an open position.
    pub async fn insert_exit_decision(
        &self,
        decision: &Decision,
        audit: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        let decision = decision.clone();
        let audit = audit.clone();
        self.with_transaction(move |tx| {
            insert_decision_tx(tx, &decision)?;
            insert_audit_tx(tx, &audit)?;
            Ok(())
        })
        .await
    }

    /// The single ENTRY decision for a signal, if one exists.
    pub async fn entry_decision(&self, signal_id: &str) -> Result<Option<Decision>, StoreError> {
        let signal_id = signal_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, signal_id, position_id, decision_type, decision, confidence,
                        position_size, reasoning, calculations, context_snapshot,
                        gex_snapshot, created_at
                 FROM decisions WHERE signal_id = ?1 AND decision_type = 'ENTRY'",
            )?;
            let decision = stmt
                .query_row(params![signal_id], decision_from_row)
                .optional()
                .map_err(|e| classify(e, "decisions"))?;
            Ok(decision)
        })
        .await
    }
}

// =============================================================================
// Transaction-level inserts (shared with order/position operations)
// =============================================================================

pub(super) fn insert_signal_tx(tx: &Transaction<'_>, signal: &Signal) -> Result<(), StoreError> {
    let validation = signal
        .validation_result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("validation_result: {e}")))?;

    tx.execute(
        "INSERT INTO signals
         (id, correlation_id, source, symbol, direction, timeframe, timestamp,
          metadata, validation_result, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'PENDING', ?10)",
        params![
            signal.id,
            signal.correlation_id,
            signal.source.as_str(),
            signal.symbol,
            signal.direction.as_str(),
            signal.timeframe,
            dt_sql(&signal.timestamp),
            json_sql(&signal.metadata),
            validation,
            dt_sql(&signal.created_at),
        ],
    )
    .map_err(|e| classify(e, "signals"))?;
    Ok(())
}

pub(super) fn insert_decision_tx(
    tx: &Transaction<'_>,
    decision: &Decision,
) -> Result<(), StoreError> {
    let reasoning = serde_json::to_string(&decision.reasoning)
        .map_err(|e| StoreError::Corrupt(format!("reasoning: {e}")))?;

    tx.execute(
        "INSERT INTO decisions
         (id, signal_id, position_id, decision_type, decision, confidence,
          position_size, reasoning, calculations, context_snapshot, gex_snapshot,
          created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            decision.id,
            decision.signal_id,
            decision.position_id,
            decision.decision_type.as_str(),
            decision.decision.as_str(),
            decision.confidence,
            decision.position_size,
            reasoning,
            json_sql(&decision.calculations),
            decision.context_snapshot.as_ref().map(json_sql),
            decision.gex_snapshot.as_ref().map(json_sql),
            dt_sql(&decision.created_at),
        ],
    )
    .map_err(|e| classify(e, "decisions"))?;
    Ok(())
}

pub(super) fn insert_audit_tx(
    tx: &Transaction<'_>,
    entry: &AuditLogEntry,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO audit_log
         (id, event, signal_id, symbol, correlation_id, decision_type, decision,
          details, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.id,
            entry.event.as_str(),
            entry.signal_id,
            entry.symbol,
            entry.correlation_id,
            entry.decision_type.map(|d| d.as_str()),
            entry.decision.map(|d| d.as_str()),
            json_sql(&entry.details),
            dt_sql(&entry.timestamp),
        ],
    )
    .map_err(|e| classify(e, "audit_log"))?;
    Ok(())
}

pub(super) fn decision_from_row(row: &Row<'_>) -> Result<Decision, rusqlite::Error> {
    let decision_type: String = row.get(3)?;
    let decision: String = row.get(4)?;
    let reasoning: String = row.get(7)?;
    let calculations: String = row.get(8)?;
    let context: Option<String> = row.get(9)?;
    let gex: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;

    Ok(Decision {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        position_id: row.get(2)?,
        decision_type: parse_enum::<DecisionType>(3, &decision_type)?,
        decision: parse_enum(4, &decision)?,
        confidence: row.get(5)?,
        position_size: row.get(6)?,
        reasoning: serde_json::from_str(&reasoning).map_err(|e| super::corrupt_col(7, e))?,
        calculations: parse_json(8, &calculations)?,
        context_snapshot: context.map(|c| parse_json(9, &c)).transpose()?,
        gex_snapshot: gex.map(|g| parse_json(10, &g)).transpose()?,
        created_at: parse_dt(11, &created_at)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
