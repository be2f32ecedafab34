// =============================================================================
// Store — order, trade, and fill operations
// =============================================================================
//
// Order status transitions are guarded: the UPDATE's WHERE clause names the
// expected prior status, and zero affected rows means another worker won the
// race (`Conflict`). Terminal states never appear in a guard list, so a
// terminal order can never be rewritten.
// =============================================================================

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::{AuditLogEntry, Order, Position, Trade};
use crate::errors::StoreError;
use crate::types::{OrderStatus, TradingMode};

use super::signals::insert_audit_tx;
use super::{
    classify, date_sql, dec_sql, dec_sql_opt, dt_sql, parse_date, parse_dec, parse_dec_opt,
    parse_dt, parse_enum, Store,
};

const ORDER_COLUMNS: &str = "id, signal_id, client_order_id, broker_order_id, underlying, \
     option_symbol, strike, expiration, option_type, side, quantity, order_type, \
     limit_price, time_in_force, mode, status, filled_quantity, avg_fill_price, \
     exit_action, exit_quantity, refactored_position_id, created_at, updated_at";

fn order_from_row(row: &Row<'_>) -> Result<Order, rusqlite::Error> {
    let strike: String = row.get(6)?;
    let expiration: String = row.get(7)?;
    let option_type: String = row.get(8)?;
    let side: String = row.get(9)?;
    let order_type: String = row.get(11)?;
    let limit_price: Option<String> = row.get(12)?;
    let tif: String = row.get(13)?;
    let mode: String = row.get(14)?;
    let status: String = row.get(15)?;
    let avg_fill: Option<String> = row.get(17)?;
    let created_at: String = row.get(21)?;
    let updated_at: String = row.get(22)?;

    Ok(Order {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        client_order_id: row.get(2)?,
        broker_order_id: row.get(3)?,
        underlying: row.get(4)?,
        option_symbol: row.get(5)?,
        strike: parse_dec(6, &strike)?,
        expiration: parse_date(7, &expiration)?,
        option_type: parse_enum(8, &option_type)?,
        side: parse_enum(9, &side)?,
        quantity: row.get(10)?,
        order_type: parse_enum(11, &order_type)?,
        limit_price: parse_dec_opt(12, limit_price)?,
        time_in_force: parse_enum(13, &tif)?,
        mode: parse_enum(14, &mode)?,
        status: parse_enum(15, &status)?,
        filled_quantity: row.get(16)?,
        avg_fill_price: parse_dec_opt(17, avg_fill)?,
        exit_action: row.get(18)?,
        exit_quantity: row.get(19)?,
        refactored_position_id: row.get(20)?,
        created_at: parse_dt(21, &created_at)?,
        updated_at: parse_dt(22, &updated_at)?,
    })
}

impl Store {
    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Insert a PENDING entry order and bump the originating signal to
    /// ORDER_CREATED, atomically. The guarded signal update means two
    /// order-creator runs cannot both insert an order for the same signal.
    pub async fn create_entry_order(&self, order: &Order) -> Result<(), StoreError> {
        let order = order.clone();
        self.with_transaction(move |tx| {
            let updated = tx
                .execute(
                    "UPDATE signals SET status = 'ORDER_CREATED'
                     WHERE id = ?1 AND status = 'APPROVED'",
                    params![order.signal_id],
                )
                .map_err(|e| classify(e, "signals"))?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "signal {} is not awaiting an order",
                    order.signal_id
                )));
            }
            insert_order_tx(tx, &order)?;
            debug!(order_id = %order.id, signal_id = %order.signal_id, "entry order created");
            Ok(())
        })
        .await
    }

    /// Insert a PENDING exit order. Callers check `has_pending_exit_order`
    /// first so a position carries at most one in-flight exit.
    pub async fn create_exit_order(&self, order: &Order) -> Result<(), StoreError> {
        let order = order.clone();
        self.with_transaction(move |tx| insert_order_tx(tx, &order)).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn order_by_id(&self, id: &str) -> Result<Option<Order>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"))?;
            let order = stmt
                .query_row(params![id], order_from_row)
                .optional()
                .map_err(|e| classify(e, "orders"))?;
            Ok(order)
        })
        .await
    }

    /// PENDING orders for a mode, oldest first.
    pub async fn pending_orders(
        &self,
        mode: TradingMode,
        limit: usize,
    ) -> Result<Vec<Order>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE status = 'PENDING' AND mode = ?1
                 ORDER BY created_at ASC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![mode.as_str(), limit as i64], order_from_row)
                .map_err(|e| classify(e, "orders"))?;
            collect_orders(rows)
        })
        .await
    }

    /// Live orders still in flight at the broker (PENDING/SUBMITTED/PARTIAL).
    pub async fn open_live_orders(&self, limit: usize) -> Result<Vec<Order>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE mode = 'LIVE'
                   AND status IN ('PENDING', 'SUBMITTED', 'PARTIAL')
                 ORDER BY created_at ASC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], order_from_row)
                .map_err(|e| classify(e, "orders"))?;
            collect_orders(rows)
        })
        .await
    }

    /// Whether a non-terminal exit order already exists for this position.
    pub async fn has_pending_exit_order(&self, position_id: &str) -> Result<bool, StoreError> {
        let position_id = position_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM orders
                     WHERE refactored_position_id = ?1
                       AND status IN ('PENDING', 'SUBMITTED', 'PARTIAL')",
                    params![position_id],
                    |r| r.get(0),
                )
                .map_err(|e| classify(e, "orders"))?;
            Ok(count > 0)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Status transitions
    // -------------------------------------------------------------------------

    /// PENDING -> SUBMITTED with the broker's order id attached.
    pub async fn mark_order_submitted(
        &self,
        order_id: &str,
        broker_order_id: &str,
    ) -> Result<(), StoreError> {
        let order_id = order_id.to_string();
        let broker_order_id = broker_order_id.to_string();
        self.with_transaction(move |tx| {
            let updated = tx
                .execute(
                    "UPDATE orders SET status = 'SUBMITTED', broker_order_id = ?1,
                            updated_at = ?2
                     WHERE id = ?3 AND status = 'PENDING'",
                    params![broker_order_id, dt_sql(&Utc::now()), order_id],
                )
                .map_err(|e| classify(e, "orders"))?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "order {order_id} is not PENDING"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Guarded status transition. `expected` lists the prior statuses this
    /// transition may start from; terminal states are never accepted as a
    /// starting point, so observers of a terminal status will never read a
    /// non-terminal one afterwards.
    pub async fn transition_order(
        &self,
        order_id: &str,
        expected: &[OrderStatus],
        to: OrderStatus,
        filled_quantity: u32,
        avg_fill_price: Option<Decimal>,
    ) -> Result<(), StoreError> {
        debug_assert!(expected.iter().all(|s| !s.is_terminal()));
        let order_id = order_id.to_string();
        let guard = expected
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        self.with_transaction(move |tx| {
            let updated = tx
                .execute(
                    &format!(
                        "UPDATE orders SET status = ?1, filled_quantity = ?2,
                                avg_fill_price = ?3, updated_at = ?4
                         WHERE id = ?5 AND status IN ({guard})"
                    ),
                    params![
                        to.as_str(),
                        filled_quantity,
                        dec_sql_opt(&avg_fill_price),
                        dt_sql(&Utc::now()),
                        order_id
                    ],
                )
                .map_err(|e| classify(e, "orders"))?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "order {order_id} not in expected status for -> {to}"
                )));
            }
            Ok(())
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Record an entry (BUY) fill: order -> FILLED, trade inserted, position
    /// opened, `trade_opened` audited — one transaction. The partial unique
    /// index on OPEN positions makes a second open for the same signal a
    /// `Duplicate`, rolling the whole fill back.
    pub async fn record_entry_fill(
        &self,
        order_id: &str,
        trade: &Trade,
        position: &Position,
        audit: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        let order_id = order_id.to_string();
        let trade = trade.clone();
        let position = position.clone();
        let audit = audit.clone();

        self.with_transaction(move |tx| {
            fill_order_tx(tx, &order_id, trade.quantity, &trade.execution_price)?;
            insert_trade_tx(tx, &trade)?;
            insert_position_tx(tx, &position)?;
            insert_audit_tx(tx, &audit)?;
            Ok(())
        })
        .await
    }

    /// Record an exit (SELL) fill against the linked position. Full closes
    /// transition the position to CLOSED with exit price/time and realized
    /// P&L set atomically; partial closes reduce quantity and accumulate
    /// realized P&L, leaving the position OPEN.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_exit_fill(
        &self,
        order_id: &str,
        trade: &Trade,
        position_id: &str,
        exit_price: Decimal,
        realized_pnl: Decimal,
        partial: bool,
        audit: &AuditLogEntry,
    ) -> Result<(), StoreError> {
        let order_id = order_id.to_string();
        let trade = trade.clone();
        let position_id = position_id.to_string();
        let audit = audit.clone();

        self.with_transaction(move |tx| {
            fill_order_tx(tx, &order_id, trade.quantity, &trade.execution_price)?;
            insert_trade_tx(tx, &trade)?;

            // Read the current realized P&L and quantity under the
            // transaction so the accumulate-and-write below cannot lose an
            // update.
            let (prior_realized, open_quantity): (Option<String>, u32) = tx
                .query_row(
                    "SELECT realized_pnl, quantity FROM positions
                     WHERE id = ?1 AND status = 'OPEN'",
                    params![position_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(|e| classify(e, "positions"))?
                .ok_or_else(|| {
                    StoreError::Conflict(format!("position {position_id} is not OPEN"))
                })?;

            let prior = prior_realized
                .map(|s| {
                    s.parse::<Decimal>()
                        .map_err(|e| StoreError::Corrupt(format!("realized_pnl: {e}")))
                })
                .transpose()?
                .unwrap_or_default();
            let total_realized = prior + realized_pnl;

            let updated = if partial {
                let remaining = open_quantity.saturating_sub(trade.quantity);
                tx.execute(
                    "UPDATE positions SET quantity = ?1, realized_pnl = ?2,
                            partial_exit_taken = 1
                     WHERE id = ?3 AND status = 'OPEN'",
                    params![remaining, dec_sql(&total_realized), position_id],
                )
                .map_err(|e| classify(e, "positions"))?
            } else {
                tx.execute(
                    "UPDATE positions SET status = 'CLOSED', exit_price = ?1,
                            exit_time = ?2, realized_pnl = ?3, unrealized_pnl = NULL
                     WHERE id = ?4 AND status = 'OPEN'",
                    params![
                        dec_sql(&exit_price),
                        dt_sql(&trade.executed_at),
                        dec_sql(&total_realized),
                        position_id
                    ],
                )
                .map_err(|e| classify(e, "positions"))?
            };
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "position {position_id} changed during exit fill"
                )));
            }

            insert_audit_tx(tx, &audit)?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Transaction-level helpers
// =============================================================================

fn collect_orders(
    rows: impl Iterator<Item = Result<Order, rusqlite::Error>>,
) -> Result<Vec<Order>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| classify(e, "orders"))?);
    }
    Ok(out)
}

fn insert_order_tx(tx: &Transaction<'_>, order: &Order) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO orders
         (id, signal_id, client_order_id, broker_order_id, underlying, option_symbol,
          strike, expiration, option_type, side, quantity, order_type, limit_price,
          time_in_force, mode, status, filled_quantity, avg_fill_price, exit_action,
          exit_quantity, refactored_position_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            order.id,
            order.signal_id,
            order.client_order_id,
            order.broker_order_id,
            order.underlying,
            order.option_symbol,
            dec_sql(&order.strike),
            date_sql(&order.expiration),
            order.option_type.as_str(),
            order.side.as_str(),
            order.quantity,
            order.order_type.as_str(),
            dec_sql_opt(&order.limit_price),
            order.time_in_force.as_str(),
            order.mode.as_str(),
            order.status.as_str(),
            order.filled_quantity,
            dec_sql_opt(&order.avg_fill_price),
            order.exit_action,
            order.exit_quantity,
            order.refactored_position_id,
            dt_sql(&order.created_at),
            dt_sql(&order.updated_at),
        ],
    )
    .map_err(|e| classify(e, "orders.client_order_id"))?;
    Ok(())
}

/// Transition an order to FILLED from any non-terminal working status.
fn fill_order_tx(
    tx: &Transaction<'_>,
    order_id: &str,
    filled_quantity: u32,
    avg_fill_price: &Decimal,
) -> Result<(), StoreError> {
    let updated = tx
        .execute(
            "UPDATE orders SET status = 'FILLED', filled_quantity = ?1,
                    avg_fill_price = ?2, updated_at = ?3
             WHERE id = ?4 AND status IN ('PENDING', 'SUBMITTED', 'PARTIAL')",
            params![
                filled_quantity,
                dec_sql(avg_fill_price),
                dt_sql(&Utc::now()),
                order_id
            ],
        )
        .map_err(|e| classify(e, "orders"))?;
    if updated == 0 {
        return Err(StoreError::Conflict(format!(
            "order {order_id} is not fillable"
        )));
    }
    Ok(())
}

fn insert_trade_tx(tx: &Transaction<'_>, trade: &Trade) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO trades
         (id, order_id, execution_price, quantity, commission, fees, total_cost,
          executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            trade.id,
            trade.order_id,
            dec_sql(&trade.execution_price),
            trade.quantity,
            dec_sql(&trade.commission),
            dec_sql(&trade.fees),
            dec_sql(&trade.total_cost),
            dt_sql(&trade.executed_at),
        ],
    )
    .map_err(|e| classify(e, "trades"))?;
    Ok(())
}

pub(super) fn insert_position_tx(
    tx: &Transaction<'_>,
    position: &Position,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO positions
         (id, signal_id, symbol, direction, strike, expiration, quantity,
          entry_price, entry_time, current_price, unrealized_pnl, exit_price,
          exit_time, realized_pnl, status, high_water_mark, entry_iv,
          partial_exit_taken)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                 ?16, ?17, ?18)",
        params![
            position.id,
            position.signal_id,
            position.symbol,
            position.direction.as_str(),
            dec_sql(&position.strike),
            date_sql(&position.expiration),
            position.quantity,
            dec_sql(&position.entry_price),
            dt_sql(&position.entry_time),
            dec_sql_opt(&position.current_price),
            dec_sql_opt(&position.unrealized_pnl),
            dec_sql_opt(&position.exit_price),
            super::dt_sql_opt(&position.exit_time),
            dec_sql_opt(&position.realized_pnl),
            position.status.as_str(),
            dec_sql_opt(&position.high_water_mark),
            position.entry_iv,
            position.partial_exit_taken as i32,
        ],
    )
    .map_err(|e| classify(e, "positions.open_signal"))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
