// =============================================================================
// Store — position queries, mark-to-market updates, and aggregates
// =============================================================================

use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::domain::Position;
use crate::errors::StoreError;

use super::{
    classify, dec_sql, parse_date, parse_dec, parse_dec_opt, parse_dt, parse_dt_opt, parse_enum,
    Store,
};

const POSITION_COLUMNS: &str = "id, signal_id, symbol, direction, strike, expiration, quantity, \
     entry_price, entry_time, current_price, unrealized_pnl, exit_price, exit_time, \
     realized_pnl, status, high_water_mark, entry_iv, partial_exit_taken";

fn position_from_row(row: &Row<'_>) -> Result<Position, rusqlite::Error> {
    let direction: String = row.get(3)?;
    let strike: String = row.get(4)?;
    let expiration: String = row.get(5)?;
    let entry_price: String = row.get(7)?;
    let entry_time: String = row.get(8)?;
    let current_price: Option<String> = row.get(9)?;
    let unrealized: Option<String> = row.get(10)?;
    let exit_price: Option<String> = row.get(11)?;
    let exit_time: Option<String> = row.get(12)?;
    let realized: Option<String> = row.get(13)?;
    let status: String = row.get(14)?;
    let hwm: Option<String> = row.get(15)?;
    let partial: i64 = row.get(17)?;

    Ok(Position {
        id: row.get(0)?,
        signal_id: row.get(1)?,
        symbol: row.get(2)?,
        direction: parse_enum(3, &direction)?,
        strike: parse_dec(4, &strike)?,
        expiration: parse_date(5, &expiration)?,
        quantity: row.get(6)?,
        entry_price: parse_dec(7, &entry_price)?,
        entry_time: parse_dt(8, &entry_time)?,
        current_price: parse_dec_opt(9, current_price)?,
        unrealized_pnl: parse_dec_opt(10, unrealized)?,
        exit_price: parse_dec_opt(11, exit_price)?,
        exit_time: parse_dt_opt(12, exit_time)?,
        realized_pnl: parse_dec_opt(13, realized)?,
        status: parse_enum(14, &status)?,
        high_water_mark: parse_dec_opt(15, hwm)?,
        entry_iv: row.get(16)?,
        partial_exit_taken: partial != 0,
    })
}

fn collect_positions(
    rows: impl Iterator<Item = Result<Position, rusqlite::Error>>,
) -> Result<Vec<Position>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| classify(e, "positions"))?);
    }
    Ok(out)
}

/// Aggregates over positions for the metrics surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PositionAggregates {
    pub open_count: u32,
    /// Sum of `entry_price · quantity · 100` over open positions.
    pub total_exposure: Decimal,
    pub total_unrealized_pnl: Decimal,
    pub total_realized_pnl: Decimal,
    pub closed_count: u32,
    pub win_count: u32,
}

impl Store {
    pub async fn position_by_id(&self, id: &str) -> Result<Option<Position>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"
            ))?;
            let pos = stmt
                .query_row(params![id], position_from_row)
                .optional()
                .map_err(|e| classify(e, "positions"))?;
            Ok(pos)
        })
        .await
    }

    pub async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE status = 'OPEN' ORDER BY entry_time ASC"
            ))?;
            let rows = stmt
                .query_map([], position_from_row)
                .map_err(|e| classify(e, "positions"))?;
            collect_positions(rows)
        })
        .await
    }

    /// Open positions that have been marked at least once; the exit monitor
    /// only evaluates these.
    pub async fn open_positions_with_price(&self) -> Result<Vec<Position>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE status = 'OPEN' AND current_price IS NOT NULL
                 ORDER BY entry_time ASC"
            ))?;
            let rows = stmt
                .query_map([], position_from_row)
                .map_err(|e| classify(e, "positions"))?;
            collect_positions(rows)
        })
        .await
    }

    pub async fn count_open_positions(&self) -> Result<u32, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM positions WHERE status = 'OPEN'",
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| classify(e, "positions"))?;
            Ok(count as u32)
        })
        .await
    }

    /// Mark-to-market update for one open position. The high-water mark only
    /// ever ratchets upward.
    pub async fn update_position_mark(
        &self,
        position_id: &str,
        current_price: Decimal,
        unrealized_pnl: Decimal,
        high_water_mark: Decimal,
    ) -> Result<(), StoreError> {
        let position_id = position_id.to_string();
        self.with_transaction(move |tx| {
            let updated = tx
                .execute(
                    "UPDATE positions SET current_price = ?1, unrealized_pnl = ?2,
                            high_water_mark = ?3
                     WHERE id = ?4 AND status = 'OPEN'",
                    params![
                        dec_sql(&current_price),
                        dec_sql(&unrealized_pnl),
                        dec_sql(&high_water_mark),
                        position_id
                    ],
                )
                .map_err(|e| classify(e, "positions"))?;
            if updated == 0 {
                return Err(StoreError::Conflict(format!(
                    "position {position_id} is not OPEN"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Most recently closed positions, newest first.
    pub async fn closed_positions(&self, limit: usize) -> Result<Vec<Position>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE status = 'CLOSED' ORDER BY exit_time DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], position_from_row)
                .map_err(|e| classify(e, "positions"))?;
            collect_positions(rows)
        })
        .await
    }

    /// Realized P&L over positions closed since `since` (RFC 3339 bound).
    pub async fn realized_pnl_since(
        &self,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<Decimal, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT realized_pnl FROM positions
                 WHERE status = 'CLOSED' AND exit_time >= ?1
                   AND realized_pnl IS NOT NULL",
            )?;
            let rows = stmt
                .query_map(params![super::dt_sql(&since)], |r| {
                    let raw: String = r.get(0)?;
                    parse_dec(0, &raw)
                })
                .map_err(|e| classify(e, "positions"))?;
            let mut total = Decimal::ZERO;
            for row in rows {
                total += row.map_err(|e| classify(e, "positions"))?;
            }
            Ok(total)
        })
        .await
    }

    /// Aggregates for the `/metrics/positions` surface.
    pub async fn position_aggregates(&self) -> Result<PositionAggregates, StoreError> {
        let open = self.open_positions().await?;
        let closed = self.closed_positions(1000).await?;

        let mut agg = PositionAggregates {
            open_count: open.len() as u32,
            closed_count: closed.len() as u32,
            ..Default::default()
        };
        for pos in &open {
            agg.total_exposure += pos.entry_price
                * Decimal::from(pos.quantity)
                * crate::domain::CONTRACT_MULTIPLIER;
            if let Some(upl) = pos.unrealized_pnl {
                agg.total_unrealized_pnl += upl;
            }
        }
        for pos in &closed {
            if let Some(rpl) = pos.realized_pnl {
                agg.total_realized_pnl += rpl;
                if rpl > Decimal::ZERO {
                    agg.win_count += 1;
                }
            }
        }
        Ok(agg)
    }

    /// Test/ops helper: insert a position row directly.
    pub async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        let position = position.clone();
        self.with_transaction(move |tx| super::orders::insert_position_tx(tx, &position))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::domain::Position;
    use crate::errors::StoreError;
    use crate::store::Store;
    use crate::types::{Direction, PositionStatus};

    fn open_position(signal_id: &str, entry: rust_decimal::Decimal) -> Position {
        Position {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            symbol: "SPY".into(),
            direction: Direction::Call,
            strike: dec!(500),
            expiration: Utc::now().date_naive() + chrono::Duration::days(21),
            quantity: 2,
            entry_price: entry,
            entry_time: Utc::now(),
            current_price: None,
            unrealized_pnl: None,
            exit_price: None,
            exit_time: None,
            realized_pnl: None,
            status: PositionStatus::Open,
            high_water_mark: Some(entry),
            entry_iv: None,
            partial_exit_taken: false,
        }
    }

    #[tokio::test]
    async fn one_open_position_per_signal() {
        let store = Store::open_in_memory().unwrap();
        let first = open_position("sig-1", dec!(4.20));
        store.insert_position(&first).await.unwrap();

        let second = open_position("sig-1", dec!(4.50));
        let result = store.insert_position(&second).await;
        assert!(matches!(result, Err(StoreError::Duplicate(_))));

        // A different signal is fine.
        let third = open_position("sig-2", dec!(1.10));
        store.insert_position(&third).await.unwrap();
        assert_eq!(store.count_open_positions().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn mark_update_requires_open_status() {
        let store = Store::open_in_memory().unwrap();
        let pos = open_position("sig-1", dec!(5.00));
        store.insert_position(&pos).await.unwrap();

        store
            .update_position_mark(&pos.id, dec!(5.50), dec!(100), dec!(5.50))
            .await
            .unwrap();
        let marked = store.position_by_id(&pos.id).await.unwrap().unwrap();
        assert_eq!(marked.current_price, Some(dec!(5.50)));
        assert_eq!(marked.unrealized_pnl, Some(dec!(100)));

        let with_price = store.open_positions_with_price().await.unwrap();
        assert_eq!(with_price.len(), 1);

        let missing = store
            .update_position_mark("nope", dec!(1), dec!(0), dec!(1))
            .await;
        assert!(matches!(missing, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn aggregates_sum_exposure_and_pnl() {
        let store = Store::open_in_memory().unwrap();
        let mut a = open_position("sig-1", dec!(2.00));
        a.unrealized_pnl = Some(dec!(50));
        a.current_price = Some(dec!(2.25));
        store.insert_position(&a).await.unwrap();

        let mut b = open_position("sig-2", dec!(3.00));
        b.status = PositionStatus::Closed;
        b.exit_time = Some(Utc::now());
        b.exit_price = Some(dec!(4.00));
        b.realized_pnl = Some(dec!(200));
        store.insert_position(&b).await.unwrap();

        let agg = store.position_aggregates().await.unwrap();
        assert_eq!(agg.open_count, 1);
        assert_eq!(agg.closed_count, 1);
        // 2.00 * 2 * 100 = 400 exposure
        assert_eq!(agg.total_exposure, dec!(400));
        assert_eq!(agg.total_unrealized_pnl, dec!(50));
        assert_eq!(agg.total_realized_pnl, dec!(200));
        assert_eq!(agg.win_count, 1);

        let today = store
            .realized_pnl_since(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(today, dec!(200));
    }
}
