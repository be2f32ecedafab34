// =============================================================================
// Position Refresher — mark-to-market for open positions
// =============================================================================
//
// Reprices every open position with the same linear premium model the paper
// executor fills with, writes `unrealized_pnl = (current − entry) · qty ·
// 100`, and ratchets the high-water mark upward.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::domain::CONTRACT_MULTIPLIER;
use crate::errors::StoreError;

use super::paper_executor::model_option_price;

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let positions = state.store.open_positions().await?;
    if positions.is_empty() {
        return Ok(());
    }
    debug!(open = positions.len(), "position refresher run");

    let today = Utc::now().date_naive();
    for position in positions {
        let quote = state.market_data.get_stock_price(&position.symbol).await;
        let current = model_option_price(
            quote.price,
            position.strike,
            position.direction,
            position.expiration,
            today,
        );

        let unrealized = (current - position.entry_price)
            * Decimal::from(position.quantity)
            * CONTRACT_MULTIPLIER;
        let high_water_mark = position
            .high_water_mark
            .unwrap_or(position.entry_price)
            .max(current);

        match state
            .store
            .update_position_mark(&position.id, current, unrealized, high_water_mark)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(position_id = %position.id, "position closed mid-refresh — skipping");
            }
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "mark update failed for item");
            }
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
