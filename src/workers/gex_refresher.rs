// =============================================================================
// GEX Refresher — chain analytics for the tracked symbol set
// =============================================================================
//
// During market hours, fetches each tracked symbol's option chain, recomputes
// net GEX, dealer position, zero-gamma level, walls, max pain, and P/C, and
// persists a summary for the orchestrator. A sign flip of net gamma against
// the previous summary sets the flip flag the entry and exit rules key on.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::domain::GexSummary;
use crate::gex::analyze_chain;
use crate::observability::degraded::Component;
use crate::types::MarketBias;

use super::GEX_TIMEFRAME;

pub async fn run_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    if !state.market_data.is_market_open().await {
        debug!("market closed — GEX refresh skipped");
        return Ok(());
    }

    let symbols = state.config.read().symbols.clone();
    let mut failures = 0usize;

    for symbol in &symbols {
        if let Err(e) = refresh_symbol(state, symbol).await {
            warn!(symbol = %symbol, error = %e, "GEX refresh failed for symbol");
            failures += 1;
        }
    }

    if failures == symbols.len() && !symbols.is_empty() {
        state
            .degraded
            .mark_unhealthy(Component::Gex, "all GEX refreshes failed");
    } else {
        state.degraded.mark_healthy(Component::Gex);
    }
    Ok(())
}

/// Refresh one symbol's summary. Split out so tests can drive it without
/// the market-hours gate.
pub async fn refresh_symbol(state: &Arc<AppState>, symbol: &str) -> anyhow::Result<()> {
    let chain = state.market_data.get_option_chain(symbol).await;
    let analysis = analyze_chain(&chain);

    let previous = state.store.latest_gex_summary(symbol, GEX_TIMEFRAME).await?;
    let flip_detected = previous
        .as_ref()
        .map(|prev| (prev.net_gex >= 0.0) != (analysis.net_gex >= 0.0))
        .unwrap_or(false);
    let flip_direction = flip_detected.then(|| {
        if analysis.net_gex >= 0.0 {
            MarketBias::Bullish
        } else {
            MarketBias::Bearish
        }
    });

    let summary = GexSummary {
        id: Uuid::new_v4().to_string(),
        symbol: symbol.to_uppercase(),
        timeframe: GEX_TIMEFRAME.to_string(),
        net_gex: analysis.net_gex,
        strength: analysis.strength,
        direction: analysis.direction,
        dealer_position: analysis.dealer_position,
        zero_gamma_level: analysis.zero_gamma_level,
        call_wall: analysis.call_wall,
        put_wall: analysis.put_wall,
        max_pain: analysis.max_pain,
        pc_ratio: analysis.pc_ratio,
        flip_detected,
        flip_direction,
        regime: analysis.regime.clone(),
        timestamp: Utc::now(),
    };
    state.store.insert_gex_summary(&summary).await?;

    info!(
        symbol = %summary.symbol,
        net_gex = summary.net_gex,
        dealer = %summary.dealer_position,
        regime = %summary.regime,
        flip = flip_detected,
        "GEX summary refreshed"
    );
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::Store;
    use crate::types::DealerPosition;

    async fn test_state() -> Arc<AppState> {
        Arc::new(AppState::with_store(
            EngineConfig::default(),
            Store::open_in_memory().unwrap(),
        ))
    }

    #[tokio::test]
    async fn refresh_persists_a_summary() {
        let state = test_state().await;
        refresh_symbol(&state, "SPY").await.unwrap();

        let summary = state
            .store
            .latest_gex_summary("SPY", GEX_TIMEFRAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.symbol, "SPY");
        assert!(!summary.flip_detected);
        assert!(summary.strength >= -1.0 && summary.strength <= 1.0);
        assert!(summary.max_pain.is_some());
    }

    #[tokio::test]
    async fn sign_flip_is_detected_against_previous() {
        let state = test_state().await;

        // Seed a previous summary with the opposite net-gamma sign of
        // whatever the demo chain produces.
        refresh_symbol(&state, "QQQ").await.unwrap();
        let first = state
            .store
            .latest_gex_summary("QQQ", GEX_TIMEFRAME)
            .await
            .unwrap()
            .unwrap();

        let mut seeded = first.clone();
        seeded.id = Uuid::new_v4().to_string();
        seeded.net_gex = -first.net_gex - 1.0;
        seeded.dealer_position = match first.dealer_position {
            DealerPosition::LongGamma => DealerPosition::ShortGamma,
            DealerPosition::ShortGamma => DealerPosition::LongGamma,
        };
        seeded.timestamp = Utc::now() + chrono::Duration::seconds(1);
        state.store.insert_gex_summary(&seeded).await.unwrap();

        // Give the next refresh a later timestamp bucket.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        refresh_symbol(&state, "QQQ").await.unwrap();

        let latest = state
            .store
            .latest_gex_summary("QQQ", GEX_TIMEFRAME)
            .await
            .unwrap()
            .unwrap();
        assert!(latest.flip_detected);
        assert!(latest.flip_direction.is_some());
    }
}
