// =============================================================================
// Vega Options Engine — Main Entry Point
// =============================================================================
//
// The engine starts in PAPER mode by default. LIVE mode requires both
// APP_MODE=LIVE and LIVE_TRADING_ENABLED=true plus a fully configured
// broker; anything less aborts before traffic is served.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod cache;
mod config;
mod context;
mod domain;
mod errors;
mod gex;
mod market_data;
mod observability;
mod orchestrator;
mod parsers;
mod pipeline;
mod rate_limit;
mod store;
mod types;
mod workers;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::EngineConfig;

/// Config file path; overridable for multi-instance setups.
const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vega Options Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        error!(error = %e, "FATAL: invalid configuration — refusing to start");
        return Err(e.into());
    }

    info!(
        mode = %config.mode,
        symbols = ?config.symbols,
        bind_addr = %config.bind_addr,
        db_path = %config.db_path,
        "Engine configuration loaded"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config)?);

    // ── 3. Cache eviction sweeper ────────────────────────────────────────
    tokio::spawn(
        state
            .cache
            .clone()
            .run_sweeper(state.shutdown_rx()),
    );

    // ── 4. Workers ───────────────────────────────────────────────────────
    let worker_handles = workers::spawn_all(state.clone());

    // ── 5. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let server_addr = bind_addr.clone();
    let server = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&server_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %server_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %server_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.begin_shutdown();
    for handle in worker_handles {
        let _ = handle.await;
    }
    server.abort();

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save engine config on shutdown");
    }

    info!("Vega Options Engine shut down complete.");
    Ok(())
}
