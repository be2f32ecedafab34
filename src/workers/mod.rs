// =============================================================================
// Workers — periodic tasks driving the signal-to-position state machine
// =============================================================================
//
// Each worker is a long-lived task: an immediate first run, then a fixed
// interval. Per-item errors are logged and swallowed so one bad record never
// halts a run; a run-level error is logged and the next tick proceeds. A
// shutdown watch stops the loop after the current run.
//
// Coordination between workers happens exclusively through the store, with
// status-guarded updates; there is no cross-worker shared mutable state.
// =============================================================================

pub mod exit_monitor;
pub mod gex_refresher;
pub mod order_creator;
pub mod order_poller;
pub mod paper_executor;
pub mod position_refresher;
pub mod signal_processor;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::app_state::AppState;
use crate::types::TradingMode;

/// Timeframe tag under which the GEX refresher persists summaries and the
/// decision paths read them.
pub const GEX_TIMEFRAME: &str = "15m";

/// Drive one worker: immediate first run, then every `period` until the
/// shutdown flag flips.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut run: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    info!(worker = name, period_secs = period.as_secs(), "worker started");
    let mut ticker = interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run().await {
                    error!(worker = name, error = %e, "worker run failed");
                }
            }
            _ = shutdown_rx.changed() => {
                info!(worker = name, "worker stopped");
                break;
            }
        }
    }
}

/// Spawn the full worker set for the configured mode.
pub fn spawn_all(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    let cfg = state.config.read().workers.clone();
    let mode = state.mode();
    let mut handles = Vec::new();

    macro_rules! spawn_worker {
        ($name:literal, $secs:expr, $module:ident) => {{
            let task_state = state.clone();
            let shutdown_rx = state.shutdown_rx();
            handles.push(tokio::spawn(run_periodic(
                $name,
                Duration::from_secs($secs),
                shutdown_rx,
                move || {
                    let state = task_state.clone();
                    async move { $module::run_once(&state).await }
                },
            )));
        }};
    }

    spawn_worker!("signal_processor", cfg.signal_processor_secs, signal_processor);
    spawn_worker!("order_creator", cfg.order_creator_secs, order_creator);
    spawn_worker!("paper_executor", cfg.paper_executor_secs, paper_executor);
    spawn_worker!(
        "position_refresher",
        cfg.position_refresher_secs,
        position_refresher
    );
    spawn_worker!("exit_monitor", cfg.exit_monitor_secs, exit_monitor);
    if mode == TradingMode::Live {
        spawn_worker!("order_poller", cfg.order_poller_secs, order_poller);
    }
    spawn_worker!("gex_refresher", cfg.gex_refresher_secs, gex_refresher);

    info!(count = handles.len(), mode = %mode, "workers spawned");
    handles
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_immediately_then_on_interval() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let task_runs = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "test",
            Duration::from_secs(30),
            rx,
            move || {
                let runs = task_runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        // First run happens without waiting a full interval.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_errors_do_not_stop_the_loop() {
        let (tx, rx) = watch::channel(false);
        let runs = Arc::new(AtomicU32::new(0));

        let task_runs = runs.clone();
        let handle = tokio::spawn(run_periodic(
            "flaky",
            Duration::from_secs(10),
            rx,
            move || {
                let runs = task_runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
