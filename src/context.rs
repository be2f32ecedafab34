// =============================================================================
// Context Cache — most recent market-regime snapshot, TTL-cached
// =============================================================================
//
// Context snapshots (VIX, trend, bias, regime) are produced externally and
// land in the store; this cache serves the latest row with a short TTL so
// the orchestrator does not hit the database on every decision. Cold fetches
// are coalesced. Missing or stale context flips the CONTEXT component of the
// degraded tracker and the orchestrator skips context-dependent rules.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::ContextSnapshot;
use crate::observability::degraded::{Component, DegradedModeTracker};
use crate::store::Store;

/// How long a fetched snapshot is served without re-reading the store.
const CONTEXT_TTL: Duration = Duration::from_secs(60);
/// Snapshots older than this no longer count as usable context.
const MAX_SNAPSHOT_AGE_MINUTES: i64 = 30;

struct Cached {
    fetched_at: Instant,
    snapshot: Option<ContextSnapshot>,
}

pub struct ContextCache {
    store: Store,
    degraded: Arc<DegradedModeTracker>,
    cached: Mutex<Option<Cached>>,
    /// Cold-fetch coalescing gate.
    fetch_gate: tokio::sync::Mutex<()>,
}

impl ContextCache {
    pub fn new(store: Store, degraded: Arc<DegradedModeTracker>) -> Self {
        Self {
            store,
            degraded,
            cached: Mutex::new(None),
            fetch_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The current market context, or `None` when no usable snapshot exists
    /// (degraded mode: context-dependent rules are skipped).
    pub async fn current(&self) -> Option<ContextSnapshot> {
        if let Some(snapshot) = self.fresh_cached() {
            return snapshot;
        }

        // Cold fetch, coalesced: the first caller reads the store, everyone
        // else re-checks the cache behind the gate.
        let _guard = self.fetch_gate.lock().await;
        if let Some(snapshot) = self.fresh_cached() {
            return snapshot;
        }

        let snapshot = match self.store.latest_context_snapshot().await {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "context snapshot read failed");
                self.degraded
                    .mark_unhealthy(Component::Context, format!("store read failed: {e}"));
                return None;
            }
        };

        let usable = snapshot.as_ref().filter(|snap| {
            let age_minutes = (Utc::now() - snap.timestamp).num_minutes();
            age_minutes <= MAX_SNAPSHOT_AGE_MINUTES
        });

        match (&snapshot, usable) {
            (Some(_), Some(_)) => self.degraded.mark_healthy(Component::Context),
            (Some(snap), None) => {
                self.degraded.mark_unhealthy(
                    Component::Context,
                    format!(
                        "latest snapshot is {} minutes old",
                        (Utc::now() - snap.timestamp).num_minutes()
                    ),
                );
            }
            (None, _) => {
                self.degraded
                    .mark_unhealthy(Component::Context, "no context snapshots");
            }
        }

        let usable = usable.cloned();
        *self.cached.lock() = Some(Cached {
            fetched_at: Instant::now(),
            snapshot: usable.clone(),
        });
        debug!(usable = usable.is_some(), "context cache refreshed");
        usable
    }

    /// Returns `Some(inner)` when the TTL cache is warm; the inner option is
    /// the (possibly absent) usable snapshot.
    fn fresh_cached(&self) -> Option<Option<ContextSnapshot>> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() <= CONTEXT_TTL)
            .map(|c| c.snapshot.clone())
    }

    /// Drop the cached value so the next read hits the store.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

impl std::fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCache").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketBias;

    fn tracker() -> Arc<DegradedModeTracker> {
        Arc::new(DegradedModeTracker::new())
    }

    #[tokio::test]
    async fn missing_context_degrades_and_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let degraded = tracker();
        let cache = ContextCache::new(store, degraded.clone());

        assert!(cache.current().await.is_none());
        assert!(!degraded.is_healthy(Component::Context));
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served_and_cached() {
        let store = Store::open_in_memory().unwrap();
        let degraded = tracker();
        let snapshot = ContextSnapshot::new(
            21.0,
            MarketBias::Bullish,
            MarketBias::Bullish,
            "TRENDING",
            75.0,
        );
        store.insert_context_snapshot(&snapshot).await.unwrap();

        let cache = ContextCache::new(store.clone(), degraded.clone());
        let current = cache.current().await.unwrap();
        assert!((current.vix - 21.0).abs() < f64::EPSILON);
        assert!(degraded.is_healthy(Component::Context));

        // A newer row is invisible until the TTL lapses or invalidate().
        let newer = ContextSnapshot::new(
            35.0,
            MarketBias::Bearish,
            MarketBias::Bearish,
            "VOLATILE",
            90.0,
        );
        store.insert_context_snapshot(&newer).await.unwrap();
        let cached = cache.current().await.unwrap();
        assert!((cached.vix - 21.0).abs() < f64::EPSILON);

        cache.invalidate();
        let refreshed = cache.current().await.unwrap();
        assert!((refreshed.vix - 35.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stale_snapshot_counts_as_missing() {
        let store = Store::open_in_memory().unwrap();
        let degraded = tracker();
        let mut snapshot = ContextSnapshot::new(
            19.0,
            MarketBias::Neutral,
            MarketBias::Neutral,
            "CHOPPY",
            50.0,
        );
        snapshot.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.insert_context_snapshot(&snapshot).await.unwrap();

        let cache = ContextCache::new(store, degraded.clone());
        assert!(cache.current().await.is_none());
        assert!(!degraded.is_healthy(Component::Context));
    }
}
