// =============================================================================
// Health Check Service — per-component and composite health
// =============================================================================
//
// DATABASE health comes from a live store ping; GEX and CONTEXT come from
// the degraded tracker (maintained by their refreshers). The composite
// verdict maps to HTTP status at the API layer: 200 healthy, 503 otherwise.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::observability::degraded::{Component, ComponentHealth, DegradedModeTracker};
use crate::store::Store;
use crate::types::TradingMode;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub degraded: bool,
    pub summary: String,
    pub mode: TradingMode,
    pub uptime_seconds: u64,
    pub components: HashMap<String, ComponentHealth>,
    pub last_signal_at: Option<DateTime<Utc>>,
    pub last_order_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub component: String,
    pub health: ComponentHealth,
}

pub struct HealthCheckService {
    store: Store,
    degraded: Arc<DegradedModeTracker>,
    started_at: Instant,
}

impl HealthCheckService {
    pub fn new(store: Store, degraded: Arc<DegradedModeTracker>) -> Self {
        Self {
            store,
            degraded,
            started_at: Instant::now(),
        }
    }

    /// Probe the database and refresh its tracker entry.
    async fn probe_database(&self) {
        match self.store.ping().await {
            Ok(()) => self.degraded.mark_healthy(Component::Database),
            Err(e) => self
                .degraded
                .mark_unhealthy(Component::Database, format!("ping failed: {e}")),
        }
    }

    /// Composite health across all components.
    pub async fn composite(
        &self,
        mode: TradingMode,
        last_signal_at: Option<DateTime<Utc>>,
        last_order_at: Option<DateTime<Utc>>,
    ) -> HealthReport {
        self.probe_database().await;
        let snapshot = self.degraded.snapshot();

        HealthReport {
            healthy: !snapshot.degraded,
            degraded: snapshot.degraded,
            summary: snapshot.summary,
            mode,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components: snapshot.components,
            last_signal_at,
            last_order_at,
        }
    }

    /// Detail for one component by its URL name.
    pub async fn component(&self, name: &str) -> Option<ComponentReport> {
        let component = match name.to_lowercase().as_str() {
            "gex" => Component::Gex,
            "context" => Component::Context,
            "database" => Component::Database,
            _ => return None,
        };
        if component == Component::Database {
            self.probe_database().await;
        }
        Some(ComponentReport {
            component: component.to_string(),
            health: self.degraded.component_health(component),
        })
    }
}

impl std::fmt::Debug for HealthCheckService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckService").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn composite_healthy_then_degraded() {
        let store = Store::open_in_memory().unwrap();
        let degraded = Arc::new(DegradedModeTracker::new());
        let health = HealthCheckService::new(store, degraded.clone());

        let report = health.composite(TradingMode::Paper, None, None).await;
        assert!(report.healthy);
        assert_eq!(report.components.len(), 3);

        degraded.mark_unhealthy(Component::Gex, "refresh failing");
        let report = health.composite(TradingMode::Paper, None, None).await;
        assert!(!report.healthy);
        assert!(report.degraded);
        assert!(report.summary.contains("GEX"));
    }

    #[tokio::test]
    async fn component_lookup_by_name() {
        let store = Store::open_in_memory().unwrap();
        let degraded = Arc::new(DegradedModeTracker::new());
        let health = HealthCheckService::new(store, degraded);

        let report = health.component("database").await.unwrap();
        assert_eq!(report.component, "DATABASE");
        assert!(report.health.healthy);

        assert!(health.component("gex").await.is_some());
        assert!(health.component("unknown").await.is_none());
    }
}
