// =============================================================================
// Degraded Mode Tracker — component health with an aggregated verdict
// =============================================================================
//
// Tracks healthy/unhealthy status for GEX, CONTEXT, and DATABASE. Market-data
// provider failures are recorded alongside as counters; a failing provider
// alone never degrades overall status because the demo fallback keeps quotes
// flowing.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Subsystems whose degradation changes engine behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Component {
    Gex,
    Context,
    Database,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gex => "GEX",
            Self::Context => "CONTEXT",
            Self::Database => "DATABASE",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderFailureStats {
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Aggregated degraded-mode snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedSnapshot {
    pub degraded: bool,
    pub summary: String,
    pub components: HashMap<String, ComponentHealth>,
    pub provider_failures: HashMap<String, ProviderFailureStats>,
}

struct Inner {
    components: HashMap<Component, ComponentHealth>,
    providers: HashMap<String, ProviderFailureStats>,
}

/// Process-wide tracker; constructed at boot and injected everywhere.
pub struct DegradedModeTracker {
    inner: RwLock<Inner>,
}

impl DegradedModeTracker {
    pub fn new() -> Self {
        let now = Utc::now();
        let mut components = HashMap::new();
        for component in [Component::Gex, Component::Context, Component::Database] {
            components.insert(
                component,
                ComponentHealth {
                    healthy: true,
                    reason: None,
                    since: now,
                },
            );
        }
        Self {
            inner: RwLock::new(Inner {
                components,
                providers: HashMap::new(),
            }),
        }
    }

    pub fn mark_healthy(&self, component: Component) {
        let mut inner = self.inner.write();
        let entry = inner.components.get_mut(&component).expect("known component");
        if !entry.healthy {
            info!(component = %component, "component recovered");
            *entry = ComponentHealth {
                healthy: true,
                reason: None,
                since: Utc::now(),
            };
        }
    }

    pub fn mark_unhealthy(&self, component: Component, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write();
        let entry = inner.components.get_mut(&component).expect("known component");
        if entry.healthy {
            warn!(component = %component, reason = %reason, "component degraded");
            *entry = ComponentHealth {
                healthy: false,
                reason: Some(reason),
                since: Utc::now(),
            };
        } else {
            entry.reason = Some(reason);
        }
    }

    pub fn is_healthy(&self, component: Component) -> bool {
        self.inner
            .read()
            .components
            .get(&component)
            .map(|c| c.healthy)
            .unwrap_or(false)
    }

    /// Record a market-data provider failure. Providers degrade quote
    /// freshness, not engine health — overall status is unaffected.
    pub fn record_provider_failure(&self, provider: &str, error: impl Into<String>) {
        let mut inner = self.inner.write();
        let stats = inner.providers.entry(provider.to_string()).or_default();
        stats.failures += 1;
        stats.last_error = Some(error.into());
        stats.last_failure_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> DegradedSnapshot {
        let inner = self.inner.read();
        let unhealthy: Vec<String> = inner
            .components
            .iter()
            .filter(|(_, health)| !health.healthy)
            .map(|(component, _)| component.to_string())
            .collect();

        let degraded = !unhealthy.is_empty();
        let summary = if degraded {
            format!("degraded: {}", unhealthy.join(", "))
        } else {
            "all components healthy".to_string()
        };

        DegradedSnapshot {
            degraded,
            summary,
            components: inner
                .components
                .iter()
                .map(|(c, h)| (c.to_string(), h.clone()))
                .collect(),
            provider_failures: inner.providers.clone(),
        }
    }

    pub fn component_health(&self, component: Component) -> ComponentHealth {
        self.inner
            .read()
            .components
            .get(&component)
            .cloned()
            .expect("known component")
    }
}

impl Default for DegradedModeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DegradedModeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("DegradedModeTracker")
            .field("degraded", &snap.degraded)
            .field("summary", &snap.summary)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let tracker = DegradedModeTracker::new();
        let snap = tracker.snapshot();
        assert!(!snap.degraded);
        assert_eq!(snap.components.len(), 3);
    }

    #[test]
    fn unhealthy_component_degrades_aggregate() {
        let tracker = DegradedModeTracker::new();
        tracker.mark_unhealthy(Component::Gex, "chain fetch failing");

        let snap = tracker.snapshot();
        assert!(snap.degraded);
        assert!(snap.summary.contains("GEX"));
        assert!(!tracker.is_healthy(Component::Gex));
        assert!(tracker.is_healthy(Component::Database));

        tracker.mark_healthy(Component::Gex);
        assert!(!tracker.snapshot().degraded);
    }

    #[test]
    fn provider_failures_do_not_degrade_status() {
        let tracker = DegradedModeTracker::new();
        tracker.record_provider_failure("tradier", "HTTP 500");
        tracker.record_provider_failure("tradier", "HTTP 500");

        let snap = tracker.snapshot();
        assert!(!snap.degraded);
        let stats = snap.provider_failures.get("tradier").unwrap();
        assert_eq!(stats.failures, 2);
        assert!(stats.last_error.as_deref() == Some("HTTP 500"));
    }
}
