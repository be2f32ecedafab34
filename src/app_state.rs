// =============================================================================
// Central Application State — Vega options engine
// =============================================================================
//
// Every process-wide singleton is constructed here at boot and injected by
// reference; there are no ambient globals. All durable state lives in the
// store; the in-memory services expose value-returning queries and
// self-contained mutations only.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::info;

use crate::broker::{select_broker, BrokerAdapter};
use crate::cache::CacheService;
use crate::config::EngineConfig;
use crate::context::ContextCache;
use crate::errors::StoreError;
use crate::market_data::MarketDataService;
use crate::observability::audit::AuditQueryService;
use crate::observability::degraded::DegradedModeTracker;
use crate::observability::health::HealthCheckService;
use crate::observability::metrics::MetricsService;
use crate::pipeline::{SharedTimestamp, SignalPipeline};
use crate::rate_limit::RateLimiterManager;
use crate::store::Store;
use crate::types::TradingMode;

/// Shared application state; wrapped in `Arc` immediately after construction.
pub struct AppState {
    pub config: Arc<RwLock<EngineConfig>>,
    pub store: Store,
    pub cache: Arc<CacheService>,
    pub rate_limiter: Arc<RateLimiterManager>,
    pub market_data: Arc<MarketDataService>,
    pub context_cache: Arc<ContextCache>,
    pub degraded: Arc<DegradedModeTracker>,
    pub metrics: Arc<MetricsService>,
    pub audit_query: Arc<AuditQueryService>,
    pub health: Arc<HealthCheckService>,
    pub pipeline: Arc<SignalPipeline>,
    pub broker: Arc<dyn BrokerAdapter>,

    /// Broadcast flag flipped once at shutdown; workers and sweepers watch
    /// it.
    pub shutdown_tx: watch::Sender<bool>,

    pub started_at: Instant,
    pub last_signal_at: SharedTimestamp,
    pub last_order_at: SharedTimestamp,
}

impl AppState {
    /// Construct all subsystems from validated configuration.
    pub fn new(config: EngineConfig) -> Result<Self, StoreError> {
        let store = Store::open(&config.db_path)?;
        Ok(Self::with_store(config, store))
    }

    /// Construction with an externally supplied store (tests use in-memory).
    pub fn with_store(config: EngineConfig, store: Store) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        let cache = Arc::new(CacheService::new());
        let rate_limiter = Arc::new(RateLimiterManager::new());
        let degraded = Arc::new(DegradedModeTracker::new());
        let metrics = Arc::new(MetricsService::new());

        let market_data = Arc::new(MarketDataService::from_config(
            &config.providers,
            cache.clone(),
            rate_limiter.clone(),
            degraded.clone(),
        ));
        let context_cache = Arc::new(ContextCache::new(store.clone(), degraded.clone()));
        let audit_query = Arc::new(AuditQueryService::new(store.clone()));
        let health = Arc::new(HealthCheckService::new(store.clone(), degraded.clone()));
        let broker = select_broker(&config.broker);

        let last_signal_at: SharedTimestamp = Arc::new(RwLock::new(None));
        let last_order_at: SharedTimestamp = Arc::new(RwLock::new(None));

        let config = Arc::new(RwLock::new(config));
        let pipeline = Arc::new(SignalPipeline::new(
            store.clone(),
            metrics.clone(),
            config.clone(),
            last_signal_at.clone(),
        ));

        info!(
            providers = ?market_data.provider_names(),
            broker = broker.name(),
            "application state constructed"
        );

        Self {
            config,
            store,
            cache,
            rate_limiter,
            market_data,
            context_cache,
            degraded,
            metrics,
            audit_query,
            health,
            pipeline,
            broker,
            shutdown_tx,
            started_at: Instant::now(),
            last_signal_at,
            last_order_at,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.config.read().mode
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Flip the shutdown flag and tear down in-memory services: workers stop
    /// after their current item, rate-limit waiters resolve with a
    /// cancellation error, and the cache sweeper exits.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.rate_limiter.shutdown();
        self.cache.clear();
        info!("shutdown initiated");
    }

    pub fn note_order_activity(&self) {
        *self.last_order_at.write() = Some(Utc::now());
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("mode", &self.mode())
            .field("broker", &self.broker.name())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
