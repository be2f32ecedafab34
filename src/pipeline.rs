// =============================================================================
// Signal Pipeline — NORMALIZATION → VALIDATION → DEDUPLICATION → persistence
// =============================================================================
//
// The webhook handler acknowledges as soon as normalization returns; the
// remaining stages run on a background task keyed by a correlation id, so
// the HTTP response never blocks on I/O beyond parsing.
//
// The DECISION and PERSISTENCE stages for the entry verdict complete in the
// signal-processor worker, which picks up the pending signal rows written
// here. Every rejection records its failing stage in `pipeline_failures`
// and the metrics reason histogram.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::{OptionParams, PipelineFailure, Signal};
use crate::errors::PipelineError;
use crate::observability::audit::AuditLogger;
use crate::observability::metrics::{LatencyKind, MetricsService};
use crate::store::Store;
use crate::types::{PipelineStage, SignalSource};

/// Shared last-activity timestamp (surfaced by /health).
pub type SharedTimestamp = Arc<RwLock<Option<DateTime<Utc>>>>;

// =============================================================================
// Deduplication cache
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// TTL-bounded set of recently seen signal keys.
pub struct DedupCache {
    entries: Mutex<HashMap<u64, Instant>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hash of the identity tuple: source, symbol, direction, timeframe, and
    /// the timestamp floored to the dedup granularity.
    pub fn signal_key(signal: &Signal, granularity_secs: i64) -> u64 {
        let mut hasher = DefaultHasher::new();
        signal.source.as_str().hash(&mut hasher);
        signal.symbol.hash(&mut hasher);
        signal.direction.as_str().hash(&mut hasher);
        signal.timeframe.hash(&mut hasher);
        (signal.timestamp.timestamp().div_euclid(granularity_secs)).hash(&mut hasher);
        hasher.finish()
    }

    /// Returns true when the key was already present inside the TTL window;
    /// otherwise records it.
    pub fn check_and_insert(&self, key: u64) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        // Opportunistic pruning keeps the map bounded without a sweeper.
        if entries.len() > 4096 {
            entries.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        }

        match entries.get(&key) {
            Some(seen) if now.duration_since(*seen) <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                entries.insert(key, now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// What the webhook handler needs to acknowledge receipt.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub correlation_id: String,
    pub source: SignalSource,
}

pub struct SignalPipeline {
    store: Store,
    metrics: Arc<MetricsService>,
    config: Arc<RwLock<EngineConfig>>,
    dedup: DedupCache,
    last_signal_at: SharedTimestamp,
}

impl SignalPipeline {
    pub fn new(
        store: Store,
        metrics: Arc<MetricsService>,
        config: Arc<RwLock<EngineConfig>>,
        last_signal_at: SharedTimestamp,
    ) -> Self {
        let ttl = Duration::from_secs(config.read().dedup_ttl_seconds);
        Self {
            store,
            metrics,
            config,
            dedup: DedupCache::new(ttl),
            last_signal_at,
        }
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    /// Synchronous normalization, then background processing. Returns as
    /// soon as the payload has been normalized; the remaining stages never
    /// block the webhook response.
    pub fn ingest(self: &Arc<Self>, payload: Value) -> IngestReceipt {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let (source, outcome) = crate::parsers::parse_payload(&correlation_id, payload);

        let pipeline = self.clone();
        let task_correlation_id = correlation_id.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline
                .process_normalized(&task_correlation_id, source, outcome, started)
                .await
            {
                debug!(
                    correlation_id = %task_correlation_id,
                    outcome = %e,
                    "pipeline dropped payload"
                );
            }
        });

        IngestReceipt {
            correlation_id,
            source,
        }
    }

    /// Full pipeline for one payload, end to end. Tests drive this directly;
    /// `ingest` splits it around the synchronous-normalization boundary.
    pub async fn process_payload(
        &self,
        correlation_id: &str,
        payload: Value,
    ) -> Result<Signal, PipelineError> {
        let started = Instant::now();
        let (source, outcome) = crate::parsers::parse_payload(correlation_id, payload);
        self.process_normalized(correlation_id, source, outcome, started)
            .await
    }

    /// Stages after NORMALIZATION: validation, deduplication, persistence.
    async fn process_normalized(
        &self,
        correlation_id: &str,
        source: SignalSource,
        outcome: crate::parsers::ParseOutcome,
        started: Instant,
    ) -> Result<Signal, PipelineError> {
        if outcome.is_test {
            self.metrics.record_signal_rejected("test_ping");
            self.record_failure(
                correlation_id,
                PipelineStage::Normalization,
                "test ping — not actionable",
                &outcome.raw_payload,
            )
            .await;
            return Err(PipelineError::rejected(
                PipelineStage::Normalization,
                "test ping",
            ));
        }

        let Some(signal) = outcome.signal else {
            let reason = if outcome.errors.is_empty() {
                "unparseable payload".to_string()
            } else {
                outcome.errors.join("; ")
            };
            self.metrics.record_signal_rejected("normalization_failed");
            self.record_failure(
                correlation_id,
                PipelineStage::Normalization,
                &reason,
                &outcome.raw_payload,
            )
            .await;
            return Err(PipelineError::rejected(PipelineStage::Normalization, reason));
        };

        debug!(
            correlation_id,
            source = source.as_str(),
            symbol = %signal.symbol,
            direction = %signal.direction,
            "signal normalized"
        );

        // ── VALIDATION ──────────────────────────────────────────────────
        if let Err((reason_key, reason)) = self.validate(&signal) {
            self.metrics.record_signal_rejected(reason_key);
            self.record_failure(
                correlation_id,
                PipelineStage::Validation,
                &reason,
                &outcome.raw_payload,
            )
            .await;
            return Err(PipelineError::rejected(PipelineStage::Validation, reason));
        }

        // ── DEDUPLICATION ───────────────────────────────────────────────
        let granularity = self.config.read().dedup_granularity_seconds;
        let key = DedupCache::signal_key(&signal, granularity);
        if self.dedup.check_and_insert(key) {
            self.metrics.record_signal_rejected("duplicate");
            self.record_failure(
                correlation_id,
                PipelineStage::Deduplication,
                "identical signal inside the dedup window",
                &outcome.raw_payload,
            )
            .await;
            return Err(PipelineError::DuplicateSignal);
        }

        // ── PERSISTENCE (pending signal + received audit, one tx) ───────
        let audit = AuditLogger::signal_received(&signal);
        let mut persist = self.store.persist_signal(&signal, &audit).await;
        if matches!(&persist, Err(e) if e.is_retryable()) {
            warn!(correlation_id, "transient store error persisting signal — retrying once");
            persist = self.store.persist_signal(&signal, &audit).await;
        }
        if let Err(e) = persist {
            self.metrics.record_signal_rejected("persistence_failed");
            self.record_failure(
                correlation_id,
                PipelineStage::Persistence,
                &e.to_string(),
                &outcome.raw_payload,
            )
            .await;
            return Err(PipelineError::Store(e));
        }

        self.metrics.record_signal_accepted();
        self.metrics.record_latency(
            LatencyKind::SignalProcessing,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        *self.last_signal_at.write() = Some(Utc::now());

        info!(
            correlation_id,
            signal_id = %signal.id,
            symbol = %signal.symbol,
            direction = %signal.direction,
            source = source.as_str(),
            "signal accepted — awaiting entry decision"
        );
        Ok(signal)
    }

    /// VALIDATION stage: structural checks on the normalized signal.
    fn validate(&self, signal: &Signal) -> Result<(), (&'static str, String)> {
        if signal.symbol.trim().is_empty() {
            return Err(("missing_symbol", "symbol is empty".to_string()));
        }

        let max_age_minutes = self.config.read().max_signal_age_minutes;
        let age_minutes = (Utc::now() - signal.timestamp).num_minutes();
        if age_minutes > max_age_minutes {
            return Err((
                "stale_signal",
                format!("signal is {age_minutes} minutes old (max {max_age_minutes})"),
            ));
        }

        if OptionParams::from_metadata(&signal.metadata).is_none() {
            return Err((
                "missing_metadata",
                "derived option parameters absent from metadata".to_string(),
            ));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        correlation_id: &str,
        stage: PipelineStage,
        reason: &str,
        payload: &Value,
    ) {
        let failure = PipelineFailure {
            id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            stage,
            reason: reason.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_pipeline_failure(&failure).await {
            warn!(correlation_id, stage = stage.as_str(), error = %e,
                  "failed to record pipeline failure");
        }
    }
}

impl std::fmt::Debug for SignalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalPipeline")
            .field("dedup", &self.dedup.stats())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pipeline() -> (Arc<SignalPipeline>, Store) {
        let store = Store::open_in_memory().unwrap();
        let metrics = Arc::new(MetricsService::new());
        let config = Arc::new(RwLock::new(EngineConfig::default()));
        let last_signal = Arc::new(RwLock::new(None));
        (
            Arc::new(SignalPipeline::new(
                store.clone(),
                metrics,
                config,
                last_signal,
            )),
            store,
        )
    }

    fn bullish_payload() -> Value {
        json!({
            "trend": "BULLISH",
            "ticker": "SPY",
            "current_price": 502.15,
            "score": 8.5,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    #[tokio::test]
    async fn accepted_signal_is_persisted_pending() {
        let (pipeline, store) = pipeline();
        let signal = pipeline
            .process_payload("corr-1", bullish_payload())
            .await
            .unwrap();

        let stored = store.signal_by_id(&signal.id).await.unwrap().unwrap();
        assert_eq!(stored.symbol, "SPY");
        assert!(stored.validation_result.is_none());
        assert_eq!(store.unprocessed_signals(10).await.unwrap().len(), 1);

        // Received audit entry landed in the same transaction.
        let audit = store
            .query_audit(&crate::store::AuditFilter {
                signal_id: Some(signal.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_within_ttl_is_dropped() {
        let (pipeline, store) = pipeline();
        let payload = bullish_payload();

        pipeline
            .process_payload("corr-1", payload.clone())
            .await
            .unwrap();
        let second = pipeline.process_payload("corr-2", payload).await;
        assert!(matches!(second, Err(PipelineError::DuplicateSignal)));

        // Exactly one signal row; dedup stats show the hit.
        assert_eq!(store.unprocessed_signals(10).await.unwrap().len(), 1);
        assert!(pipeline.dedup_stats().hits >= 1);
    }

    #[tokio::test]
    async fn stale_signal_fails_validation() {
        let (pipeline, _) = pipeline();
        let payload = json!({
            "trend": "BULLISH",
            "ticker": "SPY",
            "current_price": 502.15,
            "score": 8.5,
            "timestamp": (Utc::now() - chrono::Duration::minutes(60)).to_rfc3339(),
        });
        let result = pipeline.process_payload("corr-1", payload).await;
        assert!(matches!(
            result,
            Err(PipelineError::Rejected {
                stage: PipelineStage::Validation,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn malformed_payload_records_normalization_failure() {
        let (pipeline, _) = pipeline();
        let result = pipeline
            .process_payload("corr-1", json!({"hello": "world"}))
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::Rejected {
                stage: PipelineStage::Normalization,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ping_is_flagged_not_malformed() {
        let (pipeline, _) = pipeline();
        let result = pipeline
            .process_payload("corr-1", json!({"test": true}))
            .await;
        let Err(PipelineError::Rejected { stage, reason }) = result else {
            panic!("expected rejection");
        };
        assert_eq!(stage, PipelineStage::Normalization);
        assert!(reason.contains("test ping"));
    }

    #[tokio::test]
    async fn distinct_minutes_are_not_duplicates() {
        let (pipeline, store) = pipeline();
        let mut payload = bullish_payload();
        pipeline
            .process_payload("corr-1", payload.clone())
            .await
            .unwrap();

        // Same identity but three minutes later lands in a different bucket.
        payload["timestamp"] =
            json!((Utc::now() + chrono::Duration::minutes(3)).to_rfc3339());
        pipeline.process_payload("corr-2", payload).await.unwrap();
        assert_eq!(store.unprocessed_signals(10).await.unwrap().len(), 2);
    }
}
