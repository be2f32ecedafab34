// =============================================================================
// Rate Limiter — per-provider token buckets with FIFO queueing
// =============================================================================
//
// Each bucket refills on a fixed interval: `tokens = min(max, tokens +
// refill)`, then as many waiters as there are tokens are released in FIFO
// order. `try_consume` never blocks; `wait_for_token` suspends until a token
// arrives or the limiter shuts down.
//
// Cancellation safety: a waiter that abandoned its wait (dropped receiver)
// never consumes a token — the release loop hands that token to the next
// waiter instead.
//
// This is the engine's sole backpressure mechanism against external
// providers.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::errors::RateLimitError;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_tokens: u32,
    pub refill_amount: u32,
    pub refill_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 5,
            refill_amount: 5,
            refill_interval_ms: 1000,
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Immutable snapshot of a bucket's counters, suitable for the stats
/// surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub allowed: u64,
    pub throttled: u64,
    pub queued: u64,
    pub queue_length: usize,
    pub tokens: u32,
}

// =============================================================================
// Token bucket
// =============================================================================

struct BucketInner {
    tokens: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
    closed: bool,
    allowed: u64,
    throttled: u64,
    queued: u64,
}

/// A single token bucket. Buckets start full.
pub struct TokenBucket {
    name: String,
    config: RateLimitConfig,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BucketInner {
                tokens: config.max_tokens,
                waiters: VecDeque::new(),
                closed: false,
                allowed: 0,
                throttled: 0,
                queued: 0,
            }),
        }
    }

    /// Non-blocking acquisition. Failures count as throttled.
    pub fn try_consume(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.closed && inner.tokens > 0 {
            inner.tokens -= 1;
            inner.allowed += 1;
            true
        } else {
            inner.throttled += 1;
            false
        }
    }

    /// Suspend until a token is available. FIFO with respect to other
    /// waiters; resolves with `RateLimitError::Shutdown` when the limiter is
    /// torn down.
    pub async fn wait_for_token(&self) -> Result<(), RateLimitError> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(RateLimitError::Shutdown);
            }
            // Fast path: token in hand and nobody queued ahead of us.
            if inner.tokens > 0 && inner.waiters.is_empty() {
                inner.tokens -= 1;
                inner.allowed += 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            inner.queued += 1;
            rx
        };
        rx.await.map_err(|_| RateLimitError::Shutdown)
    }

    /// One refill tick: top up tokens, then release queued waiters in FIFO
    /// order. A waiter whose receiver is gone does not consume the token.
    pub(crate) fn refill(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.tokens = inner
            .tokens
            .saturating_add(self.config.refill_amount)
            .min(self.config.max_tokens);

        while inner.tokens > 0 {
            let Some(tx) = inner.waiters.pop_front() else {
                break;
            };
            if tx.send(()).is_ok() {
                inner.tokens -= 1;
                inner.allowed += 1;
            } else {
                debug!(bucket = %self.name, "waiter cancelled — token handed to next");
            }
        }
    }

    /// Close the bucket. All queued waiters resolve with a cancellation
    /// error (their senders drop here).
    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let inner = self.inner.lock();
        RateLimitSnapshot {
            allowed: inner.allowed,
            throttled: inner.throttled,
            queued: inner.queued,
            queue_length: inner.waiters.len(),
            tokens: inner.tokens,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("tokens", &snap.tokens)
            .field("queue_length", &snap.queue_length)
            .finish()
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Name → bucket mapping. Creating the same name twice returns the existing
/// bucket. One refill task runs per bucket; all of them stop on shutdown.
pub struct RateLimiterManager {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RateLimiterManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buckets: RwLock::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Fetch or create the named bucket. The refill task is spawned on
    /// first creation.
    pub fn get_or_create(&self, name: &str, config: RateLimitConfig) -> Arc<TokenBucket> {
        if let Some(existing) = self.buckets.read().get(name) {
            return existing.clone();
        }

        let mut buckets = self.buckets.write();
        // Double-check under the write lock.
        if let Some(existing) = buckets.get(name) {
            return existing.clone();
        }

        let bucket = Arc::new(TokenBucket::new(name, config));
        buckets.insert(name.to_string(), bucket.clone());

        let task_bucket = bucket.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(task_bucket.config.refill_interval_ms));
            // The first tick fires immediately; skip it so a fresh (full)
            // bucket is not topped up before any consumption.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => task_bucket.refill(),
                    _ = shutdown_rx.changed() => {
                        task_bucket.close();
                        break;
                    }
                }
            }
        });

        info!(
            bucket = name,
            max_tokens = config.max_tokens,
            refill_amount = config.refill_amount,
            refill_interval_ms = config.refill_interval_ms,
            "rate-limit bucket created"
        );
        bucket
    }

    pub fn get(&self, name: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.read().get(name).cloned()
    }

    /// Stop all refill tasks and resolve every queued waiter with a
    /// cancellation error.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for bucket in self.buckets.read().values() {
            bucket.close();
        }
        info!("rate limiter manager shut down");
    }

    /// Per-bucket stats for the metrics surface.
    pub fn stats(&self) -> HashMap<String, RateLimitSnapshot> {
        self.buckets
            .read()
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.snapshot()))
            .collect()
    }
}

impl Default for RateLimiterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterManager")
            .field("buckets", &self.buckets.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(max: u32, refill: u32) -> TokenBucket {
        TokenBucket::new(
            "test",
            RateLimitConfig {
                max_tokens: max,
                refill_amount: refill,
                refill_interval_ms: 1000,
            },
        )
    }

    #[test]
    fn try_consume_drains_then_throttles() {
        let b = bucket(2, 2);
        assert!(b.try_consume());
        assert!(b.try_consume());
        assert!(!b.try_consume());

        let snap = b.snapshot();
        assert_eq!(snap.allowed, 2);
        assert_eq!(snap.throttled, 1);
        assert_eq!(snap.tokens, 0);
    }

    #[test]
    fn refill_caps_at_max() {
        let b = bucket(3, 5);
        assert!(b.try_consume());
        b.refill();
        assert_eq!(b.snapshot().tokens, 3);
    }

    #[tokio::test]
    async fn waiters_release_fifo() {
        let b = Arc::new(bucket(1, 1));
        assert!(b.try_consume()); // drain

        let b1 = b.clone();
        let first = tokio::spawn(async move { b1.wait_for_token().await });
        // Let the first waiter enqueue before the second.
        tokio::task::yield_now().await;
        let b2 = b.clone();
        let second = tokio::spawn(async move { b2.wait_for_token().await });
        tokio::task::yield_now().await;
        assert_eq!(b.snapshot().queue_length, 2);

        b.refill(); // one token -> releases only the first waiter
        assert!(first.await.unwrap().is_ok());
        assert_eq!(b.snapshot().queue_length, 1);

        b.refill();
        assert!(second.await.unwrap().is_ok());

        let snap = b.snapshot();
        assert_eq!(snap.allowed, 3);
        assert_eq!(snap.queued, 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_lose_token() {
        let b = Arc::new(bucket(1, 1));
        assert!(b.try_consume());

        let b1 = b.clone();
        let doomed = tokio::spawn(async move { b1.wait_for_token().await });
        tokio::task::yield_now().await;
        let b2 = b.clone();
        let survivor = tokio::spawn(async move { b2.wait_for_token().await });
        tokio::task::yield_now().await;

        doomed.abort();
        let _ = doomed.await;

        // The single refilled token must reach the surviving waiter.
        b.refill();
        assert!(survivor.await.unwrap().is_ok());

        // allowed = 1 (try_consume) + 1 (survivor); nothing lost.
        assert_eq!(b.snapshot().allowed, 2);
    }

    #[tokio::test]
    async fn shutdown_resolves_waiters_with_error() {
        let manager = RateLimiterManager::new();
        let b = manager.get_or_create("tradier", RateLimitConfig::default());
        for _ in 0..b.config.max_tokens {
            assert!(b.try_consume());
        }

        let waiter_bucket = b.clone();
        let waiter = tokio::spawn(async move { waiter_bucket.wait_for_token().await });
        tokio::task::yield_now().await;

        manager.shutdown();
        assert_eq!(
            waiter.await.unwrap(),
            Err(RateLimitError::Shutdown)
        );

        // Post-shutdown waits fail immediately.
        assert_eq!(b.wait_for_token().await, Err(RateLimitError::Shutdown));
    }

    #[tokio::test]
    async fn manager_dedupes_by_name() {
        let manager = RateLimiterManager::new();
        let a = manager.get_or_create("alpaca", RateLimitConfig::default());
        let b = manager.get_or_create(
            "alpaca",
            RateLimitConfig {
                max_tokens: 99,
                refill_amount: 1,
                refill_interval_ms: 50,
            },
        );
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config.max_tokens, RateLimitConfig::default().max_tokens);
        assert_eq!(manager.stats().len(), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_twenty_queues_and_completes() {
        let manager = RateLimiterManager::new();
        let bucket = manager.get_or_create(
            "burst",
            RateLimitConfig {
                max_tokens: 5,
                refill_amount: 5,
                refill_interval_ms: 1000,
            },
        );

        let mut handles = Vec::new();
        for _ in 0..20 {
            let b = bucket.clone();
            handles.push(tokio::spawn(async move { b.wait_for_token().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let snap = bucket.snapshot();
        assert_eq!(snap.allowed, 20);
        assert_eq!(snap.throttled, 0);
        assert!(snap.queued >= 15);
        manager.shutdown();
    }
}
