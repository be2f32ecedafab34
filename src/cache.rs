// =============================================================================
// Cache Service — process-wide TTL key-value cache
// =============================================================================
//
// In-memory map from string key to a JSON value with per-entry TTL. `get`
// returns the value while `now <= expires_at`, otherwise removes the entry
// and counts a miss. A sweep task evicts all expired entries every 60
// seconds.
//
// Exactly one instance exists per process: constructed at startup, injected
// by reference, torn down on shutdown.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tracing::{debug, info};

/// Sweep cadence for expired-entry eviction.
const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
    #[allow(dead_code)]
    created_at: Instant,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    #[serde(serialize_with = "two_decimals")]
    pub hit_rate: f64,
    pub entries: usize,
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100.0).round() / 100.0)
}

/// Process-wide TTL cache. Thread-safe; all operations are self-contained.
pub struct CacheService {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl CacheService {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Fetch a raw value. Expired entries are removed on access.
    pub fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if now <= entry.expires_at {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        // Entry exists but expired: remove it under the write lock.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if now <= entry.expires_at {
                // Re-set concurrently; honor the fresh value.
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed fetch via serde.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key)?;
        serde_json::from_value(value).ok()
    }

    /// Store a value with a TTL.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                debug!(key, error = %e, "cache set skipped — value not serialisable");
                return;
            }
        };
        let now = Instant::now();
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                created_at: now,
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every expired entry; returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.expires_at);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            entries: self.entries.read().len(),
        }
    }

    /// Run the periodic eviction sweep until shutdown. Spawned once at
    /// startup.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(
            SWEEP_INTERVAL_SECS,
        ));
        ticker.tick().await; // immediate first tick — nothing to sweep yet
        info!(interval_secs = SWEEP_INTERVAL_SECS, "cache sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "cache sweep evicted expired entries");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("cache sweeper stopped");
                    break;
                }
            }
        }
    }
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("entries", &self.entries.read().len())
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
    fn set_get_roundtrip() {
        let cache = CacheService::new();
        cache.set("quote:SPY", &serde_json::json!({"price": 502.15}), Duration::from_secs(30));

        let value: serde_json::Value = cache.get("quote:SPY").unwrap();
        assert_eq!(value["price"], 502.15);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.sets, 1);
    }

    #[test]
    fn expired_entry_is_a_miss_and_removed() {
        let cache = CacheService::new();
        cache.set("k", &1u32, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get::<u32>("k").is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn delete_counts_only_real_removals() {
        let cache = CacheService::new();
        cache.set("k", &true, Duration::from_secs(60));
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert_eq!(cache.stats().deletes, 1);
    }

    #[test]
    fn eviction_sweep_removes_only_expired() {
        let cache = CacheService::new();
        cache.set("stale", &1u32, Duration::from_millis(0));
        cache.set("fresh", &2u32, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.get::<u32>("fresh"), Some(2));
    }

    #[test]
    fn hit_rate_is_bounded() {
        let cache = CacheService::new();
        assert!((cache.stats().hit_rate - 0.0).abs() < f64::EPSILON);

        cache.set("k", &1u32, Duration::from_secs(60));
        let _ = cache.get::<u32>("k");
        let _ = cache.get::<u32>("missing");
        let rate = cache.stats().hit_rate;
        assert!((0.0..=1.0).contains(&rate));
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let cache = std::sync::Arc::new(CacheService::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(cache.clone().run_sweeper(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
