// =============================================================================
// Market Data Service — cached, rate-limited provider fan-out with failover
// =============================================================================
//
// Provider selection per quote:
//   (a) cache hit wins;
//   (b) else the configured primary is tried, gated by its rate limiter;
//   (c) else each other configured provider in declared order;
//   (d) else a deterministic demo quote (±0.5 % jitter) tagged provider=demo.
//
// Successful fetches cache for 30 s; market-hours status caches for 300 s.
// Concurrent callers for the same symbol coalesce into one upstream fetch.
// =============================================================================

pub mod hours;
pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::CacheService;
use crate::config::ProviderConfig;
use crate::observability::degraded::DegradedModeTracker;
use crate::rate_limit::RateLimiterManager;
use crate::types::Direction;

use hours::MarketHours;
use providers::{AlpacaProvider, PolygonProvider, QuoteProvider, TradierProvider};

/// Quote cache TTL.
const QUOTE_TTL: Duration = Duration::from_secs(30);
/// Market-hours cache TTL.
const HOURS_TTL: Duration = Duration::from_secs(300);
/// Option-chain cache TTL.
const CHAIN_TTL: Duration = Duration::from_secs(300);

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub open: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
}

/// One option contract row in a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub strike: Decimal,
    pub right: Direction,
    pub expiration: NaiveDate,
    pub gamma: f64,
    pub open_interest: u64,
    pub volume: u64,
    #[serde(default)]
    pub implied_volatility: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChain {
    pub symbol: String,
    pub spot: Decimal,
    pub contracts: Vec<OptionContract>,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Service
// =============================================================================

pub struct MarketDataService {
    cache: Arc<CacheService>,
    limiter: Arc<RateLimiterManager>,
    degraded: Arc<DegradedModeTracker>,
    /// Configured providers in selection order (primary first).
    providers: Vec<Arc<dyn QuoteProvider>>,
    /// Per-key coalescing locks so a cold cache issues one upstream fetch.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarketDataService {
    /// Build from configuration: providers participate only when fully
    /// configured, ordered primary-first then declared order.
    pub fn from_config(
        config: &ProviderConfig,
        cache: Arc<CacheService>,
        limiter: Arc<RateLimiterManager>,
        degraded: Arc<DegradedModeTracker>,
    ) -> Self {
        let mut providers: Vec<Arc<dyn QuoteProvider>> = Vec::new();
        if config.tradier_configured() {
            providers.push(Arc::new(TradierProvider::new(
                config.tradier_api_key.clone().unwrap_or_default(),
            )));
        }
        if config.alpaca_configured() {
            providers.push(Arc::new(AlpacaProvider::new(
                config.alpaca_api_key.clone().unwrap_or_default(),
                config.alpaca_api_secret.clone().unwrap_or_default(),
            )));
        }
        if config.polygon_configured() {
            providers.push(Arc::new(PolygonProvider::new(
                config.polygon_api_key.clone().unwrap_or_default(),
            )));
        }

        if let Some(primary) = config.primary.as_deref() {
            if let Some(idx) = providers.iter().position(|p| p.name() == primary) {
                let preferred = providers.remove(idx);
                providers.insert(0, preferred);
            }
        }

        Self::with_providers(providers, cache, limiter, degraded)
    }

    /// Direct constructor used by tests to inject mock providers.
    pub fn with_providers(
        providers: Vec<Arc<dyn QuoteProvider>>,
        cache: Arc<CacheService>,
        limiter: Arc<RateLimiterManager>,
        degraded: Arc<DegradedModeTracker>,
    ) -> Self {
        Self {
            cache,
            limiter,
            degraded,
            providers,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Fetch one quote. Never fails: the demo fallback covers total provider
    /// loss.
    pub async fn get_stock_price(&self, symbol: &str) -> Quote {
        let symbol = symbol.to_uppercase();
        let cache_key = format!("md:quote:{symbol}");

        if let Some(quote) = self.cache.get::<Quote>(&cache_key) {
            return quote;
        }

        // Single-flight: first caller fetches, the rest wait then re-read.
        let gate = self.flight_gate(&cache_key);
        let _guard = gate.lock().await;
        if let Some(quote) = self.cache.get::<Quote>(&cache_key) {
            return quote;
        }

        let quote = self.fetch_with_failover(&symbol).await;
        self.cache.set(&cache_key, &quote, QUOTE_TTL);
        self.clear_flight_gate(&cache_key);
        quote
    }

    /// Parallel fan-out over symbols; per-symbol failures are independent
    /// (and absorbed by the demo fallback).
    pub async fn get_stock_prices(&self, symbols: &[String]) -> HashMap<String, Quote> {
        let futures = symbols.iter().map(|s| self.get_stock_price(s));
        let quotes = join_all(futures).await;
        quotes.into_iter().map(|q| (q.symbol.clone(), q)).collect()
    }

    pub async fn get_vix(&self) -> f64 {
        self.get_stock_price("VIX")
            .await
            .price
            .to_f64()
            .unwrap_or(0.0)
    }

    pub async fn get_spy_price(&self) -> Decimal {
        self.get_stock_price("SPY").await.price
    }

    async fn fetch_with_failover(&self, symbol: &str) -> Quote {
        for provider in &self.providers {
            let bucket = self
                .limiter
                .get_or_create(provider.name(), provider.rate_config());
            if bucket.wait_for_token().await.is_err() {
                // Shutting down; don't start new upstream calls.
                break;
            }

            match provider.fetch_quote(symbol).await {
                Ok(quote) => {
                    debug!(symbol, provider = provider.name(), "quote fetched");
                    return quote;
                }
                Err(e) => {
                    warn!(
                        symbol,
                        provider = provider.name(),
                        error = %e,
                        "provider failed — trying next"
                    );
                    self.degraded
                        .record_provider_failure(provider.name(), e.to_string());
                }
            }
        }

        debug!(symbol, "all providers exhausted — demo quote");
        providers::demo_quote(symbol, Utc::now())
    }

    // -------------------------------------------------------------------------
    // Market hours
    // -------------------------------------------------------------------------

    pub async fn get_market_hours(&self) -> MarketHours {
        if let Some(hours) = self.cache.get::<MarketHours>("md:hours") {
            return hours;
        }
        let hours = hours::market_hours_at(Utc::now());
        self.cache.set("md:hours", &hours, HOURS_TTL);
        hours
    }

    pub async fn is_market_open(&self) -> bool {
        self.get_market_hours().await.is_open
    }

    // -------------------------------------------------------------------------
    // Option chains
    // -------------------------------------------------------------------------

    /// Fetch the option chain for GEX analytics, falling back to the demo
    /// synthesizer when no provider carries greeks.
    pub async fn get_option_chain(&self, symbol: &str) -> OptionChain {
        let symbol = symbol.to_uppercase();
        let cache_key = format!("md:chain:{symbol}");

        if let Some(chain) = self.cache.get::<OptionChain>(&cache_key) {
            return chain;
        }

        let gate = self.flight_gate(&cache_key);
        let _guard = gate.lock().await;
        if let Some(chain) = self.cache.get::<OptionChain>(&cache_key) {
            return chain;
        }

        let mut chain = None;
        for provider in &self.providers {
            let bucket = self
                .limiter
                .get_or_create(provider.name(), provider.rate_config());
            if bucket.wait_for_token().await.is_err() {
                break;
            }
            match provider.fetch_chain(&symbol).await {
                Ok(fetched) => {
                    chain = Some(fetched);
                    break;
                }
                Err(crate::errors::ProviderError::NotConfigured { .. }) => continue,
                Err(e) => {
                    warn!(symbol = %symbol, provider = provider.name(), error = %e,
                          "chain fetch failed — trying next");
                    self.degraded
                        .record_provider_failure(provider.name(), e.to_string());
                }
            }
        }

        let chain = chain.unwrap_or_else(|| providers::demo_chain(&symbol, Utc::now()));
        self.cache.set(&cache_key, &chain, CHAIN_TTL);
        self.clear_flight_gate(&cache_key);
        chain
    }

    // -------------------------------------------------------------------------
    // Single-flight gates
    // -------------------------------------------------------------------------

    fn flight_gate(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock();
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn clear_flight_gate(&self, key: &str) {
        self.inflight.lock().remove(key);
    }
}

impl std::fmt::Debug for MarketDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataService")
            .field("providers", &self.provider_names())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
