// =============================================================================
// Quote providers — Tradier / Alpaca / Polygon REST clients + demo source
// =============================================================================
//
// Each provider wraps one reqwest client with a 10-second timeout. Providers
// never retry internally; failover across providers is the market-data
// service's job. The demo source is pure computation and cannot fail.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::errors::ProviderError;
use crate::rate_limit::RateLimitConfig;
use crate::types::Direction;

use super::{OptionChain, OptionContract, Quote};

/// Per-request timeout for every provider HTTP call.
const HTTP_TIMEOUT_SECS: u64 = 10;

fn dec_from(value: f64, provider: &str, field: &str) -> Result<Decimal, ProviderError> {
    Decimal::from_f64(value).ok_or_else(|| ProviderError::BadResponse {
        provider: provider.to_string(),
        message: format!("non-finite {field}: {value}"),
    })
}

fn dec_opt(value: Option<f64>) -> Option<Decimal> {
    value.and_then(Decimal::from_f64)
}

// =============================================================================
// Capability trait
// =============================================================================

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Token-bucket parameters for this provider's rate limiter.
    fn rate_config(&self) -> RateLimitConfig;

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError>;

    /// Option-chain fetch for the GEX refresher. Only some vendors carry
    /// greeks; the default declines so the service falls through to the
    /// demo synthesizer.
    async fn fetch_chain(&self, _symbol: &str) -> Result<OptionChain, ProviderError> {
        Err(ProviderError::NotConfigured {
            provider: self.name().to_string(),
        })
    }
}

// =============================================================================
// Tradier
// =============================================================================

pub struct TradierProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl TradierProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.tradier.com/v1".to_string(),
            client: http_client(),
        }
    }

    fn request_err(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Request {
            provider: "tradier".into(),
            message: message.into(),
        }
    }

    fn bad_response(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::BadResponse {
            provider: "tradier".into(),
            message: message.into(),
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.request_err(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(self.request_err(format!("HTTP {status}")));
        }
        resp.json()
            .await
            .map_err(|e| self.bad_response(e.to_string()))
    }
}

#[async_trait]
impl QuoteProvider for TradierProvider {
    fn name(&self) -> &'static str {
        "tradier"
    }

    fn rate_config(&self) -> RateLimitConfig {
        // Tradier market data allows 120 req/min; stay well under it.
        RateLimitConfig {
            max_tokens: 10,
            refill_amount: 10,
            refill_interval_ms: 10_000,
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        let url = format!("{}/markets/quotes?symbols={}", self.base_url, symbol);
        let body = self.get_json(&url).await?;

        let quote = body
            .pointer("/quotes/quote")
            .ok_or_else(|| self.bad_response("missing quotes.quote"))?;
        let last = quote
            .get("last")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| self.bad_response("missing last price"))?;

        debug!(symbol, last, "tradier quote");
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price: dec_from(last, "tradier", "last")?,
            open: dec_opt(quote.get("open").and_then(|v| v.as_f64())),
            high: dec_opt(quote.get("high").and_then(|v| v.as_f64())),
            low: dec_opt(quote.get("low").and_then(|v| v.as_f64())),
            volume: quote.get("volume").and_then(|v| v.as_u64()),
            bid: dec_opt(quote.get("bid").and_then(|v| v.as_f64())),
            ask: dec_opt(quote.get("ask").and_then(|v| v.as_f64())),
            timestamp: Utc::now(),
            provider: "tradier".into(),
        })
    }

    async fn fetch_chain(&self, symbol: &str) -> Result<OptionChain, ProviderError> {
        // Nearest listed expiration first.
        let url = format!(
            "{}/markets/options/expirations?symbol={}",
            self.base_url, symbol
        );
        let body = self.get_json(&url).await?;
        let expiration = body
            .pointer("/expirations/date")
            .and_then(|v| v.as_array())
            .and_then(|dates| dates.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| self.bad_response("no expirations listed"))?
            .to_string();

        let url = format!(
            "{}/markets/options/chains?symbol={}&expiration={}&greeks=true",
            self.base_url, symbol, expiration
        );
        let body = self.get_json(&url).await?;
        let options = body
            .pointer("/options/option")
            .and_then(|v| v.as_array())
            .ok_or_else(|| self.bad_response("missing options.option"))?;

        let spot = self.fetch_quote(symbol).await?.price;
        let mut contracts = Vec::with_capacity(options.len());
        for opt in options {
            let strike = opt.get("strike").and_then(|v| v.as_f64());
            let right = match opt.get("option_type").and_then(|v| v.as_str()) {
                Some("call") => Some(Direction::Call),
                Some("put") => Some(Direction::Put),
                _ => None,
            };
            let expiration = opt
                .get("expiration_date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
            let (Some(strike), Some(right), Some(expiration)) = (strike, right, expiration) else {
                continue;
            };
            contracts.push(OptionContract {
                strike: dec_from(strike, "tradier", "strike")?,
                right,
                expiration,
                gamma: opt
                    .pointer("/greeks/gamma")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0),
                open_interest: opt.get("open_interest").and_then(|v| v.as_u64()).unwrap_or(0),
                volume: opt.get("volume").and_then(|v| v.as_u64()).unwrap_or(0),
                implied_volatility: opt.pointer("/greeks/mid_iv").and_then(|v| v.as_f64()),
            });
        }

        if contracts.is_empty() {
            return Err(self.bad_response("empty option chain"));
        }

        Ok(OptionChain {
            symbol: symbol.to_uppercase(),
            spot,
            contracts,
            provider: "tradier".into(),
            timestamp: Utc::now(),
        })
    }
}

// =============================================================================
// Alpaca
// =============================================================================

pub struct AlpacaProvider {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl AlpacaProvider {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: "https://data.alpaca.markets/v2".to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl QuoteProvider for AlpacaProvider {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    fn rate_config(&self) -> RateLimitConfig {
        // Alpaca free tier: 200 req/min.
        RateLimitConfig {
            max_tokens: 20,
            refill_amount: 20,
            refill_interval_ms: 6_000,
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        let url = format!("{}/stocks/{}/snapshot", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: "alpaca".into(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Request {
                provider: "alpaca".into(),
                message: format!("HTTP {status}"),
            });
        }

        let body: serde_json::Value =
            resp.json().await.map_err(|e| ProviderError::BadResponse {
                provider: "alpaca".into(),
                message: e.to_string(),
            })?;

        let last = body
            .pointer("/latestTrade/p")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ProviderError::BadResponse {
                provider: "alpaca".into(),
                message: "missing latestTrade.p".into(),
            })?;

        debug!(symbol, last, "alpaca quote");
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price: dec_from(last, "alpaca", "latestTrade.p")?,
            open: dec_opt(body.pointer("/dailyBar/o").and_then(|v| v.as_f64())),
            high: dec_opt(body.pointer("/dailyBar/h").and_then(|v| v.as_f64())),
            low: dec_opt(body.pointer("/dailyBar/l").and_then(|v| v.as_f64())),
            volume: body.pointer("/dailyBar/v").and_then(|v| v.as_u64()),
            bid: dec_opt(body.pointer("/latestQuote/bp").and_then(|v| v.as_f64())),
            ask: dec_opt(body.pointer("/latestQuote/ap").and_then(|v| v.as_f64())),
            timestamp: Utc::now(),
            provider: "alpaca".into(),
        })
    }
}

// =============================================================================
// Polygon
// =============================================================================

pub struct PolygonProvider {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl PolygonProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.polygon.io".to_string(),
            client: http_client(),
        }
    }
}

#[async_trait]
impl QuoteProvider for PolygonProvider {
    fn name(&self) -> &'static str {
        "polygon"
    }

    fn rate_config(&self) -> RateLimitConfig {
        // Polygon free tier: 5 req/min.
        RateLimitConfig {
            max_tokens: 5,
            refill_amount: 5,
            refill_interval_ms: 60_000,
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/prev?apiKey={}",
            self.base_url, symbol, self.api_key
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: "polygon".into(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Request {
                provider: "polygon".into(),
                message: format!("HTTP {status}"),
            });
        }

        let body: serde_json::Value =
            resp.json().await.map_err(|e| ProviderError::BadResponse {
                provider: "polygon".into(),
                message: e.to_string(),
            })?;

        let bar = body
            .pointer("/results/0")
            .ok_or_else(|| ProviderError::BadResponse {
                provider: "polygon".into(),
                message: "empty results".into(),
            })?;
        let close = bar.get("c").and_then(|v| v.as_f64()).ok_or_else(|| {
            ProviderError::BadResponse {
                provider: "polygon".into(),
                message: "missing close".into(),
            }
        })?;

        debug!(symbol, close, "polygon quote");
        Ok(Quote {
            symbol: symbol.to_uppercase(),
            price: dec_from(close, "polygon", "close")?,
            open: dec_opt(bar.get("o").and_then(|v| v.as_f64())),
            high: dec_opt(bar.get("h").and_then(|v| v.as_f64())),
            low: dec_opt(bar.get("l").and_then(|v| v.as_f64())),
            volume: bar.get("v").and_then(|v| v.as_u64()),
            bid: None,
            ask: None,
            timestamp: Utc::now(),
            provider: "polygon".into(),
        })
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .expect("failed to build reqwest client")
}

// =============================================================================
// Demo source
// =============================================================================

/// Seeded base-price table for the demo fallback.
const DEMO_BASE_PRICES: &[(&str, f64)] = &[
    ("SPY", 500.25),
    ("QQQ", 430.10),
    ("IWM", 198.40),
    ("DIA", 392.80),
    ("AAPL", 190.30),
    ("MSFT", 415.70),
    ("NVDA", 120.45),
    ("TSLA", 250.60),
    ("AMZN", 178.90),
    ("VIX", 16.50),
];

const DEMO_DEFAULT_PRICE: f64 = 100.0;

fn demo_base_price(symbol: &str) -> f64 {
    DEMO_BASE_PRICES
        .iter()
        .find(|(sym, _)| *sym == symbol)
        .map(|(_, price)| *price)
        .unwrap_or(DEMO_DEFAULT_PRICE)
}

fn demo_seed(symbol: &str, bucket: i64) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    bucket.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic demo quote: ±0.5 % jitter around the seeded table, stable
/// within a one-minute bucket so repeated calls agree.
pub fn demo_quote(symbol: &str, now: DateTime<Utc>) -> Quote {
    let symbol = symbol.to_uppercase();
    let base = demo_base_price(&symbol);
    let bucket = now.timestamp() / 60;
    let mut rng = StdRng::seed_from_u64(demo_seed(&symbol, bucket));

    let jitter: f64 = rng.gen_range(-0.005..=0.005);
    let price = base * (1.0 + jitter);
    let spread = price * 0.0005;

    let price_dec = Decimal::from_f64(price).unwrap_or(dec!(100)).round_dp(2);

    Quote {
        symbol,
        price: price_dec,
        open: Decimal::from_f64(base).map(|d| d.round_dp(2)),
        high: Decimal::from_f64(price.max(base)).map(|d| d.round_dp(2)),
        low: Decimal::from_f64(price.min(base)).map(|d| d.round_dp(2)),
        volume: Some(rng.gen_range(1_000_000..50_000_000)),
        bid: Decimal::from_f64(price - spread).map(|d| d.round_dp(2)),
        ask: Decimal::from_f64(price + spread).map(|d| d.round_dp(2)),
        timestamp: now,
        provider: "demo".into(),
    }
}

/// Synthesize a plausible option chain around the demo spot for GEX
/// analytics when no provider carries greeks.
pub fn demo_chain(symbol: &str, now: DateTime<Utc>) -> OptionChain {
    let quote = demo_quote(symbol, now);
    let spot = quote.price;
    let spot_f = demo_base_price(&quote.symbol);

    let increment = if spot_f < 25.0 {
        2.5
    } else if spot_f < 200.0 {
        5.0
    } else {
        10.0
    };

    // Next Friday (or a week out if today is Friday).
    let today = now.date_naive();
    let days_ahead = (chrono::Weekday::Fri.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    let expiration = today + ChronoDuration::days(if days_ahead == 0 { 7 } else { days_ahead });

    let mut rng = StdRng::seed_from_u64(demo_seed(&quote.symbol, now.timestamp() / 60) ^ 0x6368);
    let mut contracts = Vec::new();
    let atm = (spot_f / increment).round() * increment;

    for i in -10i32..=10 {
        let strike = atm + f64::from(i) * increment;
        if strike <= 0.0 {
            continue;
        }
        // Gamma concentrates at the money; a simple kernel is enough for
        // regime classification.
        let distance = (strike - spot_f) / (0.05 * spot_f);
        let gamma = 0.08 * (-distance * distance).exp();

        for right in [Direction::Call, Direction::Put] {
            let skew = match right {
                Direction::Call if strike >= atm => 1.3,
                Direction::Put if strike <= atm => 1.3,
                _ => 0.8,
            };
            let open_interest = ((rng.gen_range(2_000.0..15_000.0)) * skew) as u64;
            contracts.push(OptionContract {
                strike: Decimal::from_f64(strike).unwrap_or_default().round_dp(2),
                right,
                expiration,
                gamma,
                open_interest,
                volume: rng.gen_range(100..8_000),
                implied_volatility: Some(rng.gen_range(0.15..0.45)),
            });
        }
    }

    OptionChain {
        symbol: quote.symbol,
        spot,
        contracts,
        provider: "demo".into(),
        timestamp: now,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_quote_is_deterministic_within_bucket() {
        let now = Utc::now();
        let a = demo_quote("SPY", now);
        let b = demo_quote("SPY", now);
        assert_eq!(a.price, b.price);
        assert_eq!(a.provider, "demo");
    }

    #[test]
    fn demo_quote_jitter_is_bounded() {
        let now = Utc::now();
        for symbol in ["SPY", "QQQ", "UNKNOWN"] {
            let quote = demo_quote(symbol, now);
            let base = Decimal::from_f64(demo_base_price(&symbol.to_uppercase())).unwrap();
            let deviation = ((quote.price - base) / base).abs();
            assert!(
                deviation <= dec!(0.0051),
                "{symbol} deviated {deviation} from base"
            );
        }
    }

    #[test]
    fn unknown_symbol_uses_default_base() {
        let quote = demo_quote("ZZZZ", Utc::now());
        assert!(quote.price > dec!(99) && quote.price < dec!(101));
    }

    #[test]
    fn demo_chain_has_both_rights_and_future_expiry() {
        let now = Utc::now();
        let chain = demo_chain("SPY", now);
        assert!(!chain.contracts.is_empty());
        assert!(chain.contracts.iter().any(|c| c.right == Direction::Call));
        assert!(chain.contracts.iter().any(|c| c.right == Direction::Put));
        for contract in &chain.contracts {
            assert!(contract.expiration > now.date_naive());
            assert!(contract.gamma >= 0.0);
        }
    }

    #[test]
    fn provider_rate_configs_are_sane() {
        let tradier = TradierProvider::new("key");
        let cfg = tradier.rate_config();
        assert!(cfg.max_tokens > 0 && cfg.refill_amount > 0);

        let polygon = PolygonProvider::new("key");
        assert_eq!(polygon.rate_config().max_tokens, 5);
    }
}
