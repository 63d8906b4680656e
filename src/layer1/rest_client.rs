// REST Client for the Binance TR public API - Pure Rust
// Rate-limited HTTP client with retry logic; backs the snapshot, rules and time collaborators

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::config::{ExchangeConfig, SNAPSHOT_LIMITS};
use crate::core::types::{normalize_symbol, DepthSnapshot};
use crate::layer1::collaborators::{
    ServerTimeSource, SnapshotProvider, TradingRulesProvider, TransportError,
};
use crate::layer2::parser::{self, ParseError};
use crate::rules::types::SymbolTradingRules;

const SYMBOLS_ENDPOINT: &str = "/open/v1/common/symbols";
const TIME_ENDPOINT: &str = "/open/v1/common/time";
const DEPTH_ENDPOINT: &str = "/api/v3/depth";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Max retries exceeded")]
    MaxRetries,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed payload: {0}")]
    Payload(#[from] ParseError),
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Token bucket rate limiter for API requests
/// Note: This struct is used behind Arc<Mutex<RateLimiter>>, so no internal lock needed.
pub struct RateLimiter {
    tokens: f64,
    pub max_tokens: f64,
    rate_per_sec: f64,
    last_update: f64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let rpm = requests_per_minute as f64;
        Self {
            tokens: rpm,
            max_tokens: rpm,
            rate_per_sec: rpm / 60.0,
            last_update: now_secs(),
        }
    }

    /// Wait until a token is available (caller must hold the Mutex)
    pub async fn acquire(&mut self) {
        loop {
            self.add_tokens();

            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn add_tokens(&mut self) {
        let now = now_secs();
        let elapsed = now - self.last_update;
        let tokens_to_add = elapsed * self.rate_per_sec;
        self.tokens = (self.tokens + tokens_to_add).min(self.max_tokens);
        self.last_update = now;
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub success_rate: f64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, retries={}, rate={:.2}%)",
            self.requests_sent, self.requests_succeeded, self.requests_failed,
            self.retries, self.success_rate * 100.0
        )
    }
}

// ============================================================================
// Binance TR REST Client
// ============================================================================

/// Public REST client for Binance TR
///
/// Two hosts are involved: the main host serves the `/open/v1` endpoints
/// (symbols, time) wrapped in a `{code,msg,data}` envelope, the "next" host
/// serves the plain Binance depth endpoint.
pub struct BinanceRestClient {
    main_url: String,
    next_url: String,
    max_retries: u32,

    client: Client,
    request_limiter: Arc<Mutex<RateLimiter>>,

    // Stats
    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
}

impl BinanceRestClient {
    pub fn new(
        main_url: &str,
        next_url: &str,
        requests_per_minute: u32,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Result<Self, RestClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            main_url: main_url.trim_end_matches('/').to_string(),
            next_url: next_url.trim_end_matches('/').to_string(),
            max_retries,
            client,
            request_limiter: Arc::new(Mutex::new(RateLimiter::new(requests_per_minute))),
            requests_sent: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    /// Create from config
    pub fn from_config(config: &ExchangeConfig) -> Result<Self, RestClientError> {
        Self::new(
            &config.rest_main_url,
            &config.rest_next_url,
            config.requests_per_minute,
            config.request_timeout_seconds,
            config.max_request_retries,
        )
    }

    /// GET with rate limiting and retries
    async fn get(&self, url: &str, params: &HashMap<String, String>) -> Result<Value, RestClientError> {
        self.request_limiter.lock().await.acquire().await;

        for attempt in 0..=self.max_retries {
            self.requests_sent.fetch_add(1, Ordering::Relaxed);

            match self.client.get(url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    let data: Value = response.json().await?;

                    if status == StatusCode::OK {
                        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                        return Ok(data);
                    }

                    let error_code = data.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                    let error_msg = data
                        .get("msg")
                        .and_then(|m| m.as_str())
                        .unwrap_or("Unknown error")
                        .to_string();

                    // 4xx other than rate limiting will not get better on retry
                    let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if retryable && attempt < self.max_retries {
                        let delay = 2u64.pow(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_retries = self.max_retries + 1,
                            status = status.as_u16(),
                            error_code = error_code,
                            error_msg = %error_msg,
                            delay_secs = delay,
                            "Request failed, retrying"
                        );
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }

                    self.requests_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(RestClientError::Api { code: error_code, message: error_msg });
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = 2u64.pow(attempt);
                        warn!(
                            attempt = attempt + 1,
                            error = %e,
                            delay_secs = delay,
                            "Network error, retrying"
                        );
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        continue;
                    }

                    self.requests_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(RestClientError::Http(e));
                }
            }
        }

        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        Err(RestClientError::MaxRetries)
    }

    /// GET on the main host, unwrapping the `{code,msg,data}` envelope
    async fn get_main(&self, endpoint: &str) -> Result<Value, RestClientError> {
        let url = format!("{}{}", self.main_url, endpoint);
        let body = self.get(&url, &HashMap::new()).await?;
        unwrap_envelope(body)
    }

    // ========================================================================
    // Market Data Endpoints (Public)
    // ========================================================================

    /// Order book snapshot from the next host
    pub async fn get_order_book(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, RestClientError> {
        validate_limit(limit)?;

        let mut params = HashMap::new();
        params.insert("symbol".to_string(), normalize_symbol(symbol));
        params.insert("limit".to_string(), limit.to_string());

        let url = format!("{}{}", self.next_url, DEPTH_ENDPOINT);
        let data = self.get(&url, &params).await?;
        let snapshot = parser::parse_depth_snapshot(symbol, &data)?;
        debug!(
            symbol = symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Fetched order book snapshot"
        );
        Ok(snapshot)
    }

    /// Trading rules for every listed symbol
    pub async fn get_symbols(&self) -> Result<HashMap<String, SymbolTradingRules>, RestClientError> {
        let data = self.get_main(SYMBOLS_ENDPOINT).await?;
        Ok(parser::parse_symbol_rules(&data)?)
    }

    /// Server time in milliseconds
    pub async fn get_server_time(&self) -> Result<u64, RestClientError> {
        let url = format!("{}{}", self.main_url, TIME_ENDPOINT);
        let body = self.get(&url, &HashMap::new()).await?;
        check_envelope_code(&body)?;
        Ok(parser::parse_server_time(&body)?)
    }

    /// Get client statistics
    pub fn get_stats(&self) -> RestClientStats {
        let sent = self.requests_sent.load(Ordering::Relaxed);
        let succeeded = self.requests_succeeded.load(Ordering::Relaxed);

        RestClientStats {
            requests_sent: sent,
            requests_succeeded: succeeded,
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            success_rate: if sent > 0 { succeeded as f64 / sent as f64 } else { 0.0 },
        }
    }
}

fn validate_limit(limit: u32) -> Result<(), RestClientError> {
    if SNAPSHOT_LIMITS.contains(&limit) {
        Ok(())
    } else {
        Err(RestClientError::InvalidRequest(format!(
            "limit {} not one of {:?}",
            limit, SNAPSHOT_LIMITS
        )))
    }
}

fn check_envelope_code(body: &Value) -> Result<(), RestClientError> {
    let code = body.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    if code != 0 {
        let message = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        return Err(RestClientError::Api { code, message });
    }
    Ok(())
}

/// Returns `data` from a successful envelope; a non-zero `code` is an API error
fn unwrap_envelope(mut body: Value) -> Result<Value, RestClientError> {
    check_envelope_code(&body)?;
    match body.get_mut("data") {
        Some(data) => Ok(data.take()),
        None => Err(ParseError::MissingField("data".into()).into()),
    }
}

// ============================================================================
// Collaborator implementations
// ============================================================================

#[async_trait]
impl SnapshotProvider for BinanceRestClient {
    async fn fetch_order_book_snapshot(
        &self,
        symbol: &str,
        depth_limit: u32,
    ) -> Result<DepthSnapshot, TransportError> {
        Ok(self.get_order_book(symbol, depth_limit).await?)
    }
}

#[async_trait]
impl TradingRulesProvider for BinanceRestClient {
    async fn fetch_trading_rules(&self) -> Result<HashMap<String, SymbolTradingRules>, TransportError> {
        Ok(self.get_symbols().await?)
    }
}

#[async_trait]
impl ServerTimeSource for BinanceRestClient {
    async fn server_time_ms(&self) -> Result<u64, TransportError> {
        Ok(self.get_server_time().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(1200);
        assert_eq!(limiter.max_tokens, 1200.0);
        assert_eq!(limiter.available(), 1200.0);
    }

    #[tokio::test]
    async fn test_rate_limiter_consumes_tokens() {
        let mut limiter = RateLimiter::new(60);
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(limiter.available() < 59.0);
    }

    #[test]
    fn test_client_creation_from_config() {
        let config = ExchangeConfig::default();
        let client = BinanceRestClient::from_config(&config);
        assert!(client.is_ok());
    }

    #[test]
    fn test_validate_limit() {
        assert!(validate_limit(5000).is_ok());
        assert!(validate_limit(5).is_ok());
        assert!(matches!(validate_limit(42), Err(RestClientError::InvalidRequest(_))));
    }

    #[test]
    fn test_unwrap_envelope() {
        let data = unwrap_envelope(json!({"code": 0, "msg": "success", "data": {"list": []}})).unwrap();
        assert!(data.get("list").is_some());

        match unwrap_envelope(json!({"code": 3210, "msg": "symbol not found"})) {
            Err(RestClientError::Api { code, message }) => {
                assert_eq!(code, 3210);
                assert_eq!(message, "symbol not found");
            }
            other => panic!("unexpected result {:?}", other),
        }

        assert!(matches!(
            unwrap_envelope(json!({"code": 0})),
            Err(RestClientError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_limit_fails_before_request() {
        let client = BinanceRestClient::from_config(&ExchangeConfig::default()).unwrap();
        let result = client.get_order_book("BTC_TRY", 7).await;
        assert!(matches!(result, Err(RestClientError::InvalidRequest(_))));
        assert_eq!(client.get_stats().requests_sent, 0);
    }

    #[test]
    fn test_stats_initial() {
        let client = BinanceRestClient::from_config(&ExchangeConfig::default()).unwrap();
        let stats = client.get_stats();
        assert_eq!(stats.requests_sent, 0);
        assert_eq!(stats.requests_succeeded, 0);
        assert_eq!(stats.requests_failed, 0);
        assert_eq!(stats.success_rate, 0.0);
    }
}
