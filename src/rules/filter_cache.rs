// Symbol Filter Cache
// Whole-set trading rules with a TTL, refreshed single-flight

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::types::normalize_symbol;
use crate::layer1::collaborators::TradingRulesProvider;
use crate::rules::types::SymbolTradingRules;

/// One complete rule set as returned by a single refresh
#[derive(Debug)]
struct RuleSet {
    rules: HashMap<String, Arc<SymbolTradingRules>>,
    fetched_at_ms: u64,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum RulesLookup {
    Found(Arc<SymbolTradingRules>),
    /// Rules are loaded but the symbol is not listed
    UnknownSymbol,
    /// No rule set has ever been loaded
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct FilterCacheStats {
    pub symbols: usize,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub age_ms: Option<u64>,
}

/// Process-lifetime cache of per-symbol filters.
///
/// Readers take the current `Arc<RuleSet>`; a refresh swaps in a new set wholesale.
pub struct SymbolFilterCache {
    source: Arc<dyn TradingRulesProvider>,
    clock: Arc<dyn Clock>,
    ttl: Duration,

    current: RwLock<Option<Arc<RuleSet>>>,
    refresh_lock: Mutex<()>,

    // Completed refresh attempts, successful or not
    attempts: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl SymbolFilterCache {
    pub fn new(source: Arc<dyn TradingRulesProvider>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            attempts: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Look up rules for `symbol`, refreshing first if the cache is empty or stale
    pub async fn rules_for(&self, symbol: &str) -> RulesLookup {
        if self.is_stale() {
            self.refresh_if_stale().await;
        }

        let current = self.current.read().clone();
        match current {
            Some(set) => match set.rules.get(&normalize_symbol(symbol)) {
                Some(rules) => RulesLookup::Found(Arc::clone(rules)),
                None => RulesLookup::UnknownSymbol,
            },
            None => RulesLookup::Unavailable(
                self.last_error
                    .read()
                    .clone()
                    .unwrap_or_else(|| "trading rules never loaded".to_string()),
            ),
        }
    }

    pub fn is_stale(&self) -> bool {
        match self.current.read().as_ref() {
            Some(set) => {
                let age = self.clock.now_ms().saturating_sub(set.fetched_at_ms);
                age > self.ttl.as_millis() as u64
            }
            None => true,
        }
    }

    /// Refresh unless another caller finished a refresh while we waited for the lock.
    ///
    /// Concurrent callers share one request: whoever gets the lock first fetches,
    /// the rest observe that an attempt completed and reuse its outcome.
    pub async fn refresh_if_stale(&self) {
        let seen_attempts = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;

        if self.attempts.load(Ordering::Acquire) != seen_attempts {
            debug!("Trading rules refreshed by a concurrent caller");
            return;
        }
        if !self.is_stale() {
            return;
        }

        self.refresh_locked().await;
    }

    /// Unconditional refresh (still single-flight)
    pub async fn refresh(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await;
    }

    async fn refresh_locked(&self) {
        match self.source.fetch_trading_rules().await {
            Ok(rules) => {
                let symbols = rules.len();
                let set = RuleSet {
                    rules: rules
                        .into_iter()
                        .map(|(symbol, rules)| (symbol, Arc::new(rules)))
                        .collect(),
                    fetched_at_ms: self.clock.now_ms(),
                };
                *self.current.write() = Some(Arc::new(set));
                *self.last_error.write() = None;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                info!(symbols = symbols, "Trade rules updated");
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                *self.last_error.write() = Some(e.to_string());
                let has_previous = self.current.read().is_some();
                warn!(error = %e, keeping_previous = has_previous, "Trade rules refresh failed");
            }
        }
        self.attempts.fetch_add(1, Ordering::Release);
    }

    pub fn get_stats(&self) -> FilterCacheStats {
        let current = self.current.read();
        FilterCacheStats {
            symbols: current.as_ref().map(|set| set.rules.len()).unwrap_or(0),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            age_ms: current
                .as_ref()
                .map(|set| self.clock.now_ms().saturating_sub(set.fetched_at_ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::layer1::collaborators::TransportError;
    use crate::layer1::rest_client::RestClientError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct CountingSource {
        calls: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                delay,
            }
        }
    }

    #[async_trait]
    impl TradingRulesProvider for CountingSource {
        async fn fetch_trading_rules(&self) -> Result<HashMap<String, SymbolTradingRules>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(RestClientError::Api { code: 500, message: "down".to_string() }.into());
            }
            let mut rules = HashMap::new();
            rules.insert("BTCTRY".to_string(), SymbolTradingRules::new("BTC_TRY"));
            Ok(rules)
        }
    }

    fn cache_with(source: Arc<CountingSource>, clock: Arc<ManualClock>) -> SymbolFilterCache {
        SymbolFilterCache::new(source, clock, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_first_lookup_loads_rules() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let cache = cache_with(source.clone(), Arc::new(ManualClock::new(0)));

        assert!(matches!(cache.rules_for("btc_try").await, RulesLookup::Found(_)));
        assert_eq!(cache.rules_for("ETHTRY").await, RulesLookup::UnknownSymbol);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookups_share_one_rule_allocation() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let cache = cache_with(source, Arc::new(ManualClock::new(0)));

        let (RulesLookup::Found(first), RulesLookup::Found(second)) =
            (cache.rules_for("BTCTRY").await, cache.rules_for("btc_try").await)
        else {
            panic!("rules should be found");
        };
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_refreshes_only_after_ttl() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(source.clone(), clock.clone());

        cache.rules_for("BTCTRY").await;
        clock.advance(Duration::from_secs(30));
        cache.rules_for("BTCTRY").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(31));
        assert!(cache.is_stale());
        cache.rules_for("BTCTRY").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_stale_callers_share_one_refresh() {
        let source = Arc::new(CountingSource::new(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(source.clone(), Arc::new(ManualClock::new(0))));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.rules_for("BTCTRY").await }));
        }
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), RulesLookup::Found(_)));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_first_refresh_is_unavailable() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        source.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(source.clone(), Arc::new(ManualClock::new(0)));

        match cache.rules_for("BTCTRY").await {
            RulesLookup::Unavailable(reason) => assert!(reason.contains("down")),
            other => panic!("unexpected lookup {:?}", other),
        }
        assert_eq!(cache.get_stats().refresh_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_with(source.clone(), clock.clone());

        cache.rules_for("BTCTRY").await;
        source.fail.store(true, Ordering::SeqCst);
        clock.advance(Duration::from_secs(120));

        assert!(matches!(cache.rules_for("BTCTRY").await, RulesLookup::Found(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
