// Configuration Management
// JSON file + environment overrides, validated before use

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::rules::TradeRulesBehaviour;

/// Depth limits accepted by the REST depth endpoint
pub const SNAPSHOT_LIMITS: [u32; 8] = [5, 10, 20, 50, 100, 500, 1000, 5000];
/// Level counts offered by the fixed-depth stream
pub const FIXED_DEPTH_LEVELS: [u16; 3] = [5, 10, 20];
/// Stream update intervals in milliseconds
pub const UPDATE_INTERVALS_MS: [u32; 2] = [100, 1000];

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Host of the `/open/v1` endpoints (symbols, server time)
    pub rest_main_url: String,
    /// Host of the `/api/v3` endpoints (depth)
    pub rest_next_url: String,
    pub stream_url: String,

    pub request_timeout_seconds: u64,
    pub requests_per_minute: u32,
    pub max_request_retries: u32,

    pub ws_ping_interval_secs: u64,
    pub ws_health_check_interval_secs: u64,
    pub ws_stale_timeout_secs: u64,
    pub ws_max_reconnect_attempts: u32,
    pub ws_subscribe_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_main_url: "https://www.trbinance.com".to_string(),
            rest_next_url: "https://api.binance.me".to_string(),
            stream_url: "wss://stream-cloud.trbinance.com".to_string(),
            request_timeout_seconds: 10,
            requests_per_minute: 1200,
            max_request_retries: 3,
            ws_ping_interval_secs: 20,
            ws_health_check_interval_secs: 30,
            ws_stale_timeout_secs: 60,
            ws_max_reconnect_attempts: 10,
            ws_subscribe_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    /// Pause between subscription confirmation and the snapshot request
    pub settle_interval_ms: u64,
    pub snapshot_limit: u32,
    /// Bound on waiting for a fixed-depth baseline (start and resync)
    pub baseline_timeout_secs: u64,
    pub update_interval_ms: Option<u32>,
    pub buffer_capacity: usize,
    /// Resyncs allowed without a clean live update in between
    pub max_consecutive_resyncs: u32,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            settle_interval_ms: 200,
            snapshot_limit: 5000,
            baseline_timeout_secs: 10,
            update_interval_ms: None,
            buffer_capacity: 10_000,
            max_consecutive_resyncs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeRulesConfig {
    pub behaviour: TradeRulesBehaviour,
    pub update_interval_secs: u64,
}

impl Default for TradeRulesConfig {
    fn default() -> Self {
        Self {
            behaviour: TradeRulesBehaviour::None,
            update_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    pub enabled: bool,
    pub recalculation_interval_secs: u64,
    pub samples: u32,
    /// Offsets in `[0, no_adjust_below_ms)` are treated as network latency and ignored
    pub no_adjust_below_ms: f64,
    pub drift_threshold_ms: f64,
    pub manual_offset_ms: f64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recalculation_interval_secs: 3 * 3600,
            samples: 3,
            no_adjust_below_ms: 500.0,
            drift_threshold_ms: 1000.0,
            manual_offset_ms: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_format: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_format: false,
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub exchange: ExchangeConfig,
    pub order_book: OrderBookConfig,
    pub trade_rules: TradeRulesConfig,
    pub time_sync: TimeSyncConfig,
    pub monitoring: MonitoringConfig,
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub rest_main_url: String,
    pub stream_url: String,
    pub trade_rules: TradeRulesBehaviour,
    pub snapshot_limit: u32,
    pub time_sync_enabled: bool,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    config: Arc<RwLock<ClientConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let manager = Self {
            config: Arc::new(RwLock::new(ClientConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Load configuration from a JSON file. A missing file keeps the defaults.
    pub fn load_from_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let parsed: ClientConfig = serde_json::from_str(&content)?;
        *self.config.write() = parsed;

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Apply environment overrides on top of whatever is loaded
    pub fn load_from_env(&self) {
        let mut config = self.config.write();

        if let Ok(url) = std::env::var("BINANCE_TR_REST_URL") {
            config.exchange.rest_main_url = url;
        }
        if let Ok(url) = std::env::var("BINANCE_TR_STREAM_URL") {
            config.exchange.stream_url = url;
        }
        if let Ok(value) = std::env::var("BINANCE_TR_TRADE_RULES") {
            match value.parse::<TradeRulesBehaviour>() {
                Ok(behaviour) => config.trade_rules.behaviour = behaviour,
                Err(e) => warn!(value = %value, error = %e, "Ignoring BINANCE_TR_TRADE_RULES"),
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.monitoring.log_level = level;
        }
    }

    /// Save configuration to a JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        if let Some(parent) = Path::new(config_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&*self.config.read())?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Returns every problem found; an empty list means the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let config = self.config.read();
        let mut errors = Vec::new();

        if !SNAPSHOT_LIMITS.contains(&config.order_book.snapshot_limit) {
            errors.push(format!(
                "order_book.snapshot_limit must be one of {:?}",
                SNAPSHOT_LIMITS
            ));
        }
        if let Some(interval) = config.order_book.update_interval_ms {
            if !UPDATE_INTERVALS_MS.contains(&interval) {
                errors.push(format!(
                    "order_book.update_interval_ms must be one of {:?}",
                    UPDATE_INTERVALS_MS
                ));
            }
        }
        if config.order_book.buffer_capacity == 0 {
            errors.push("order_book.buffer_capacity must be positive".to_string());
        }
        if config.order_book.baseline_timeout_secs == 0 {
            errors.push("order_book.baseline_timeout_secs must be positive".to_string());
        }
        if config.exchange.requests_per_minute == 0 {
            errors.push("exchange.requests_per_minute must be positive".to_string());
        }
        // Zero periods would panic in tokio::time::interval
        if config.exchange.ws_ping_interval_secs == 0 {
            errors.push("exchange.ws_ping_interval_secs must be positive".to_string());
        }
        if config.exchange.ws_health_check_interval_secs == 0 {
            errors.push("exchange.ws_health_check_interval_secs must be positive".to_string());
        }
        if config.exchange.ws_subscribe_timeout_secs == 0 {
            errors.push("exchange.ws_subscribe_timeout_secs must be positive".to_string());
        }
        if config.time_sync.enabled {
            if config.time_sync.samples == 0 {
                errors.push("time_sync.samples must be positive".to_string());
            }
            if config.time_sync.recalculation_interval_secs == 0 {
                errors.push("time_sync.recalculation_interval_secs must be positive".to_string());
            }
        }

        for error in &errors {
            warn!(error = %error, "Config validation error");
        }
        if errors.is_empty() {
            info!("Configuration validated successfully");
        }
        errors
    }

    /// Like `validate`, but folds the problems into one error
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let config = self.config.read();
        ConfigSummary {
            rest_main_url: config.exchange.rest_main_url.clone(),
            stream_url: config.exchange.stream_url.clone(),
            trade_rules: config.trade_rules.behaviour,
            snapshot_limit: config.order_book.snapshot_limit,
            time_sync_enabled: config.time_sync.enabled,
            log_level: config.monitoring.log_level.clone(),
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.config.read().clone()
    }

    pub fn exchange(&self) -> ExchangeConfig {
        self.config.read().exchange.clone()
    }

    pub fn order_book(&self) -> OrderBookConfig {
        self.config.read().order_book.clone()
    }

    pub fn trade_rules(&self) -> TradeRulesConfig {
        self.config.read().trade_rules.clone()
    }

    pub fn time_sync(&self) -> TimeSyncConfig {
        self.config.read().time_sync.clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.config.read().monitoring.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let config = ClientConfig::default();
        assert_eq!(config.exchange.rest_main_url, "https://www.trbinance.com");
        assert_eq!(config.exchange.rest_next_url, "https://api.binance.me");
        assert_eq!(config.order_book.settle_interval_ms, 200);
        assert_eq!(config.order_book.snapshot_limit, 5000);
        assert_eq!(config.order_book.baseline_timeout_secs, 10);
        assert_eq!(config.trade_rules.behaviour, TradeRulesBehaviour::None);
        assert_eq!(config.trade_rules.update_interval_secs, 3600);
    }

    #[test]
    fn test_default_config_is_valid() {
        let manager = ConfigManager::from_config(ClientConfig::default());
        assert!(manager.validate().is_empty());
        assert!(manager.ensure_valid().is_ok());
    }

    #[test]
    fn test_validation_reports_each_problem() {
        let mut config = ClientConfig::default();
        config.order_book.snapshot_limit = 42;
        config.order_book.update_interval_ms = Some(250);
        let manager = ConfigManager::from_config(config);

        let errors = manager.validate();
        assert_eq!(errors.len(), 2);
        assert!(matches!(manager.ensure_valid(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_zero_intervals() {
        let mut config = ClientConfig::default();
        config.exchange.ws_ping_interval_secs = 0;
        config.exchange.ws_health_check_interval_secs = 0;
        config.exchange.ws_subscribe_timeout_secs = 0;
        config.time_sync.enabled = true;
        config.time_sync.recalculation_interval_secs = 0;
        let manager = ConfigManager::from_config(config);

        let errors = manager.validate();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.starts_with("exchange.ws_ping_interval_secs")));
        assert!(errors.iter().any(|e| e.starts_with("exchange.ws_health_check_interval_secs")));
        assert!(errors.iter().any(|e| e.starts_with("exchange.ws_subscribe_timeout_secs")));
        assert!(errors.iter().any(|e| e.starts_with("time_sync.recalculation_interval_secs")));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"trade_rules":{"behaviour":"auto_clamp"},"order_book":{"snapshot_limit":1000}}"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.trade_rules.behaviour, TradeRulesBehaviour::AutoClamp);
        assert_eq!(config.trade_rules.update_interval_secs, 3600);
        assert_eq!(config.order_book.snapshot_limit, 1000);
        assert_eq!(config.order_book.settle_interval_ms, 200);
    }

    #[test]
    fn test_missing_file_keeps_defaults() {
        let manager = ConfigManager::new(Some("/nonexistent/binance_tr.json")).unwrap();
        assert_eq!(manager.order_book().buffer_capacity, 10_000);
    }

    #[test]
    fn test_save_and_reload() {
        let path = std::env::temp_dir().join(format!("binance_tr_cfg_{}.json", std::process::id()));
        let path_str = path.to_string_lossy().to_string();

        let mut config = ClientConfig::default();
        config.order_book.max_consecutive_resyncs = 7;
        ConfigManager::from_config(config).save_to_file(&path_str).unwrap();

        let reloaded = ConfigManager::from_config(ClientConfig::default());
        reloaded.load_from_file(&path_str).unwrap();
        assert_eq!(reloaded.order_book().max_consecutive_resyncs, 7);

        let _ = fs::remove_file(path);
    }
}
