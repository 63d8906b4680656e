// Core Module - Foundational types, config, logging, clock

pub mod types;
pub mod config;
pub mod logger;
pub mod clock;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    ClientConfig, ExchangeConfig, OrderBookConfig, TradeRulesConfig, TimeSyncConfig,
    MonitoringConfig, ConfigManager, ConfigSummary, ConfigError,
};
pub use logger::{setup_logging, setup_logging_from_config};
pub use clock::{Clock, SystemClock, ServerClock, ManualClock};
