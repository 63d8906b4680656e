// Binance TR core - order book synchronization and trade rule compliance
// Layer 1 talks to the exchange, layer 2 keeps books in step, rules checks orders

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod rules;

pub use crate::core::{BookStatus, Clock, ClientConfig, ConfigManager, DepthSnapshot, DiffEvent, PriceLevel};
pub use crate::layer1::{BinanceRestClient, TimeSynchronizer, TransportError, WebSocketClient};
pub use crate::layer2::{OrderBookSynchronizer, SyncError, SyncMode};
pub use crate::rules::{
    ComplianceResult, OrderDraft, SymbolFilterCache, TradeRuleComplianceEngine, TradeRulesBehaviour,
};
