// Trading rules: symbol filters, cache and compliance checks

pub mod compliance;
pub mod filter_cache;
pub mod math;
pub mod types;

pub use compliance::{check_rules, effective_lot_size, TradeRuleComplianceEngine};
pub use filter_cache::{FilterCacheStats, RulesLookup, SymbolFilterCache};
pub use types::{
    ComplianceFailure, ComplianceResult, LotSizeFilter, MinNotionalFilter, OrderDraft, PriceCheck,
    PriceField, PriceFilter, SymbolTradingRules, TradeRulesBehaviour,
};
