// Trading rule types: symbol filters, order drafts, compliance outcomes

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::core::types::OrderType;

/// What the compliance engine does with values that break a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeRulesBehaviour {
    /// Skip all checks
    None,
    /// Adjust values silently
    AutoClamp,
    /// Any required adjustment fails the check
    ThrowError,
}

impl fmt::Display for TradeRulesBehaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for TradeRulesBehaviour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "none" => Ok(TradeRulesBehaviour::None),
            "auto_clamp" | "autoclamp" => Ok(TradeRulesBehaviour::AutoClamp),
            "throw_error" | "throwerror" => Ok(TradeRulesBehaviour::ThrowError),
            _ => Err(format!(
                "Invalid TradeRulesBehaviour: '{}'. Expected none, auto_clamp or throw_error",
                s
            )),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// `LOT_SIZE` / `MARKET_LOT_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotSizeFilter {
    pub min_quantity: Decimal,
    pub max_quantity: Decimal,
    pub step_size: Decimal,
}

/// `PRICE_FILTER`. Zero fields disable the matching check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceFilter {
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
}

/// `MIN_NOTIONAL`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinNotionalFilter {
    pub min_notional: Decimal,
}

/// Filters the exchange declares for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTradingRules {
    pub symbol: String,
    pub allowed_order_types: HashSet<OrderType>,
    pub lot_size: Option<LotSizeFilter>,
    /// Overrides `lot_size` for market orders; zero max/step inherit from `lot_size`
    pub market_lot_size: Option<LotSizeFilter>,
    pub price_filter: Option<PriceFilter>,
    pub min_notional: Option<MinNotionalFilter>,
}

impl SymbolTradingRules {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            allowed_order_types: HashSet::new(),
            lot_size: None,
            market_lot_size: None,
            price_filter: None,
            min_notional: None,
        }
    }

    pub fn allows(&self, order_type: OrderType) -> bool {
        self.allowed_order_types.contains(&order_type)
    }
}

// ============================================================================
// Order Draft / Result
// ============================================================================

/// Order parameters to check before submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub order_type: OrderType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl OrderDraft {
    pub fn new(order_type: OrderType) -> Self {
        Self {
            order_type,
            quantity: None,
            price: None,
            stop_price: None,
        }
    }

    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_stop_price(mut self, stop_price: Decimal) -> Self {
        self.stop_price = Some(stop_price);
        self
    }
}

/// Which price field a price-filter failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceField {
    Price,
    StopPrice,
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceField::Price => write!(f, "price"),
            PriceField::StopPrice => write!(f, "stop price"),
        }
    }
}

/// Which part of the price filter failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceCheck {
    Range,
    Tick,
}

impl fmt::Display for PriceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceCheck::Range => write!(f, "max/min"),
            PriceCheck::Tick => write!(f, "tick"),
        }
    }
}

/// Why an order draft failed its trade rule check
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ComplianceFailure {
    #[error("Trade rules unavailable for {symbol}: {reason}")]
    FilterUnavailable { symbol: String, reason: String },
    #[error("Trade rules check failed: {order_type} order type not allowed for {symbol}")]
    OrderTypeNotAllowed { symbol: String, order_type: OrderType },
    #[error("Trade rules check failed: LotSize filter failed. Original quantity: {original}, closest allowed: {closest}")]
    LotSizeViolation { original: Decimal, closest: Decimal },
    #[error("Trade rules check failed: {field} filter {check} failed. Original: {original}, closest allowed: {closest}")]
    PriceFilterViolation {
        field: PriceField,
        check: PriceCheck,
        original: Decimal,
        closest: Decimal,
    },
    #[error("Trade rules check failed: MinNotional filter failed. Order size: {notional}, minimal order size: {min_notional}")]
    MinNotionalViolation { notional: Decimal, min_notional: Decimal },
    #[error("Trade rules check failed: MinNotional filter failed. Unable to auto comply: {reason}")]
    MinNotionalUnresolvable { notional: Decimal, min_notional: Decimal, reason: String },
}

/// Outcome of a trade rule check. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub passed: bool,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub failure: Option<ComplianceFailure>,
}

impl ComplianceResult {
    pub fn passed(quantity: Option<Decimal>, price: Option<Decimal>, stop_price: Option<Decimal>) -> Self {
        Self {
            passed: true,
            quantity,
            price,
            stop_price,
            failure: None,
        }
    }

    pub fn failed(failure: ComplianceFailure) -> Self {
        Self {
            passed: false,
            quantity: None,
            price: None,
            stop_price: None,
            failure: Some(failure),
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }
}
