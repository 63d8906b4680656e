// Core Type Definitions for the Binance TR connector
// Book data, stream messages and order enums shared by every layer

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum OrderType {
    Limit,
    LimitMaker,
    Market,
    StopLossLimit,
    TakeProfitLimit,
}

/// Wire labels, one entry per variant. `label()` and `FromStr` both read this table.
const ORDER_TYPE_LABELS: [(OrderType, &str); 5] = [
    (OrderType::Limit, "LIMIT"),
    (OrderType::LimitMaker, "LIMIT_MAKER"),
    (OrderType::Market, "MARKET"),
    (OrderType::StopLossLimit, "STOP_LOSS_LIMIT"),
    (OrderType::TakeProfitLimit, "TAKE_PROFIT_LIMIT"),
];

impl OrderType {
    pub const ALL: [OrderType; 5] = [
        OrderType::Limit,
        OrderType::LimitMaker,
        OrderType::Market,
        OrderType::StopLossLimit,
        OrderType::TakeProfitLimit,
    ];

    pub fn label(&self) -> &'static str {
        ORDER_TYPE_LABELS
            .iter()
            .find(|(order_type, _)| order_type == self)
            .map(|(_, label)| *label)
            .unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_uppercase();
        ORDER_TYPE_LABELS
            .iter()
            .find(|(_, label)| *label == wanted)
            .map(|(order_type, _)| *order_type)
            .ok_or_else(|| format!("Invalid OrderType: '{}'", s))
    }
}

impl TryFrom<String> for OrderType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderType> for &'static str {
    fn from(value: OrderType) -> Self {
        value.label()
    }
}

/// Lifecycle of a synchronized order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookStatus {
    Disconnected,
    Connecting,
    Syncing,
    Synced,
    Resyncing,
    Failed,
}

impl BookStatus {
    /// Statuses from which `start` may be called
    pub fn is_idle(&self) -> bool {
        matches!(self, BookStatus::Disconnected | BookStatus::Failed)
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Book Data
// ============================================================================

/// One price level. A zero quantity in a diff removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}

impl fmt::Display for PriceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PriceLevel(price={}, qty={})", self.price, self.quantity)
    }
}

/// Incremental depth update covering `first_update_id..=last_update_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEvent {
    pub symbol: String,
    pub first_update_id: u64,
    pub last_update_id: u64,
    pub event_time: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl fmt::Display for DiffEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DiffEvent(symbol={}, U={}, u={}, bids={}, asks={})",
            self.symbol,
            self.first_update_id,
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// Full book state at a single instant (REST snapshot or fixed-depth stream message)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl fmt::Display for DepthSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthSnapshot(symbol={}, update_id={}, bids={}, asks={})",
            self.symbol,
            self.last_update_id,
            self.bids.len(),
            self.asks.len()
        )
    }
}

/// Message delivered on a depth subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Diff(DiffEvent),
    Snapshot(DepthSnapshot),
}

impl StreamMessage {
    pub fn last_update_id(&self) -> u64 {
        match self {
            StreamMessage::Diff(event) => event.last_update_id,
            StreamMessage::Snapshot(snapshot) => snapshot.last_update_id,
        }
    }
}

// ============================================================================
// Symbols
// ============================================================================

/// Canonical symbol key: uppercase with `_` separators removed (`btc_try` -> `BTCTRY`)
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| *c != '_')
        .flat_map(|c| c.to_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_type_labels_round_trip_through_table() {
        for order_type in OrderType::ALL {
            let parsed: OrderType = order_type.label().parse().unwrap();
            assert_eq!(parsed, order_type);
        }
        assert_eq!(OrderType::StopLossLimit.to_string(), "STOP_LOSS_LIMIT");
    }

    #[test]
    fn test_order_type_parse_is_case_insensitive() {
        assert_eq!("limit_maker".parse::<OrderType>().unwrap(), OrderType::LimitMaker);
        assert!("STOP_MARKET".parse::<OrderType>().is_err());
    }

    #[test]
    fn test_order_type_serde_uses_labels() {
        let json = serde_json::to_string(&OrderType::TakeProfitLimit).unwrap();
        assert_eq!(json, "\"TAKE_PROFIT_LIMIT\"");
        let back: OrderType = serde_json::from_str("\"MARKET\"").unwrap();
        assert_eq!(back, OrderType::Market);
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("btc_try"), "BTCTRY");
        assert_eq!(normalize_symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn test_book_status_idle() {
        assert!(BookStatus::Disconnected.is_idle());
        assert!(BookStatus::Failed.is_idle());
        assert!(!BookStatus::Synced.is_idle());
        assert!(!BookStatus::Resyncing.is_idle());
    }
}
