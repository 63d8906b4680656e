// Message Parser - Pure Rust Implementation
// Combined-stream depth frames, REST depth snapshots and symbol filter lists

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{
    normalize_symbol, DepthSnapshot, DiffEvent, OrderType, PriceLevel, StreamMessage,
};
use crate::rules::types::{LotSizeFilter, MinNotionalFilter, PriceFilter, SymbolTradingRules};

/// Parser error type
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Missing field: {0}")]
    MissingField(String),
    #[error("Invalid {field}: '{value}'")]
    InvalidNumber { field: String, value: String },
}

/// Parse a decimal string, naming the field on failure
fn parse_decimal_field(value: &str, field_name: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(value).map_err(|_| ParseError::InvalidNumber {
        field: field_name.to_string(),
        value: value.to_string(),
    })
}

/// Parse a Binance [price_string, qty_string] pair into PriceLevel
fn parse_level(raw: &[String; 2]) -> Result<PriceLevel, ParseError> {
    Ok(PriceLevel {
        price: parse_decimal_field(&raw[0], "price")?,
        quantity: parse_decimal_field(&raw[1], "quantity")?,
    })
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    raw.iter().map(parse_level).collect()
}

/// Filter values arrive as strings on some endpoints and numbers on others.
/// A missing value reads as zero, which disables the matching check.
fn decimal_value(obj: &Value, field_name: &str) -> Result<Decimal, ParseError> {
    match obj.get(field_name) {
        None | Some(Value::Null) => Ok(Decimal::ZERO),
        Some(Value::String(s)) => parse_decimal_field(s, field_name),
        Some(Value::Number(n)) => parse_decimal_field(&n.to_string(), field_name),
        Some(other) => Err(ParseError::InvalidNumber {
            field: field_name.to_string(),
            value: other.to_string(),
        }),
    }
}

// ============================================================================
// Serde Structures (Raw Binance JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "e")]
    _event_type: String,
    #[serde(rename = "E", default)]
    event_time: u64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    symbol: String,
    #[serde(rename = "orderTypes", default)]
    order_types: Vec<String>,
    #[serde(default)]
    filters: Vec<Value>,
}

// ============================================================================
// Parsed frames
// ============================================================================

/// One websocket text frame after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// Market data for the named stream
    Market { stream: String, message: StreamMessage },
    /// Reply to a SUBSCRIBE/UNSUBSCRIBE request
    Response { id: u64, error: Option<String> },
}

/// Parser statistics
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub diff_count: u64,
    pub snapshot_count: u64,
    pub response_count: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Stateful frame parser that keeps counters
#[derive(Debug, Default)]
pub struct MessageParser {
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one websocket text frame
    pub fn parse(&mut self, raw_json: &str) -> Result<ParsedFrame, ParseError> {
        let result = self.parse_inner(raw_json);
        match &result {
            Ok(ParsedFrame::Market { message: StreamMessage::Diff(_), .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.diff_count += 1;
            }
            Ok(ParsedFrame::Market { message: StreamMessage::Snapshot(_), .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.snapshot_count += 1;
            }
            Ok(ParsedFrame::Response { .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.response_count += 1;
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                debug!(error = %e, "Failed to parse frame");
            }
        }
        result
    }

    fn parse_inner(&self, raw_json: &str) -> Result<ParsedFrame, ParseError> {
        let value: Value =
            serde_json::from_str(raw_json).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        // Request replies: {"result":null,"id":1} or {"error":{...},"id":1}
        if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
            if value.get("stream").is_none() {
                let error = value.get("error").filter(|e| !e.is_null()).map(|e| {
                    e.get("msg")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string())
                });
                return Ok(ParsedFrame::Response { id, error });
            }
        }

        // Combined stream format: {"stream": "...", "data": {...}}
        let stream = value
            .get("stream")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::MissingField("stream".into()))?
            .to_string();
        let data = value
            .get("data")
            .ok_or_else(|| ParseError::MissingField("data".into()))?;

        let message = parse_stream_payload(&stream, data)?;
        Ok(ParsedFrame::Market { stream, message })
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }
}

// ============================================================================
// Standalone parse functions
// ============================================================================

/// Decode the `data` part of a combined-stream frame
pub fn parse_stream_payload(stream: &str, data: &Value) -> Result<StreamMessage, ParseError> {
    // Partial depth payloads carry no event type
    if data.get("lastUpdateId").is_some() && data.get("e").is_none() {
        let symbol = stream.split('@').next().unwrap_or_default();
        return parse_depth_snapshot(symbol, data).map(StreamMessage::Snapshot);
    }

    let event_type = data
        .get("e")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::MissingField("e".into()))?;

    match event_type {
        "depthUpdate" => parse_depth_update(data).map(StreamMessage::Diff),
        other => Err(ParseError::UnknownEventType(other.to_string())),
    }
}

pub fn parse_depth_update(data: &Value) -> Result<DiffEvent, ParseError> {
    let raw = RawDepthUpdate::deserialize(data).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    Ok(DiffEvent {
        symbol: normalize_symbol(&raw.symbol),
        first_update_id: raw.first_update_id,
        last_update_id: raw.final_update_id,
        event_time: raw.event_time,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

/// REST depth snapshot or partial depth stream payload
pub fn parse_depth_snapshot(symbol: &str, data: &Value) -> Result<DepthSnapshot, ParseError> {
    let raw = RawDepthSnapshot::deserialize(data).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    Ok(DepthSnapshot {
        symbol: normalize_symbol(symbol),
        last_update_id: raw.last_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

/// Parse the `data` object of the symbols endpoint into rules keyed by normalized symbol
pub fn parse_symbol_rules(data: &Value) -> Result<HashMap<String, SymbolTradingRules>, ParseError> {
    let list = data
        .get("list")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ParseError::MissingField("data.list".into()))?;

    let mut rules = HashMap::with_capacity(list.len());
    for entry in list {
        let parsed = parse_symbol(entry)?;
        rules.insert(normalize_symbol(&parsed.symbol), parsed);
    }
    Ok(rules)
}

fn parse_symbol(entry: &Value) -> Result<SymbolTradingRules, ParseError> {
    let raw = RawSymbol::deserialize(entry).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let mut rules = SymbolTradingRules::new(&raw.symbol);

    for label in &raw.order_types {
        match label.parse::<OrderType>() {
            Ok(order_type) => {
                rules.allowed_order_types.insert(order_type);
            }
            Err(_) => debug!(symbol = %raw.symbol, order_type = %label, "Skipping unknown order type"),
        }
    }

    for filter in &raw.filters {
        let filter_type = filter.get("filterType").and_then(|v| v.as_str()).unwrap_or_default();
        match filter_type {
            "PRICE_FILTER" => {
                rules.price_filter = Some(PriceFilter {
                    min_price: decimal_value(filter, "minPrice")?,
                    max_price: decimal_value(filter, "maxPrice")?,
                    tick_size: decimal_value(filter, "tickSize")?,
                });
            }
            "LOT_SIZE" => rules.lot_size = Some(parse_lot_size(filter)?),
            "MARKET_LOT_SIZE" => rules.market_lot_size = Some(parse_lot_size(filter)?),
            "MIN_NOTIONAL" | "NOTIONAL" => {
                rules.min_notional = Some(MinNotionalFilter {
                    min_notional: decimal_value(filter, "minNotional")?,
                });
            }
            _ => {}
        }
    }

    Ok(rules)
}

fn parse_lot_size(filter: &Value) -> Result<LotSizeFilter, ParseError> {
    Ok(LotSizeFilter {
        min_quantity: decimal_value(filter, "minQty")?,
        max_quantity: decimal_value(filter, "maxQty")?,
        step_size: decimal_value(filter, "stepSize")?,
    })
}

/// Server time in ms from the time endpoint (`timestamp` at the top level or under `data`)
pub fn parse_server_time(value: &Value) -> Result<u64, ParseError> {
    let lookup = |v: &Value| {
        v.get("timestamp")
            .or_else(|| v.get("serverTime"))
            .and_then(|t| t.as_u64())
    };
    lookup(value)
        .or_else(|| value.get("data").and_then(lookup))
        .ok_or_else(|| {
            warn!("Server time response without timestamp");
            ParseError::MissingField("timestamp".into())
        })
}
