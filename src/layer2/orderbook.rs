// Order Book Ladder - Pure Rust Implementation
// Exact-decimal bid/ask ladder with diff sequencing

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::core::types::{DepthSnapshot, DiffEvent, PriceLevel};

/// Result of offering a diff event to the ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied,
    /// Already covered by the ladder; nothing changed
    Stale,
    /// Updates between the ladder and the event are missing
    Gap { expected: u64, received: u64 },
    /// No baseline has been installed yet
    Uninitialized,
}

/// Point-in-time copy of the top of the book
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookDepth {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Order book summary
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSummary {
    pub symbol: String,
    pub is_initialized: bool,
    pub last_update_id: u64,
    pub last_update_time: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid: Option<PriceLevel>,
    pub best_ask: Option<PriceLevel>,
    pub snapshot_count: u64,
    pub update_count: u64,
}

impl fmt::Display for OrderBookSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBookSummary(symbol={}, update_id={}, bids={}, asks={}, updates={})",
            self.symbol, self.last_update_id, self.bid_levels, self.ask_levels, self.update_count
        )
    }
}

/// What a diff/snapshot consumer must offer. The update buffer replays into it.
pub trait LadderOps {
    fn apply_snapshot(&mut self, snapshot: &DepthSnapshot, now_ms: u64);
    fn apply_diff(&mut self, diff: &DiffEvent, now_ms: u64) -> DiffOutcome;
    fn last_update_id(&self) -> u64;
}

/// Bid/ask ladder for one symbol.
///
/// Not internally locked: the synchronizer owns it behind a single lock and is
/// its only writer.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,

    // BTreeMap keeps entries sorted; bids are read from the back
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,

    last_update_id: u64,
    last_update_time: u64,
    is_initialized: bool,
    snapshot_count: u64,
    update_count: u64,

    // Fixed-depth books keep at most this many levels per side
    depth_cap: Option<usize>,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            last_update_time: 0,
            is_initialized: false,
            snapshot_count: 0,
            update_count: 0,
            depth_cap: None,
        }
    }

    pub fn with_depth_cap(mut self, levels: usize) -> Self {
        self.depth_cap = Some(levels);
        self
    }

    fn set_level(side: &mut BTreeMap<Decimal, Decimal>, level: &PriceLevel) {
        if level.quantity.is_zero() {
            side.remove(&level.price);
        } else {
            side.insert(level.price.normalize(), level.quantity.normalize());
        }
    }

    fn enforce_cap(&mut self) {
        let Some(cap) = self.depth_cap else {
            return;
        };
        while self.bids.len() > cap {
            // worst bid is the lowest price
            self.bids.pop_first();
        }
        while self.asks.len() > cap {
            self.asks.pop_last();
        }
    }

    pub fn reset(&mut self) {
        debug!(symbol = %self.symbol, "Resetting OrderBook");
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.last_update_time = 0;
        self.is_initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids
            .iter()
            .next_back()
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks
            .iter()
            .next()
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price + ask.price) / Decimal::TWO)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Get top N bid levels, best first
    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.bids
            .iter()
            .rev()
            .take(n)
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
            .collect()
    }

    /// Get top N ask levels, best first
    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.asks
            .iter()
            .take(n)
            .map(|(price, qty)| PriceLevel::new(*price, *qty))
            .collect()
    }

    pub fn depth(&self, n: usize) -> BookDepth {
        BookDepth {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id,
            bids: self.top_bids(n),
            asks: self.top_asks(n),
        }
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn get_summary(&self) -> OrderBookSummary {
        OrderBookSummary {
            symbol: self.symbol.clone(),
            is_initialized: self.is_initialized,
            last_update_id: self.last_update_id,
            last_update_time: self.last_update_time,
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            snapshot_count: self.snapshot_count,
            update_count: self.update_count,
        }
    }
}

impl LadderOps for OrderBook {
    /// Replace the whole ladder
    fn apply_snapshot(&mut self, snapshot: &DepthSnapshot, now_ms: u64) {
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            Self::set_level(&mut self.bids, level);
        }
        for level in &snapshot.asks {
            Self::set_level(&mut self.asks, level);
        }
        self.enforce_cap();

        self.last_update_id = snapshot.last_update_id;
        self.last_update_time = now_ms;
        self.is_initialized = true;
        self.snapshot_count += 1;
    }

    fn apply_diff(&mut self, diff: &DiffEvent, now_ms: u64) -> DiffOutcome {
        if !self.is_initialized {
            return DiffOutcome::Uninitialized;
        }
        if diff.last_update_id <= self.last_update_id {
            return DiffOutcome::Stale;
        }
        let expected = self.last_update_id.saturating_add(1);
        if diff.first_update_id > expected {
            return DiffOutcome::Gap {
                expected,
                received: diff.first_update_id,
            };
        }

        for level in &diff.bids {
            Self::set_level(&mut self.bids, level);
        }
        for level in &diff.asks {
            Self::set_level(&mut self.asks, level);
        }

        self.last_update_id = diff.last_update_id;
        self.last_update_time = now_ms;
        self.update_count += 1;
        DiffOutcome::Applied
    }

    fn last_update_id(&self) -> u64 {
        self.last_update_id
    }
}
