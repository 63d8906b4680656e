// Layer 2 - Book Processing & Synchronization
// Wire parsing, the ladder, and the machinery that keeps it in step with the exchange

pub mod orderbook;
pub mod parser;
pub mod resync;
pub mod synchronizer;
pub mod update_buffer;

// Re-export commonly used items
pub use orderbook::{BookDepth, DiffOutcome, LadderOps, OrderBook, OrderBookSummary};
pub use parser::{
    parse_depth_snapshot, parse_depth_update, parse_server_time, parse_stream_payload,
    parse_symbol_rules, MessageParser, ParseError, ParsedFrame, ParserStats,
};
pub use resync::{ResyncController, ResyncGuard, ResyncStats, ResyncTicket};
pub use synchronizer::{OrderBookSynchronizer, SyncError, SyncMode, SynchronizerSummary};
pub use update_buffer::{Reconciliation, UpdateBuffer};
