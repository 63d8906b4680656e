// Layer 1 - Data Connectors for Binance TR
// REST, combined websocket stream and server time, behind collaborator traits

pub mod collaborators;
pub mod rest_client;
pub mod time_synchronizer;
pub mod websocket;

// Re-export commonly used items for convenience
pub use collaborators::{
    DepthStream, ServerTimeSource, SnapshotProvider, Subscription, SubscriptionId,
    TradingRulesProvider, TransportError,
};
pub use rest_client::{BinanceRestClient, RateLimiter, RestClientError, RestClientStats};
pub use time_synchronizer::{TimeSyncError, TimeSyncStats, TimeSynchronizer};
pub use websocket::{
    depth_diff_topic, partial_depth_topic, StreamError, WebSocketClient, WebSocketStats,
};
