// Collaborator interfaces consumed by the book synchronizer and the rules engine.
// The REST and websocket clients implement them; tests substitute in-memory fakes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::types::{DepthSnapshot, StreamMessage};
use crate::layer1::rest_client::RestClientError;
use crate::layer1::websocket::StreamError;
use crate::rules::SymbolTradingRules;

/// Failure of a REST call or the stream transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("REST error: {0}")]
    Rest(#[from] RestClientError),
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live subscription: its handle plus the ordered message feed for its topics.
///
/// The feed ends (`recv` returns `None`) when the transport gives up on the topics.
pub struct Subscription {
    pub id: SubscriptionId,
    pub topics: Vec<String>,
    pub messages: mpsc::UnboundedReceiver<StreamMessage>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topics", &self.topics)
            .finish()
    }
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_order_book_snapshot(
        &self,
        symbol: &str,
        depth_limit: u32,
    ) -> Result<DepthSnapshot, TransportError>;
}

#[async_trait]
pub trait TradingRulesProvider: Send + Sync {
    /// Rules for every listed symbol, keyed by normalized symbol
    async fn fetch_trading_rules(&self) -> Result<HashMap<String, SymbolTradingRules>, TransportError>;
}

#[async_trait]
pub trait ServerTimeSource: Send + Sync {
    /// Exchange time in milliseconds since the Unix epoch
    async fn server_time_ms(&self) -> Result<u64, TransportError>;
}

#[async_trait]
pub trait DepthStream: Send + Sync {
    /// Resolves once the exchange has confirmed the subscription
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;
}
