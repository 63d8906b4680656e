// WebSocket Client - Pure Rust Implementation
// Combined-stream connection with confirmed subscriptions and per-topic routing

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::{normalize_symbol, ConnectionStatus, StreamMessage};
use crate::layer1::collaborators::{DepthStream, Subscription, SubscriptionId, TransportError};
use crate::layer2::parser::{MessageParser, ParsedFrame};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(String),
    #[error("Subscription not confirmed within {0:?}")]
    SubscriptionTimeout(Duration),
    #[error("No message for {0:?}")]
    Stale(Duration),
}

// ============================================================================
// Topic names
// ============================================================================

fn stream_symbol(symbol: &str) -> String {
    normalize_symbol(symbol).to_lowercase()
}

/// `{symbol}@depth[@{interval}ms]`
pub fn depth_diff_topic(symbol: &str, update_interval_ms: Option<u32>) -> String {
    match update_interval_ms {
        Some(ms) => format!("{}@depth@{}ms", stream_symbol(symbol), ms),
        None => format!("{}@depth", stream_symbol(symbol)),
    }
}

/// `{symbol}@depth{levels}[@{interval}ms]`
pub fn partial_depth_topic(symbol: &str, levels: u16, update_interval_ms: Option<u32>) -> String {
    match update_interval_ms {
        Some(ms) => format!("{}@depth{}@{}ms", stream_symbol(symbol), levels, ms),
        None => format!("{}@depth{}", stream_symbol(symbol), levels),
    }
}

/// SUBSCRIBE / UNSUBSCRIBE request body
pub fn create_request_message(method: &str, streams: &[String], id: u64) -> String {
    serde_json::json!({
        "method": method,
        "params": streams,
        "id": id
    })
    .to_string()
}

// ============================================================================
// Routing table
// ============================================================================

type Feed = mpsc::UnboundedSender<StreamMessage>;

/// Which subscription receives which topic. Survives reconnects.
#[derive(Default)]
struct Routes {
    by_topic: HashMap<String, Vec<(SubscriptionId, Feed)>>,
    by_subscription: HashMap<SubscriptionId, Vec<String>>,
}

impl Routes {
    fn add(&mut self, id: SubscriptionId, topics: &[String], feed: Feed) {
        for topic in topics {
            self.by_topic
                .entry(topic.clone())
                .or_default()
                .push((id, feed.clone()));
        }
        self.by_subscription.insert(id, topics.to_vec());
    }

    /// Remove a subscription, returning topics nobody listens to any more
    fn remove(&mut self, id: SubscriptionId) -> Vec<String> {
        let mut orphaned = Vec::new();
        for topic in self.by_subscription.remove(&id).unwrap_or_default() {
            if let Some(feeds) = self.by_topic.get_mut(&topic) {
                feeds.retain(|(sub, _)| *sub != id);
                if feeds.is_empty() {
                    self.by_topic.remove(&topic);
                    orphaned.push(topic);
                }
            }
        }
        orphaned
    }

    /// Fan a message out. Subscriptions whose receiver is gone are dropped
    /// whole, and topics left without listeners come back as `orphaned`.
    fn route(&mut self, topic: &str, message: StreamMessage) -> Delivery {
        let Some(feeds) = self.by_topic.get(topic) else {
            return Delivery::Unrouted;
        };
        let dead: Vec<SubscriptionId> = feeds
            .iter()
            .filter(|(_, feed)| feed.send(message.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();

        let mut orphaned = Vec::new();
        for id in dead {
            orphaned.extend(self.remove(id));
        }
        Delivery::Delivered { orphaned }
    }

    fn topics(&self) -> Vec<String> {
        self.by_topic.keys().cloned().collect()
    }

    fn clear(&mut self) {
        self.by_topic.clear();
        self.by_subscription.clear();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Unrouted,
    Delivered { orphaned: Vec<String> },
}

/// Commands sent to the WebSocket event loop
enum WsCommand {
    Subscribe {
        topics: Vec<String>,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Clone)]
struct WsSettings {
    ping_interval: Duration,
    health_check_interval: Duration,
    stale_timeout: Duration,
    max_reconnect_attempts: u32,
    subscribe_timeout: Duration,
}

// ============================================================================
// WebSocket Client
// ============================================================================

/// Combined-stream client shared by every order book on the connection
pub struct WebSocketClient {
    url: String,
    settings: WsSettings,

    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,

    routes: Arc<RwLock<Routes>>,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_request_id: Arc<AtomicU64>,
}

impl WebSocketClient {
    pub fn new(base_url: &str) -> Self {
        Self::from_config(&ExchangeConfig {
            stream_url: base_url.to_string(),
            ..ExchangeConfig::default()
        })
    }

    pub fn from_config(config: &ExchangeConfig) -> Self {
        let url = format!("{}/stream", config.stream_url.trim_end_matches('/'));
        info!(url = %url, "WebSocket client created");

        Self {
            url,
            settings: WsSettings {
                ping_interval: Duration::from_secs(config.ws_ping_interval_secs),
                health_check_interval: Duration::from_secs(config.ws_health_check_interval_secs),
                stale_timeout: Duration::from_secs(config.ws_stale_timeout_secs),
                max_reconnect_attempts: config.ws_max_reconnect_attempts,
                subscribe_timeout: Duration::from_secs(config.ws_subscribe_timeout_secs),
            },
            state: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            message_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            routes: Arc::new(RwLock::new(Routes::default())),
            cmd_tx: Mutex::new(None),
            task: Mutex::new(None),
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Command channel to the connection task, spawning the task if it is not running
    fn command_sender(&self) -> mpsc::UnboundedSender<WsCommand> {
        let mut cmd_tx = self.cmd_tx.lock();
        if let Some(tx) = cmd_tx.as_ref() {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let context = ConnectionContext {
            url: self.url.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            message_count: self.message_count.clone(),
            error_count: self.error_count.clone(),
            routes: self.routes.clone(),
            next_request_id: self.next_request_id.clone(),
        };

        *self.state.write() = ConnectionStatus::Connecting;
        *self.task.lock() = Some(tokio::spawn(run_websocket(context, rx)));
        *cmd_tx = Some(tx.clone());
        tx
    }

    /// Subscribe to `topics`; resolves after the server confirms the request
    pub async fn subscribe_topics(&self, topics: &[String]) -> Result<Subscription, StreamError> {
        let id = SubscriptionId::new();
        let (feed, messages) = mpsc::unbounded_channel();

        // Route before confirming so nothing sent right after the reply is lost
        self.routes.write().add(id, topics, feed);

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.command_sender().send(WsCommand::Subscribe {
            topics: topics.to_vec(),
            reply: reply_tx,
        });
        if sent.is_err() {
            self.routes.write().remove(id);
            return Err(StreamError::NotConnected);
        }

        let outcome = match tokio::time::timeout(self.settings.subscribe_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StreamError::NotConnected),
            Err(_) => Err(StreamError::SubscriptionTimeout(self.settings.subscribe_timeout)),
        };

        match outcome {
            Ok(()) => {
                info!(subscription = %id, topics = ?topics, "Subscribed");
                Ok(Subscription {
                    id,
                    topics: topics.to_vec(),
                    messages,
                })
            }
            Err(e) => {
                warn!(topics = ?topics, error = %e, "Subscription failed");
                let orphaned = self.routes.write().remove(id);
                if !orphaned.is_empty() {
                    if let Some(tx) = self.cmd_tx.lock().as_ref() {
                        let _ = tx.send(WsCommand::Unsubscribe(orphaned));
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop a subscription. Topics still used by another subscription stay subscribed.
    pub fn unsubscribe_id(&self, id: SubscriptionId) {
        let orphaned = self.routes.write().remove(id);
        if orphaned.is_empty() {
            return;
        }
        debug!(subscription = %id, topics = ?orphaned, "Unsubscribing");
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(WsCommand::Unsubscribe(orphaned));
        }
    }

    /// Get list of active topics
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.routes.read().topics()
    }

    /// Stop the connection task and end every subscription feed
    pub fn disconnect(&self) {
        info!("Disconnecting WebSocket");
        self.cmd_tx.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.routes.write().clear();
        *self.state.write() = ConnectionStatus::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionStatus::Connected
    }

    pub fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            state: *self.state.read(),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            active_subscriptions: self.routes.read().by_subscription.len(),
        }
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!("WebSocket client dropped");
    }
}

#[async_trait]
impl DepthStream for WebSocketClient {
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, TransportError> {
        Ok(self.subscribe_topics(topics).await?)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError> {
        self.unsubscribe_id(id);
        Ok(())
    }
}

/// WebSocket statistics
#[derive(Debug, Clone)]
pub struct WebSocketStats {
    pub state: ConnectionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub active_subscriptions: usize,
}

impl fmt::Display for WebSocketStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebSocketStats(state={:?}, messages={}, errors={}, subs={})",
               self.state, self.message_count, self.error_count, self.active_subscriptions)
    }
}

// ============================================================================
// Connection task
// ============================================================================

struct ConnectionContext {
    url: String,
    settings: WsSettings,
    state: Arc<RwLock<ConnectionStatus>>,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    routes: Arc<RwLock<Routes>>,
    next_request_id: Arc<AtomicU64>,
}

/// Main WebSocket async loop with automatic reconnection
async fn run_websocket(ctx: ConnectionContext, mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>) {
    let mut reconnect_attempt = 0u32;
    let mut parser = MessageParser::new();

    loop {
        match try_connect(&ctx, &mut cmd_rx, &mut parser, &mut reconnect_attempt).await {
            Ok(()) => {
                info!("WebSocket connection ended gracefully");
                break;
            }
            Err(e) => {
                error!(error = %e, "WebSocket connection error");
                ctx.error_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        if reconnect_attempt >= ctx.settings.max_reconnect_attempts {
            error!(max_attempts = ctx.settings.max_reconnect_attempts, "Max reconnection attempts reached");
            *ctx.state.write() = ConnectionStatus::Failed;
            // Dropping the feeds tells every subscriber the stream is gone
            ctx.routes.write().clear();
            break;
        }

        let delay_secs = std::cmp::min(2_u64.pow(reconnect_attempt), 60);
        reconnect_attempt += 1;

        warn!(delay_secs = delay_secs, attempt = reconnect_attempt, max = ctx.settings.max_reconnect_attempts, "Reconnecting");
        *ctx.state.write() = ConnectionStatus::Reconnecting;
        tokio::time::sleep(Duration::from_secs(delay_secs)).await;
    }

    *ctx.state.write() = ConnectionStatus::Disconnected;
}

/// Run one connection until it drops. `Ok` means the client went away.
async fn try_connect(
    ctx: &ConnectionContext,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
    parser: &mut MessageParser,
    reconnect_attempt: &mut u32,
) -> Result<(), StreamError> {
    debug!(url = %ctx.url, "Connecting to WebSocket");

    let (ws_stream, _) = connect_async(ctx.url.as_str())
        .await
        .map_err(|e| StreamError::Connect(e.to_string()))?;

    info!("WebSocket connected");
    *ctx.state.write() = ConnectionStatus::Connected;
    *reconnect_attempt = 0;

    let (mut write, mut read) = ws_stream.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<(), StreamError>>> = HashMap::new();

    // Re-subscribe everything still routed (reconnect case)
    let current = ctx.routes.read().topics();
    if !current.is_empty() {
        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
        write
            .send(Message::Text(create_request_message("SUBSCRIBE", &current, req_id)))
            .await
            .map_err(|e| StreamError::Send(e.to_string()))?;
        info!(count = current.len(), streams = ?current, "Re-subscribed to streams");
    }

    let mut last_message = Instant::now();
    let mut ping = tokio::time::interval(ctx.settings.ping_interval);
    let mut health = tokio::time::interval(ctx.settings.health_check_interval);
    ping.tick().await;
    health.tick().await;

    loop {
        tokio::select! {
            msg_result = read.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        last_message = Instant::now();
                        let count = ctx.message_count.fetch_add(1, Ordering::Relaxed) + 1;
                        if count % 10000 == 0 {
                            debug!(count = count, "WebSocket messages received");
                        }

                        match parser.parse(&text) {
                            Ok(ParsedFrame::Market { stream, message }) => {
                                let delivery = ctx.routes.write().route(&stream, message);
                                match delivery {
                                    Delivery::Unrouted => {
                                        debug!(stream = %stream, "Message for unrouted stream");
                                    }
                                    Delivery::Delivered { orphaned } if !orphaned.is_empty() => {
                                        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
                                        let msg = create_request_message("UNSUBSCRIBE", &orphaned, req_id);
                                        if let Err(e) = write.send(Message::Text(msg)).await {
                                            return Err(StreamError::Send(e.to_string()));
                                        }
                                        info!(streams = ?orphaned, "Unsubscribed streams with no listeners");
                                    }
                                    Delivery::Delivered { .. } => {}
                                }
                            }
                            Ok(ParsedFrame::Response { id, error }) => {
                                let result = match error {
                                    Some(reason) => Err(StreamError::SubscriptionRejected(reason)),
                                    None => Ok(()),
                                };
                                if let Some(reply) = pending.remove(&id) {
                                    let _ = reply.send(result);
                                } else if let Err(e) = result {
                                    warn!(id = id, error = %e, "Request rejected");
                                }
                            }
                            Err(e) => {
                                ctx.error_count.fetch_add(1, Ordering::Relaxed);
                                warn!(error = %e, "Dropping unparseable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_message = Instant::now();
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_message = Instant::now();
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_message = Instant::now();
                        warn!(bytes = data.len(), "Received unexpected binary message");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket closed by server");
                        return Err(StreamError::NotConnected);
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        return Err(StreamError::Connect(e.to_string()));
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return Err(StreamError::NotConnected);
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Subscribe { topics, reply }) => {
                        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
                        let msg = create_request_message("SUBSCRIBE", &topics, req_id);
                        match write.send(Message::Text(msg)).await {
                            Ok(()) => {
                                pending.insert(req_id, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(StreamError::Send(e.to_string())));
                                return Err(StreamError::Send(e.to_string()));
                            }
                        }
                    }
                    Some(WsCommand::Unsubscribe(topics)) => {
                        let req_id = ctx.next_request_id.fetch_add(1, Ordering::Relaxed);
                        let msg = create_request_message("UNSUBSCRIBE", &topics, req_id);
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            error!(error = %e, "Failed to send unsubscribe");
                        } else {
                            info!(streams = ?topics, "Unsubscribed");
                        }
                    }
                    None => {
                        debug!("Command channel closed");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    warn!(error = %e, "Ping failed");
                    return Err(StreamError::Send(e.to_string()));
                }
            }

            _ = health.tick() => {
                let elapsed = last_message.elapsed();
                if elapsed > ctx.settings.stale_timeout {
                    warn!(elapsed_secs = elapsed.as_secs(), "Stale connection detected");
                    return Err(StreamError::Stale(elapsed));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DepthSnapshot;

    fn snapshot(id: u64) -> StreamMessage {
        StreamMessage::Snapshot(DepthSnapshot {
            symbol: "BTCTRY".to_string(),
            last_update_id: id,
            bids: vec![],
            asks: vec![],
        })
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(depth_diff_topic("BTC_TRY", None), "btctry@depth");
        assert_eq!(depth_diff_topic("BTCTRY", Some(100)), "btctry@depth@100ms");
        assert_eq!(partial_depth_topic("btc_try", 10, None), "btctry@depth10");
        assert_eq!(partial_depth_topic("BTCTRY", 5, Some(1000)), "btctry@depth5@1000ms");
    }

    #[test]
    fn test_request_message() {
        let msg = create_request_message("SUBSCRIBE", &["btctry@depth".to_string()], 5);
        assert!(msg.contains("SUBSCRIBE"));
        assert!(msg.contains("btctry@depth"));
        assert!(msg.contains("\"id\":5"));
    }

    #[test]
    fn test_routes_fan_out_and_orphan_tracking() {
        let mut routes = Routes::default();
        let topic = "btctry@depth".to_string();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = SubscriptionId::new();
        let b = SubscriptionId::new();

        routes.add(a, &[topic.clone()], tx_a);
        routes.add(b, &[topic.clone()], tx_b);
        assert_eq!(routes.route(&topic, snapshot(1)), Delivery::Delivered { orphaned: vec![] });
        assert_eq!(rx_a.try_recv().unwrap().last_update_id(), 1);
        assert_eq!(rx_b.try_recv().unwrap().last_update_id(), 1);

        // topic still has a listener
        assert!(routes.remove(a).is_empty());
        assert_eq!(routes.remove(b), vec![topic.clone()]);
        assert_eq!(routes.route(&topic, snapshot(2)), Delivery::Unrouted);
    }

    #[test]
    fn test_routes_prune_dropped_receivers() {
        let mut routes = Routes::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let topics = vec!["x@depth5".to_string(), "x@depth".to_string()];
        routes.add(SubscriptionId::new(), &topics, tx);
        routes.add(SubscriptionId::new(), &["x@depth".to_string()], tx_live);
        drop(rx);

        let delivery = routes.route("x@depth5", snapshot(1));
        assert_eq!(delivery, Delivery::Delivered { orphaned: vec!["x@depth5".to_string()] });
        assert!(!routes.by_topic.contains_key("x@depth5"));
        assert_eq!(routes.by_subscription.len(), 1);

        // shared topic keeps its live listener
        assert_eq!(routes.route("x@depth", snapshot(2)), Delivery::Delivered { orphaned: vec![] });
        assert_eq!(rx_live.try_recv().unwrap().last_update_id(), 2);
        assert_eq!(routes.route("x@depth5", snapshot(3)), Delivery::Unrouted);
    }

    #[test]
    fn test_websocket_stats() {
        let client = WebSocketClient::new("wss://example.invalid");
        assert_eq!(client.url(), "wss://example.invalid/stream");
        let stats = client.get_stats();
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.active_subscriptions, 0);
        assert_eq!(stats.state, ConnectionStatus::Disconnected);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_unreachable_subscribe_fails() {
        let client = WebSocketClient::from_config(&ExchangeConfig {
            stream_url: "ws://127.0.0.1:9".to_string(),
            ws_subscribe_timeout_secs: 1,
            ws_max_reconnect_attempts: 0,
            ..ExchangeConfig::default()
        });

        let result = client.subscribe_topics(&["btctry@depth".to_string()]).await;
        assert!(result.is_err());
        assert!(client.active_subscriptions().is_empty());
        client.disconnect();
    }
}
