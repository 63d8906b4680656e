// Order Book Synchronizer - Pure Rust Implementation
// Snapshot + diff reconciliation with gap detection and bounded resync

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::clock::Clock;
use crate::core::config::{OrderBookConfig, FIXED_DEPTH_LEVELS};
use crate::core::types::{
    normalize_symbol, BookStatus, DepthSnapshot, DiffEvent, PriceLevel, StreamMessage,
};
use crate::layer1::collaborators::{DepthStream, SnapshotProvider, SubscriptionId, TransportError};
use crate::layer1::websocket::{depth_diff_topic, partial_depth_topic};
use crate::layer2::orderbook::{BookDepth, DiffOutcome, LadderOps, OrderBook, OrderBookSummary};
use crate::layer2::resync::{ResyncController, ResyncGuard, ResyncStats, ResyncTicket};
use crate::layer2::update_buffer::{Reconciliation, UpdateBuffer};

/// Transitions kept for slow status subscribers
const STATUS_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("No baseline received within {0:?}")]
    Timeout(Duration),
    #[error("Start cancelled")]
    Cancelled,
    #[error("Synchronizer already running for {0}")]
    AlreadyRunning(String),
    #[error("Resync attempts exhausted after {0} tries")]
    ResyncExhausted(u32),
    #[error("Synchronizer stopped")]
    Stopped,
    #[error("Depth stream ended")]
    StreamClosed,
    #[error("Unsupported fixed depth: {0} levels")]
    InvalidDepth(u16),
}

// ============================================================================
// Mode and Summary
// ============================================================================

/// How the ladder is fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    /// Unbounded ladder from one REST snapshot plus incremental diffs
    FullDepth,
    /// Ladder capped at `levels`; every stream message replaces it
    FixedDepth { levels: u16 },
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::FullDepth => write!(f, "full-depth"),
            SyncMode::FixedDepth { levels } => write!(f, "fixed-depth({})", levels),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SynchronizerSummary {
    pub symbol: Option<String>,
    pub mode: Option<SyncMode>,
    pub status: BookStatus,
    pub book: OrderBookSummary,
    pub diffs_applied: u64,
    pub stale_discarded: u64,
    pub gaps_detected: u64,
    pub resyncs: u64,
    pub replacements: u64,
    pub buffer_overflows: u64,
}

impl fmt::Display for SynchronizerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SynchronizerSummary(symbol={}, status={}, update_id={}, applied={}, gaps={}, resyncs={})",
            self.symbol.as_deref().unwrap_or("-"),
            self.status,
            self.book.last_update_id,
            self.diffs_applied,
            self.gaps_detected,
            self.resyncs
        )
    }
}

#[derive(Debug, Default)]
struct SyncCounters {
    diffs_applied: AtomicU64,
    stale_discarded: AtomicU64,
    gaps_detected: AtomicU64,
    resyncs: AtomicU64,
    replacements: AtomicU64,
    buffer_overflows: AtomicU64,
}

impl SyncCounters {
    fn reset(&self) {
        for counter in [
            &self.diffs_applied,
            &self.stale_discarded,
            &self.gaps_detected,
            &self.resyncs,
            &self.replacements,
            &self.buffer_overflows,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// Run State
// ============================================================================

#[derive(Clone)]
struct StopSignals {
    /// Cancelled by `stop()`
    session: CancellationToken,
    /// Cancellation passed to `start()`
    caller: CancellationToken,
}

impl StopSignals {
    async fn triggered(&self) -> SyncError {
        tokio::select! {
            biased;
            _ = self.session.cancelled() => SyncError::Stopped,
            _ = self.caller.cancelled() => SyncError::Cancelled,
        }
    }
}

/// Everything the single writer owns while a symbol is running
struct Run {
    symbol: String,
    mode: SyncMode,
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    buffer: UpdateBuffer,
    signals: StopSignals,
}

enum Control {
    Resync(ResyncGuard),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

struct Session {
    generation: u64,
    symbol: String,
    mode: SyncMode,
    cancel: CancellationToken,
    subscription: Option<SubscriptionId>,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
}

// ============================================================================
// Shared State
// ============================================================================

struct Inner {
    snapshots: Arc<dyn SnapshotProvider>,
    stream: Arc<dyn DepthStream>,
    clock: Arc<dyn Clock>,
    config: OrderBookConfig,

    book: RwLock<OrderBook>,
    status: watch::Sender<BookStatus>,
    transitions: broadcast::Sender<BookStatus>,
    resync: Arc<ResyncController>,
    counters: SyncCounters,
}

impl Inner {
    fn status(&self) -> BookStatus {
        *self.status.borrow()
    }

    fn set_status(&self, next: BookStatus) {
        let previous = self.status.send_replace(next);
        if previous != next {
            let symbol = self.book.read().symbol.clone();
            info!(symbol = %symbol, from = %previous, to = %next, "Order book status changed");
            // No receivers is fine
            let _ = self.transitions.send(next);
        }
    }

    fn buffer_message(&self, buffer: &mut UpdateBuffer, message: StreamMessage) {
        match message {
            StreamMessage::Diff(event) => {
                if !buffer.push(event) {
                    self.counters.buffer_overflows.fetch_add(1, Ordering::Relaxed);
                }
            }
            StreamMessage::Snapshot(snapshot) => {
                debug!(update_id = snapshot.last_update_id, "Ignoring snapshot message on diff stream");
            }
        }
    }

    fn drain_pending(&self, run: &mut Run) {
        while let Ok(message) = run.messages.try_recv() {
            self.buffer_message(&mut run.buffer, message);
        }
    }

    /// Drive `work` to completion while buffering whatever the stream delivers
    async fn pump<F: Future>(&self, run: &mut Run, work: F) -> Result<F::Output, SyncError> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                biased;
                err = run.signals.triggered() => return Err(err),
                output = &mut work => return Ok(output),
                message = run.messages.recv() => match message {
                    Some(message) => self.buffer_message(&mut run.buffer, message),
                    None => return Err(SyncError::StreamClosed),
                },
            }
        }
    }

    /// Fetch a snapshot and replay the buffer onto it until the two line up
    async fn rebaseline_full(&self, run: &mut Run) -> Result<(), SyncError> {
        loop {
            let symbol = run.symbol.clone();
            let limit = self.config.snapshot_limit;
            let snapshot = self
                .pump(run, self.snapshots.fetch_order_book_snapshot(&symbol, limit))
                .await??;
            self.drain_pending(run);

            let now = self.clock.now_ms();
            let outcome = {
                let mut book = self.book.write();
                book.apply_snapshot(&snapshot, now);
                run.buffer.reconcile(&mut *book, now)
            };

            match outcome {
                Reconciliation::Ready { applied, discarded } => {
                    info!(
                        symbol = %symbol,
                        last_update_id = snapshot.last_update_id,
                        bids = snapshot.bids.len(),
                        asks = snapshot.asks.len(),
                        applied,
                        discarded,
                        "Snapshot applied"
                    );
                    return Ok(());
                }
                Reconciliation::Gap { baseline_id, first_update_id } => {
                    self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        symbol = %symbol,
                        baseline_id,
                        first_update_id,
                        "Snapshot does not meet the diff stream, fetching again"
                    );
                    self.set_status(BookStatus::Resyncing);
                    self.resync.note_attempt().map_err(SyncError::ResyncExhausted)?;
                }
            }
        }
    }

    /// Wait (bounded) for the next full replacement and install it
    async fn await_baseline(&self, run: &mut Run) -> Result<(), SyncError> {
        let wait = Duration::from_secs(self.config.baseline_timeout_secs);
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                err = run.signals.triggered() => return Err(err),
                _ = &mut deadline => {
                    warn!(symbol = %run.symbol, wait_secs = wait.as_secs(), "No fixed-depth baseline received");
                    return Err(SyncError::Timeout(wait));
                }
                message = run.messages.recv() => match message {
                    Some(StreamMessage::Snapshot(snapshot)) => {
                        self.install_replacement(&snapshot);
                        return Ok(());
                    }
                    Some(StreamMessage::Diff(event)) => {
                        debug!(update_id = event.last_update_id, "Ignoring diff on fixed-depth stream");
                    }
                    None => return Err(SyncError::StreamClosed),
                },
            }
        }
    }

    fn install_replacement(&self, snapshot: &DepthSnapshot) {
        self.book.write().apply_snapshot(snapshot, self.clock.now_ms());
        self.counters.replacements.fetch_add(1, Ordering::Relaxed);
    }

    async fn handle_message(&self, run: &mut Run, message: StreamMessage) -> Flow {
        match (run.mode, message) {
            (SyncMode::FullDepth, StreamMessage::Diff(event)) => self.apply_live_diff(run, event).await,
            (SyncMode::FixedDepth { .. }, StreamMessage::Snapshot(snapshot)) => {
                self.install_replacement(&snapshot);
                self.resync.record_clean_update();
                Flow::Continue
            }
            (mode, other) => {
                debug!(mode = %mode, update_id = other.last_update_id(), "Ignoring message for mode");
                Flow::Continue
            }
        }
    }

    async fn apply_live_diff(&self, run: &mut Run, event: DiffEvent) -> Flow {
        let now = self.clock.now_ms();
        let outcome = self.book.write().apply_diff(&event, now);

        match outcome {
            DiffOutcome::Applied => {
                self.counters.diffs_applied.fetch_add(1, Ordering::Relaxed);
                self.resync.record_clean_update();
                Flow::Continue
            }
            DiffOutcome::Stale => {
                self.counters.stale_discarded.fetch_add(1, Ordering::Relaxed);
                trace!(update_id = event.last_update_id, "Stale diff discarded");
                Flow::Continue
            }
            DiffOutcome::Uninitialized => {
                debug!(update_id = event.last_update_id, "Diff before baseline discarded");
                Flow::Continue
            }
            DiffOutcome::Gap { expected, received } => {
                self.counters.gaps_detected.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %run.symbol, expected, received, "Sequence gap detected");
                self.begin_resync(run).await
            }
        }
    }

    async fn begin_resync(&self, run: &mut Run) -> Flow {
        match self.resync.try_begin() {
            ResyncTicket::Begin(guard) => self.run_resync(run, guard).await,
            ResyncTicket::InFlight => Flow::Continue,
            ResyncTicket::Exhausted { attempts } => {
                error!(symbol = %run.symbol, attempts, "Giving up on order book");
                self.set_status(BookStatus::Failed);
                Flow::Exit
            }
        }
    }

    async fn run_resync(&self, run: &mut Run, guard: ResyncGuard) -> Flow {
        self.set_status(BookStatus::Resyncing);
        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        info!(symbol = %run.symbol, mode = %run.mode, "Resynchronizing order book");

        let result = match run.mode {
            SyncMode::FullDepth => {
                run.buffer.clear();
                self.rebaseline_full(run).await
            }
            SyncMode::FixedDepth { .. } => self.await_baseline(run).await,
        };
        drop(guard);

        match result {
            Ok(()) => {
                self.set_status(BookStatus::Synced);
                Flow::Continue
            }
            Err(SyncError::Stopped) => Flow::Exit,
            Err(e) => {
                error!(symbol = %run.symbol, error = %e, "Resync failed");
                self.set_status(BookStatus::Failed);
                Flow::Exit
            }
        }
    }

    /// Single writer for one running symbol
    async fn dispatch(self: Arc<Self>, mut run: Run, mut control: mpsc::UnboundedReceiver<Control>) {
        loop {
            let flow = tokio::select! {
                biased;
                _ = run.signals.session.cancelled() => Flow::Exit,
                Some(command) = control.recv() => match command {
                    Control::Resync(guard) => self.run_resync(&mut run, guard).await,
                },
                message = run.messages.recv() => match message {
                    Some(message) => self.handle_message(&mut run, message).await,
                    None => {
                        warn!(symbol = %run.symbol, "Depth stream ended");
                        self.set_status(BookStatus::Failed);
                        Flow::Exit
                    }
                },
            };
            if flow == Flow::Exit {
                break;
            }
        }
        debug!(symbol = %run.symbol, "Order book dispatcher stopped");
    }
}

// ============================================================================
// Order Book Synchronizer
// ============================================================================

/// Keeps a local ladder consistent with the exchange for one symbol at a time.
///
/// `start` subscribes, installs a baseline and returns once the book is
/// `Synced`. From then on a background dispatcher applies stream messages,
/// detects gaps and resyncs. Readers get copies through the accessors.
pub struct OrderBookSynchronizer {
    inner: Arc<Inner>,
    session: Mutex<Option<Session>>,
    next_generation: AtomicU64,
}

impl OrderBookSynchronizer {
    pub fn new(
        snapshots: Arc<dyn SnapshotProvider>,
        stream: Arc<dyn DepthStream>,
        clock: Arc<dyn Clock>,
        config: OrderBookConfig,
    ) -> Self {
        let (status, _) = watch::channel(BookStatus::Disconnected);
        let (transitions, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let resync = Arc::new(ResyncController::new(config.max_consecutive_resyncs));

        Self {
            inner: Arc::new(Inner {
                snapshots,
                stream,
                clock,
                config,
                book: RwLock::new(OrderBook::new("")),
                status,
                transitions,
                resync,
                counters: SyncCounters::default(),
            }),
            session: Mutex::new(None),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Subscribe and build the baseline. Returns once the book is `Synced`.
    pub async fn start(
        &self,
        symbol: &str,
        mode: SyncMode,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        if let SyncMode::FixedDepth { levels } = mode {
            if !FIXED_DEPTH_LEVELS.contains(&levels) {
                return Err(SyncError::InvalidDepth(levels));
            }
        }

        let symbol = normalize_symbol(symbol);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let session_token = CancellationToken::new();

        let previous = {
            let mut slot = self.session.lock();
            if !self.inner.status().is_idle() {
                return Err(SyncError::AlreadyRunning(symbol));
            }
            let previous = slot.replace(Session {
                generation,
                symbol: symbol.clone(),
                mode,
                cancel: session_token.clone(),
                subscription: None,
                control: None,
                task: None,
            });
            self.inner.set_status(BookStatus::Connecting);
            previous
        };

        // A Failed run leaves its subscription behind
        if let Some(previous) = previous {
            self.teardown(previous).await;
        }

        let book = match mode {
            SyncMode::FullDepth => OrderBook::new(&symbol),
            SyncMode::FixedDepth { levels } => OrderBook::new(&symbol).with_depth_cap(levels as usize),
        };
        *self.inner.book.write() = book;
        self.inner.resync.reset();
        self.inner.counters.reset();

        info!(symbol = %symbol, mode = %mode, "Starting order book synchronization");

        let signals = StopSignals {
            session: session_token,
            caller: cancel,
        };
        match self.bootstrap(generation, &symbol, mode, signals).await {
            Ok(run) => self.launch(generation, run),
            Err(e) => {
                self.abort_start(generation, &symbol, &e).await;
                Err(e)
            }
        }
    }

    async fn bootstrap(
        &self,
        generation: u64,
        symbol: &str,
        mode: SyncMode,
        signals: StopSignals,
    ) -> Result<Run, SyncError> {
        let interval = self.inner.config.update_interval_ms;
        let topics = vec![match mode {
            SyncMode::FullDepth => depth_diff_topic(symbol, interval),
            SyncMode::FixedDepth { levels } => partial_depth_topic(symbol, levels, interval),
        }];

        let subscription = tokio::select! {
            biased;
            err = signals.triggered() => return Err(err),
            result = self.inner.stream.subscribe(&topics) => result?,
        };

        if !self.record_subscription(generation, subscription.id) {
            // stop() ran while subscribing and never saw this handle
            if let Err(e) = self.inner.stream.unsubscribe(subscription.id).await {
                warn!(symbol = %symbol, error = %e, "Unsubscribe failed");
            }
            return Err(SyncError::Stopped);
        }
        debug!(symbol = %symbol, subscription = %subscription.id, topics = ?subscription.topics, "Subscribed");

        let mut run = Run {
            symbol: symbol.to_string(),
            mode,
            messages: subscription.messages,
            buffer: UpdateBuffer::new(self.inner.config.buffer_capacity),
            signals,
        };

        self.inner.set_status(BookStatus::Syncing);
        match mode {
            SyncMode::FullDepth => {
                let settle = Duration::from_millis(self.inner.config.settle_interval_ms);
                self.inner.pump(&mut run, tokio::time::sleep(settle)).await?;
                self.inner.rebaseline_full(&mut run).await?;
            }
            SyncMode::FixedDepth { .. } => self.inner.await_baseline(&mut run).await?,
        }
        Ok(run)
    }

    fn record_subscription(&self, generation: u64, id: SubscriptionId) -> bool {
        match self.session.lock().as_mut() {
            Some(session) if session.generation == generation => {
                session.subscription = Some(id);
                true
            }
            _ => false,
        }
    }

    fn launch(&self, generation: u64, run: Run) -> Result<(), SyncError> {
        let mut slot = self.session.lock();
        let session = match slot.as_mut() {
            Some(session) if session.generation == generation => session,
            _ => return Err(SyncError::Stopped),
        };

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.inner.set_status(BookStatus::Synced);
        info!(
            symbol = %run.symbol,
            last_update_id = self.inner.book.read().last_update_id(),
            "Order book synchronized"
        );

        session.control = Some(control_tx);
        session.task = Some(tokio::spawn(Arc::clone(&self.inner).dispatch(run, control_rx)));
        Ok(())
    }

    async fn abort_start(&self, generation: u64, symbol: &str, err: &SyncError) {
        let session = {
            let mut slot = self.session.lock();
            match slot.as_ref() {
                Some(session) if session.generation == generation => slot.take(),
                _ => None,
            }
        };
        // Otherwise stop() owns the cleanup
        let Some(session) = session else {
            return;
        };

        warn!(symbol = %symbol, error = %err, "Order book start failed");
        self.teardown(session).await;
        self.inner.book.write().reset();
        let status = match err {
            SyncError::ResyncExhausted(_) => BookStatus::Failed,
            _ => BookStatus::Disconnected,
        };
        self.inner.set_status(status);
    }

    async fn teardown(&self, mut session: Session) {
        session.cancel.cancel();
        session.control.take();

        if let Some(task) = session.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(symbol = %session.symbol, error = %e, "Dispatcher task failed");
                }
            }
        }
        if let Some(id) = session.subscription.take() {
            if let Err(e) = self.inner.stream.unsubscribe(id).await {
                warn!(symbol = %session.symbol, error = %e, "Unsubscribe failed");
            }
        }
        debug!(symbol = %session.symbol, mode = %session.mode, "Session torn down");
    }

    /// Unsubscribe, clear the ladder and go `Disconnected`. Safe from any state.
    pub async fn stop(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            info!(symbol = %session.symbol, "Stopping order book synchronization");
            self.teardown(session).await;
        }
        self.inner.book.write().reset();
        self.inner.set_status(BookStatus::Disconnected);
    }

    /// Ask the dispatcher to re-baseline. Returns false when none was scheduled.
    pub fn resync(&self) -> bool {
        if self.inner.status() != BookStatus::Synced {
            return false;
        }
        let slot = self.session.lock();
        let Some(control) = slot.as_ref().and_then(|session| session.control.as_ref()) else {
            return false;
        };

        match self.inner.resync.try_begin() {
            ResyncTicket::Begin(guard) => control.send(Control::Resync(guard)).is_ok(),
            ResyncTicket::InFlight => false,
            ResyncTicket::Exhausted { attempts } => {
                warn!(attempts, "Resync budget exhausted, request ignored");
                false
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn status(&self) -> BookStatus {
        self.inner.status()
    }

    /// Every transition after this call, in order. A receiver that falls more
    /// than the channel capacity behind sees `RecvError::Lagged`.
    pub fn status_changes(&self) -> broadcast::Receiver<BookStatus> {
        self.inner.transitions.subscribe()
    }

    /// Latest status only; intermediate transitions may be coalesced
    pub fn status_watch(&self) -> watch::Receiver<BookStatus> {
        self.inner.status.subscribe()
    }

    pub fn symbol(&self) -> Option<String> {
        self.session.lock().as_ref().map(|session| session.symbol.clone())
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.inner.book.read().best_bid()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.inner.book.read().best_ask()
    }

    pub fn depth(&self, levels: usize) -> BookDepth {
        self.inner.book.read().depth(levels)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        self.inner.book.read().mid_price()
    }

    pub fn spread(&self) -> Option<Decimal> {
        self.inner.book.read().spread()
    }

    pub fn last_update_id(&self) -> u64 {
        self.inner.book.read().last_update_id()
    }

    pub fn resync_stats(&self) -> ResyncStats {
        self.inner.resync.get_stats()
    }

    pub fn summary(&self) -> SynchronizerSummary {
        let (symbol, mode) = match self.session.lock().as_ref() {
            Some(session) => (Some(session.symbol.clone()), Some(session.mode)),
            None => (None, None),
        };
        let counters = &self.inner.counters;

        SynchronizerSummary {
            symbol,
            mode,
            status: self.inner.status(),
            book: self.inner.book.read().get_summary(),
            diffs_applied: counters.diffs_applied.load(Ordering::Relaxed),
            stale_discarded: counters.stale_discarded.load(Ordering::Relaxed),
            gaps_detected: counters.gaps_detected.load(Ordering::Relaxed),
            resyncs: counters.resyncs.load(Ordering::Relaxed),
            replacements: counters.replacements.load(Ordering::Relaxed),
            buffer_overflows: counters.buffer_overflows.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OrderBookSynchronizer {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            if let Some(task) = session.task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::layer1::collaborators::Subscription;
    use crate::layer1::rest_client::RestClientError;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakeStream {
        queued: Mutex<Vec<StreamMessage>>,
        sender: Mutex<Option<mpsc::UnboundedSender<StreamMessage>>>,
        topics: Mutex<Vec<String>>,
        unsubscribes: AtomicU64,
    }

    impl FakeStream {
        fn with(messages: Vec<StreamMessage>) -> Arc<Self> {
            let stream = Self::default();
            *stream.queued.lock() = messages;
            Arc::new(stream)
        }

        fn push(&self, message: StreamMessage) {
            if let Some(sender) = self.sender.lock().as_ref() {
                let _ = sender.send(message);
            }
        }

        fn close(&self) {
            self.sender.lock().take();
        }

        fn unsubscribes(&self) -> u64 {
            self.unsubscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DepthStream for FakeStream {
        async fn subscribe(&self, topics: &[String]) -> Result<Subscription, TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            for message in self.queued.lock().drain(..) {
                let _ = tx.send(message);
            }
            *self.sender.lock() = Some(tx);
            *self.topics.lock() = topics.to_vec();
            Ok(Subscription {
                id: SubscriptionId::new(),
                topics: topics.to_vec(),
                messages: rx,
            })
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), TransportError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.sender.lock().take();
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedSnapshots {
        responses: Mutex<VecDeque<DepthSnapshot>>,
        hang: bool,
        calls: AtomicU64,
    }

    #[async_trait]
    impl SnapshotProvider for ScriptedSnapshots {
        async fn fetch_order_book_snapshot(
            &self,
            _symbol: &str,
            _depth_limit: u32,
        ) -> Result<DepthSnapshot, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.responses
                .lock()
                .pop_front()
                .ok_or(TransportError::Rest(RestClientError::MaxRetries))
        }
    }

    fn replacement(last_update_id: u64, bid: Decimal) -> StreamMessage {
        StreamMessage::Snapshot(DepthSnapshot {
            symbol: "BTCTRY".to_string(),
            last_update_id,
            bids: vec![PriceLevel::new(bid, dec!(1))],
            asks: vec![PriceLevel::new(bid + dec!(1), dec!(1))],
        })
    }

    fn synchronizer(stream: Arc<FakeStream>, snapshots: Arc<ScriptedSnapshots>) -> OrderBookSynchronizer {
        OrderBookSynchronizer::new(
            snapshots,
            stream,
            Arc::new(ManualClock::new(1_000)),
            OrderBookConfig::default(),
        )
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    const FIXED: SyncMode = SyncMode::FixedDepth { levels: 10 };

    #[test]
    fn test_mode_display() {
        assert_eq!(SyncMode::FullDepth.to_string(), "full-depth");
        assert_eq!(FIXED.to_string(), "fixed-depth(10)");
    }

    #[tokio::test]
    async fn test_fixed_depth_start_uses_first_message() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream.clone(), Arc::new(ScriptedSnapshots::default()));

        sync.start("btc_try", FIXED, CancellationToken::new()).await.unwrap();

        assert_eq!(sync.status(), BookStatus::Synced);
        assert_eq!(sync.last_update_id(), 7);
        assert_eq!(sync.best_bid(), Some(PriceLevel::new(dec!(100), dec!(1))));
        assert_eq!(sync.symbol().as_deref(), Some("BTCTRY"));
        assert_eq!(*stream.topics.lock(), vec!["btctry@depth10".to_string()]);
    }

    #[tokio::test]
    async fn test_unsupported_depth_is_rejected() {
        let sync = synchronizer(FakeStream::with(vec![]), Arc::new(ScriptedSnapshots::default()));
        let result = sync
            .start("BTCTRY", SyncMode::FixedDepth { levels: 7 }, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SyncError::InvalidDepth(7))));
        assert_eq!(sync.status(), BookStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream, Arc::new(ScriptedSnapshots::default()));

        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();
        let again = sync.start("BTCTRY", FIXED, CancellationToken::new()).await;
        assert!(matches!(again, Err(SyncError::AlreadyRunning(_))));
        assert_eq!(sync.status(), BookStatus::Synced);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream.clone(), Arc::new(ScriptedSnapshots::default()));

        sync.stop().await;
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();
        sync.stop().await;
        sync.stop().await;

        assert_eq!(sync.status(), BookStatus::Disconnected);
        assert_eq!(stream.unsubscribes(), 1);
        assert_eq!(sync.best_bid(), None);
        assert_eq!(sync.symbol(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_before_synced_tears_down() {
        let stream = FakeStream::with(vec![]);
        let snapshots = Arc::new(ScriptedSnapshots {
            hang: true,
            ..ScriptedSnapshots::default()
        });
        let sync = Arc::new(synchronizer(stream.clone(), snapshots.clone()));
        let cancel = CancellationToken::new();

        let task = {
            let sync = sync.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.start("BTCTRY", SyncMode::FullDepth, cancel).await })
        };

        eventually(|| snapshots.calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(sync.status(), BookStatus::Syncing);
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(sync.status(), BookStatus::Disconnected);
        assert_eq!(stream.unsubscribes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_resync_waits_for_next_replacement() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream.clone(), Arc::new(ScriptedSnapshots::default()));
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();

        assert!(sync.resync());
        eventually(|| sync.status() == BookStatus::Resyncing).await;
        assert!(!sync.resync());

        stream.push(replacement(9, dec!(101)));
        eventually(|| sync.status() == BookStatus::Synced).await;
        assert_eq!(sync.last_update_id(), 9);
        assert_eq!(sync.summary().resyncs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_changes_report_every_transition() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream.clone(), Arc::new(ScriptedSnapshots::default()));
        let mut changes = sync.status_changes();
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(status) = changes.try_recv() {
            seen.push(status);
        }
        assert_eq!(seen.first(), Some(&BookStatus::Connecting));
        assert_eq!(seen.last(), Some(&BookStatus::Synced));

        assert!(sync.resync());
        assert_eq!(changes.recv().await.unwrap(), BookStatus::Resyncing);
        stream.push(replacement(9, dec!(101)));
        assert_eq!(changes.recv().await.unwrap(), BookStatus::Synced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_depth_resync_timeout_fails() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream, Arc::new(ScriptedSnapshots::default()));
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();

        assert!(sync.resync());
        eventually(|| sync.status() == BookStatus::Failed).await;
        // last-known-good ladder is kept
        assert_eq!(sync.last_update_id(), 7);
    }

    #[tokio::test]
    async fn test_stream_end_fails_and_restart_recovers() {
        let stream = FakeStream::with(vec![replacement(7, dec!(100))]);
        let sync = synchronizer(stream.clone(), Arc::new(ScriptedSnapshots::default()));
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();

        stream.close();
        let mut changes = sync.status_watch();
        tokio::time::timeout(
            Duration::from_secs(5),
            changes.wait_for(|status| *status == BookStatus::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        *stream.queued.lock() = vec![replacement(20, dec!(105))];
        sync.start("BTCTRY", FIXED, CancellationToken::new()).await.unwrap();
        assert_eq!(sync.status(), BookStatus::Synced);
        assert_eq!(sync.last_update_id(), 20);
        assert_eq!(stream.unsubscribes(), 1);
    }
}
