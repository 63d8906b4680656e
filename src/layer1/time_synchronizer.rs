// Time Synchronizer for Binance TR - Pure Rust
// NTP-style offset measurement with network latency compensation
// Feeds the injected ServerClock instead of a process-wide offset

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::clock::{local_now_ms, ServerClock};
use crate::core::config::TimeSyncConfig;
use crate::layer1::collaborators::{ServerTimeSource, TransportError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TimeSyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Sync failed: no samples taken")]
    NoSamples,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TimeSyncStats {
    pub offset_ms: f64,
    pub measured_offset_ms: f64,
    pub last_sync_ms: Option<u64>,
    pub last_latency_ms: f64,
    pub sync_count: u64,
    pub sync_failures: u64,
}

impl fmt::Display for TimeSyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TimeSyncStats(offset={:.1}ms, measured={:.1}ms, latency={:.1}ms, syncs={}, failures={})",
            self.offset_ms, self.measured_offset_ms, self.last_latency_ms,
            self.sync_count, self.sync_failures
        )
    }
}

// ============================================================================
// Time Synchronizer
// ============================================================================

/// Keeps a `ServerClock` aligned with the exchange.
///
/// Each sync takes several samples and uses the median offset, assuming the
/// server stamped its reply at the midpoint of the round trip. Offsets in
/// `[0, no_adjust_below_ms)` are treated as zero.
pub struct TimeSynchronizer {
    source: Arc<dyn ServerTimeSource>,
    clock: Arc<ServerClock>,
    config: TimeSyncConfig,

    stats: RwLock<TimeSyncStats>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeSynchronizer {
    pub fn new(source: Arc<dyn ServerTimeSource>, clock: Arc<ServerClock>, config: TimeSyncConfig) -> Self {
        info!(
            enabled = config.enabled,
            interval_secs = config.recalculation_interval_secs,
            "Time synchronizer initialized"
        );

        Self {
            source,
            clock,
            config,
            stats: RwLock::new(TimeSyncStats::default()),
            sync_task: Mutex::new(None),
        }
    }

    /// Build with a fresh `ServerClock` carrying the configured manual offset
    pub fn from_config(source: Arc<dyn ServerTimeSource>, config: &TimeSyncConfig) -> Self {
        let clock = Arc::new(ServerClock::with_manual_offset(config.manual_offset_ms));
        Self::new(source, clock, config.clone())
    }

    pub fn clock(&self) -> Arc<ServerClock> {
        self.clock.clone()
    }

    /// Initial sync, then periodic recalculation in the background
    pub async fn start(self: &Arc<Self>) -> Result<(), TimeSyncError> {
        if !self.config.enabled {
            info!("Time synchronization disabled");
            return Ok(());
        }

        self.sync_time().await?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.recalculation_interval_secs);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = this.sync_time().await {
                    warn!(error = %e, "Periodic time sync failed");
                }
            }
        });

        if let Some(previous) = self.sync_task.lock().replace(handle) {
            previous.abort();
        }
        info!("Time synchronization started");
        Ok(())
    }

    /// Stop time synchronization
    pub fn stop(&self) {
        if let Some(handle) = self.sync_task.lock().take() {
            handle.abort();
            info!("Time synchronization stopped");
        }
    }

    /// Measure the offset and apply it to the clock. Returns the applied offset.
    pub async fn sync_time(&self) -> Result<f64, TimeSyncError> {
        match self.measure().await {
            Ok((offset, latency)) => Ok(self.apply(offset, latency)),
            Err(e) => {
                self.stats.write().sync_failures += 1;
                Err(e)
            }
        }
    }

    async fn measure(&self) -> Result<(f64, f64), TimeSyncError> {
        let samples = self.config.samples.max(1);
        let mut offsets = Vec::with_capacity(samples as usize);
        let mut latencies = Vec::with_capacity(samples as usize);

        for i in 0..samples {
            let start_local = local_now_ms() as f64;
            let server_time = self.source.server_time_ms().await? as f64;
            let end_local = local_now_ms() as f64;

            let latency = (end_local - start_local) / 2.0;
            latencies.push(latency);
            offsets.push(server_time - (start_local + latency));

            if i + 1 < samples {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if offsets.is_empty() {
            return Err(TimeSyncError::NoSamples);
        }

        offsets.sort_by(f64::total_cmp);
        latencies.sort_by(f64::total_cmp);
        Ok((median(&offsets), median(&latencies)))
    }

    fn apply(&self, measured: f64, latency: f64) -> f64 {
        let applied = effective_offset(measured, self.config.no_adjust_below_ms);

        let mut stats = self.stats.write();
        if stats.sync_count > 0 {
            let drift = (measured - stats.measured_offset_ms).abs();
            if drift > self.config.drift_threshold_ms {
                warn!(
                    drift_ms = drift,
                    previous_ms = stats.measured_offset_ms,
                    current_ms = measured,
                    "Significant time drift detected"
                );
            }
        }

        self.clock.set_offset_ms(applied);
        stats.offset_ms = applied;
        stats.measured_offset_ms = measured;
        stats.last_latency_ms = latency;
        stats.last_sync_ms = Some(local_now_ms());
        stats.sync_count += 1;

        debug!(
            measured_ms = format!("{:.1}", measured),
            applied_ms = format!("{:.1}", applied),
            latency_ms = format!("{:.1}", latency),
            "Time synchronized"
        );
        applied
    }

    pub fn get_offset_ms(&self) -> f64 {
        self.clock.offset_ms()
    }

    pub fn get_stats(&self) -> TimeSyncStats {
        self.stats.read().clone()
    }
}

impl Drop for TimeSynchronizer {
    fn drop(&mut self) {
        if let Some(handle) = self.sync_task.lock().take() {
            handle.abort();
        }
        debug!("TimeSynchronizer dropped");
    }
}

/// Small positive offsets are within what the exchange tolerates
fn effective_offset(measured: f64, no_adjust_below_ms: f64) -> f64 {
    if measured >= 0.0 && measured < no_adjust_below_ms {
        0.0
    } else {
        measured
    }
}

fn median(values: &[f64]) -> f64 {
    let len = values.len();
    if len == 0 {
        return 0.0;
    }
    if len % 2 == 0 {
        (values[len / 2 - 1] + values[len / 2]) / 2.0
    } else {
        values[len / 2]
    }
}
