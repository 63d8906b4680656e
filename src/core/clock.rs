// Clock abstraction
// Anything that reads wall time takes an Arc<dyn Clock> instead of calling SystemTime directly

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Local wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        local_now_ms()
    }
}

/// Local clock shifted by the offset measured against the exchange.
///
/// The offset is written by `TimeSynchronizer`; readers only see a plain clock.
#[derive(Debug, Default)]
pub struct ServerClock {
    offset_ms: RwLock<f64>,
    manual_offset_ms: f64,
}

impl ServerClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed extra offset applied on top of the measured one
    pub fn with_manual_offset(manual_offset_ms: f64) -> Self {
        Self {
            offset_ms: RwLock::new(0.0),
            manual_offset_ms,
        }
    }

    pub fn offset_ms(&self) -> f64 {
        *self.offset_ms.read()
    }

    pub fn set_offset_ms(&self, offset_ms: f64) {
        *self.offset_ms.write() = offset_ms;
    }
}

impl Clock for ServerClock {
    fn now_ms(&self) -> u64 {
        let adjusted = local_now_ms() as f64 + *self.offset_ms.read() + self.manual_offset_ms;
        adjusted.max(0.0) as u64
    }
}

/// Clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub(crate) fn local_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_clock_applies_offset() {
        let clock = ServerClock::new();
        let before = local_now_ms();
        clock.set_offset_ms(60_000.0);
        let shifted = clock.now_ms();
        assert!(shifted >= before + 60_000);
        assert!(shifted < before + 61_000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ms(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
