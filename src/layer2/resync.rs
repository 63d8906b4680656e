// Resync Controller
// At most one re-baseline in flight per book, bounded by consecutive attempts

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of asking for a resync
#[derive(Debug)]
pub enum ResyncTicket {
    /// Caller owns the resync until the guard is dropped
    Begin(ResyncGuard),
    /// Another resync is running and will re-baseline anyway
    InFlight,
    /// Too many resyncs without a clean live update in between
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct ResyncStats {
    pub started: u64,
    pub skipped_in_flight: u64,
    pub consecutive: u32,
    pub in_flight: bool,
}

impl fmt::Display for ResyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResyncStats(started={}, skipped={}, consecutive={}, in_flight={})",
            self.started, self.skipped_in_flight, self.consecutive, self.in_flight
        )
    }
}

#[derive(Debug)]
pub struct ResyncController {
    in_flight: AtomicBool,
    consecutive: AtomicU32,
    max_consecutive: u32,
    started: AtomicU64,
    skipped_in_flight: AtomicU64,
}

impl ResyncController {
    pub fn new(max_consecutive: u32) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            consecutive: AtomicU32::new(0),
            max_consecutive,
            started: AtomicU64::new(0),
            skipped_in_flight: AtomicU64::new(0),
        }
    }

    pub fn try_begin(self: &Arc<Self>) -> ResyncTicket {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
            debug!("Resync already in flight, skipping");
            return ResyncTicket::InFlight;
        }

        match self.note_attempt() {
            Ok(attempt) => {
                self.started.fetch_add(1, Ordering::Relaxed);
                debug!(attempt, "Resync started");
                ResyncTicket::Begin(ResyncGuard {
                    controller: Arc::clone(self),
                })
            }
            Err(attempts) => {
                self.in_flight.store(false, Ordering::Release);
                ResyncTicket::Exhausted { attempts }
            }
        }
    }

    /// Count one more re-baseline attempt. `Err` carries the count once the limit is passed.
    pub fn note_attempt(&self) -> Result<u32, u32> {
        let attempt = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > self.max_consecutive {
            warn!(attempt, max = self.max_consecutive, "Resync attempts exhausted");
            Err(attempt)
        } else {
            Ok(attempt)
        }
    }

    /// A live update applied cleanly; the book is healthy again
    pub fn record_clean_update(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    pub fn get_stats(&self) -> ResyncStats {
        ResyncStats {
            started: self.started.load(Ordering::Relaxed),
            skipped_in_flight: self.skipped_in_flight.load(Ordering::Relaxed),
            consecutive: self.consecutive.load(Ordering::Acquire),
            in_flight: self.is_in_flight(),
        }
    }
}

/// Marks a resync as running; dropping it lets the next one start
#[derive(Debug)]
pub struct ResyncGuard {
    controller: Arc<ResyncController>,
}

impl Drop for ResyncGuard {
    fn drop(&mut self) {
        self.controller.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_one_resync_in_flight() {
        let controller = Arc::new(ResyncController::new(3));

        let guard = match controller.try_begin() {
            ResyncTicket::Begin(guard) => guard,
            other => panic!("expected Begin, got {:?}", other),
        };
        assert!(controller.is_in_flight());
        assert!(matches!(controller.try_begin(), ResyncTicket::InFlight));

        drop(guard);
        assert!(!controller.is_in_flight());
        assert!(matches!(controller.try_begin(), ResyncTicket::Begin(_)));

        let stats = controller.get_stats();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.skipped_in_flight, 1);
    }

    #[test]
    fn test_exhaustion_after_consecutive_attempts() {
        let controller = Arc::new(ResyncController::new(2));

        assert!(matches!(controller.try_begin(), ResyncTicket::Begin(_)));
        assert!(matches!(controller.try_begin(), ResyncTicket::Begin(_)));
        assert!(matches!(
            controller.try_begin(),
            ResyncTicket::Exhausted { attempts: 3 }
        ));
        assert!(!controller.is_in_flight());
    }

    #[test]
    fn test_clean_update_resets_budget() {
        let controller = Arc::new(ResyncController::new(1));

        assert!(matches!(controller.try_begin(), ResyncTicket::Begin(_)));
        controller.record_clean_update();
        assert!(matches!(controller.try_begin(), ResyncTicket::Begin(_)));
        assert_eq!(controller.get_stats().consecutive, 1);
    }
}
