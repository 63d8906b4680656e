// Update Buffer
// Holds diff events that arrive before the ladder has a baseline, then replays them

use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

use crate::core::types::DiffEvent;
use crate::layer2::orderbook::{DiffOutcome, LadderOps};

/// Result of replaying the buffer onto a freshly installed baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Ladder is consistent; `applied` buffered events were replayed, `discarded` predated the baseline
    Ready { applied: usize, discarded: usize },
    /// The earliest usable event does not bridge the baseline
    Gap { baseline_id: u64, first_update_id: u64 },
}

impl fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reconciliation::Ready { applied, discarded } => {
                write!(f, "Ready(applied={}, discarded={})", applied, discarded)
            }
            Reconciliation::Gap { baseline_id, first_update_id } => {
                write!(f, "Gap(baseline={}, first={})", baseline_id, first_update_id)
            }
        }
    }
}

/// Bounded FIFO of pending diff events, in arrival order.
///
/// When full, the oldest event is dropped. A dropped event that mattered shows
/// up as a gap during reconciliation.
#[derive(Debug)]
pub struct UpdateBuffer {
    events: VecDeque<DiffEvent>,
    capacity: usize,
    overflowed: u64,
}

impl UpdateBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            overflowed: 0,
        }
    }

    /// Append an event. Returns false when the oldest event had to be dropped.
    pub fn push(&mut self, event: DiffEvent) -> bool {
        let mut kept_all = true;
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.overflowed += 1;
            kept_all = false;
        }
        self.events.push_back(event);
        kept_all
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Replay buffered events onto `ladder`, which must already hold its new baseline.
    ///
    /// Events ending at or before the baseline are discarded. The first
    /// remaining event must satisfy `first <= baseline + 1 <= last`; every later
    /// one must follow without a gap. The buffer is empty afterwards either way.
    pub fn reconcile<L: LadderOps>(&mut self, ladder: &mut L, now_ms: u64) -> Reconciliation {
        let baseline_id = ladder.last_update_id();
        let mut discarded = 0usize;
        let mut applied = 0usize;
        let mut bridged = false;

        while let Some(event) = self.events.pop_front() {
            if !bridged {
                if event.last_update_id <= baseline_id {
                    discarded += 1;
                    continue;
                }
                if event.first_update_id > baseline_id.saturating_add(1) {
                    warn!(
                        baseline_id,
                        first_update_id = event.first_update_id,
                        "Buffered events do not bridge the snapshot"
                    );
                    self.events.clear();
                    return Reconciliation::Gap {
                        baseline_id,
                        first_update_id: event.first_update_id,
                    };
                }
                bridged = true;
            }

            match ladder.apply_diff(&event, now_ms) {
                DiffOutcome::Applied => applied += 1,
                DiffOutcome::Stale => discarded += 1,
                DiffOutcome::Gap { expected, received } => {
                    warn!(expected, received, "Gap inside buffered events");
                    self.events.clear();
                    return Reconciliation::Gap {
                        baseline_id,
                        first_update_id: received,
                    };
                }
                DiffOutcome::Uninitialized => {
                    // reconcile is only called after a baseline is installed
                    discarded += 1;
                }
            }
        }

        debug!(baseline_id, applied, discarded, "Update buffer reconciled");
        Reconciliation::Ready { applied, discarded }
    }
}
