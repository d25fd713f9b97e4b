//! Quiescent-state based reclamation coordination (component: QSBR).
//!
//! qp.c defers freeing any chunk that might still be reachable from a
//! reader until its RCU-style grace period has fully drained. crossbeam
//! doesn't ship a ready-made QSBR primitive, so this module defines the
//! minimal interface a host runtime implements (`ReclamationCoordinator`)
//! and a `crossbeam::queue::SegQueue`-backed worklist that `compact.rs`
//! schedules chunks on. A trivial single-threaded coordinator is
//! provided for tests and for hosts that only ever run one writer
//! thread and never hand a `Reader`/`Snapshot` to another thread.
//!
//! Design note: rather than one implicit process-wide queue, the
//! worklist is an explicit `Arc<Worklist>` the caller creates and can
//! share across however many `MultiTrie`s it runs — still "global" in
//! the sense qp.c means (one grace-period domain can cover many tries),
//! but without hidden global mutable state.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::SegQueue;

/// A host-provided quiescence tracker.
pub trait ReclamationCoordinator: Send + Sync {
    /// A monotonically increasing counter, advanced by the host
    /// whenever it can promise no reader will newly pin a view older
    /// than the new value.
    fn phase(&self) -> u64;

    /// The oldest phase any currently-pinned reader might still
    /// observe. A chunk tagged with a phase strictly less than this is
    /// safe to reclaim.
    fn oldest_active_phase(&self) -> u64;
}

pub(crate) struct PendingReclaim {
    pub(crate) phase: u64,
    pub(crate) chunk: u32,
}

/// Chunks awaiting deferred reclamation once their tagged phase drains.
pub struct Worklist {
    queue: SegQueue<PendingReclaim>,
}

impl Worklist {
    pub fn new() -> Self {
        Worklist { queue: SegQueue::new() }
    }

    pub(crate) fn push(&self, item: PendingReclaim) {
        self.queue.push(item);
    }

    /// Pop every entry whose phase has fully drained according to
    /// `coordinator`, returning their chunk ids; re-queue the rest.
    pub(crate) fn drain_ready(&self, coordinator: &dyn ReclamationCoordinator) -> Vec<u32> {
        let oldest = coordinator.oldest_active_phase();
        let mut ready = Vec::new();
        let mut deferred = Vec::new();
        while let Some(item) = self.queue.pop() {
            if item.phase < oldest {
                ready.push(item.chunk);
            } else {
                deferred.push(item);
            }
        }
        for item in deferred {
            self.queue.push(item);
        }
        ready
    }
}

impl Default for Worklist {
    fn default() -> Self {
        Self::new()
    }
}

/// A trivial coordinator with no concept of in-flight readers: every
/// phase is immediately its own "oldest active" phase, so nothing is
/// ever deferred. Appropriate for single-threaded tests, or for any
/// host that never shares a `Reader`/`Snapshot` across threads.
pub struct ImmediateReclaimer {
    phase: AtomicU64,
}

impl ImmediateReclaimer {
    pub fn new() -> Self {
        ImmediateReclaimer { phase: AtomicU64::new(1) }
    }

    /// Advance to a new phase, as if every previously pinned reader had
    /// just gone quiescent.
    pub fn advance(&self) -> u64 {
        self.phase.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for ImmediateReclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclamationCoordinator for ImmediateReclaimer {
    fn phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }

    fn oldest_active_phase(&self) -> u64 {
        self.phase.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_reclaimer_drains_everything_after_advance() {
        let worklist = Worklist::new();
        let coordinator = ImmediateReclaimer::new();
        worklist.push(PendingReclaim { phase: coordinator.phase(), chunk: 7 });
        coordinator.advance();
        assert_eq!(worklist.drain_ready(&coordinator), vec![7]);
    }
}
