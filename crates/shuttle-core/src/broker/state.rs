//! Task state machine inside a broker.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Leased -> (acked, record removed)
/// - Pending -> Leased -> Scheduled -> Pending (loop until max_attempts)
/// - Pending -> Leased -> Dead
/// - Leased -> Pending (lease expired, attempt incremented)
/// - Dead -> Pending (manual requeue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Ready to be popped.
    Pending,

    /// Popped by a worker slot, lease outstanding.
    Leased,

    /// Waiting for a retry backoff to elapse.
    Scheduled,

    /// Dead-lettered. Kept for inspection.
    Dead,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Dead)
    }

    /// Is this task eligible for pop?
    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Pending)
    }
}

/// Broker-wide counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCounts {
    pub pending: usize,
    pub leased: usize,
    pub scheduled: usize,
    pub dead: usize,
    /// Total acknowledged since the broker was created.
    pub acked: u64,
}

impl BrokerCounts {
    /// Tasks that still need a handler to run.
    pub fn outstanding(&self) -> usize {
        self.pending + self.leased + self.scheduled
    }
}
