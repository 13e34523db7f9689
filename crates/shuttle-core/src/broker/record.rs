//! Task record: state + envelope.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::TaskState;
use crate::domain::{DeadLetterReason, LeaseId, TaskEnvelope};

/// Metadata + envelope for a task held by the in-memory broker.
///
/// - This is the "single source of truth" for task state.
/// - Ready / scheduled structures hold TaskId only.
/// - All state transitions happen here.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub state: TaskState,

    /// Outstanding lease while `Leased`.
    pub lease: Option<LeaseId>,

    /// Last failure message (if any).
    pub last_error: Option<String>,

    /// Set once dead-lettered.
    pub dead_reason: Option<DeadLetterReason>,
    pub dead_at: Option<DateTime<Utc>>,

    /// When to retry next (for Scheduled state).
    pub next_run_at: Option<Instant>,

    pub updated_at: Instant,
}

impl TaskRecord {
    pub fn new(envelope: TaskEnvelope) -> Self {
        Self {
            envelope,
            state: TaskState::Pending,
            lease: None,
            last_error: None,
            dead_reason: None,
            dead_at: None,
            next_run_at: None,
            updated_at: Instant::now(),
        }
    }

    pub fn mark_leased(&mut self, lease: LeaseId) {
        self.state = TaskState::Leased;
        self.lease = Some(lease);
        self.updated_at = Instant::now();
    }

    /// Schedule another delivery. Bumps `attempt` on the envelope.
    pub fn schedule_retry(&mut self, next_run_at: Instant, error: String) {
        self.envelope = self.envelope.clone().redelivered();
        self.state = TaskState::Scheduled;
        self.lease = None;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.updated_at = Instant::now();
    }

    pub fn mark_dead(&mut self, reason: DeadLetterReason, at: DateTime<Utc>) {
        self.state = TaskState::Dead;
        self.lease = None;
        self.last_error = Some(reason.to_string());
        self.dead_reason = Some(reason);
        self.dead_at = Some(at);
        self.updated_at = Instant::now();
    }

    /// Dead -> Pending with `attempt` back at 0, so the handler gets a full budget.
    pub fn revive(&mut self) {
        self.envelope = self.envelope.clone().reset_attempts();
        self.last_error = None;
        self.requeue();
    }

    /// Move back to Pending (retry due, or manual requeue of a dead task).
    pub fn requeue(&mut self) {
        self.state = TaskState::Pending;
        self.next_run_at = None;
        self.dead_reason = None;
        self.dead_at = None;
        self.updated_at = Instant::now();
    }
}
