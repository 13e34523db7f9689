//! Broker module: the durable queueing capability the dispatcher runs on,
//! plus an in-memory implementation and an observer decorator.
//!
//! # 設計原則
//! - Broker が状態遷移（Pending -> Leased -> ...）を管理する
//! - Dispatcher は handler を実行して結果（ack / fail）を報告するだけ
//! - pop は原子的: 同じ envelope を同時に 2 つの slot に渡さない
//!   （同じ Broker を共有する別プロセスの slot も含む）

mod memory;
mod observer;
mod record;
mod state;

pub use memory::{InMemoryBroker, InMemoryBrokerConfig};
pub use observer::{BrokerObserver, MetricsObserver, MetricsSnapshot, ObservedBroker, TracingObserver};
pub use record::TaskRecord;
pub use state::{BrokerCounts, TaskState};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BrokerError, DeadLetterReason, LeaseId, QueueName, TaskEnvelope, TaskId};

/// Proof of one delivery. Settle it exactly once with `ack` or `fail`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    lease_id: LeaseId,
    task_id: TaskId,
}

impl LeaseToken {
    pub fn new(lease_id: LeaseId, task_id: TaskId) -> Self {
        Self { lease_id, task_id }
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

/// A popped envelope and the lease that guards it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub lease: LeaseToken,
    pub envelope: TaskEnvelope,
}

/// How a failed delivery should be settled.
///
/// `Retry` is the broker-level `retry = true`, `DeadLetter` is `retry = false`.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Redeliver after `delay` with `attempt + 1`.
    Retry { delay: Duration, error: String },

    /// Move to the dead-letter set.
    DeadLetter { reason: DeadLetterReason },
}

impl Disposition {
    pub fn is_retry(&self) -> bool {
        matches!(self, Disposition::Retry { .. })
    }
}

/// A dead-lettered envelope, for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: TaskEnvelope,
    pub reason: DeadLetterReason,
    pub failed_at: DateTime<Utc>,
}

/// Broker port (interface).
///
/// Implementations must be safe for concurrent use by every worker slot.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably append an envelope to its queue. Atomic per call.
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), BrokerError>;

    /// Lease the next eligible envelope.
    ///
    /// `queues` is in priority order for this pull: the first non-empty queue
    /// wins. Waits up to `timeout` and returns `Ok(None)` when nothing became
    /// eligible. Must be cancel safe: dropping the future before it completes
    /// must not issue a lease.
    async fn pop(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Mark success and remove the envelope.
    async fn ack(&self, lease: &LeaseToken) -> Result<(), BrokerError>;

    /// Mark failure; the disposition decides retry or dead-letter.
    async fn fail(&self, lease: &LeaseToken, disposition: Disposition) -> Result<(), BrokerError>;

    /// Extend a lease that is still being worked on.
    async fn renew(&self, lease: &LeaseToken) -> Result<(), BrokerError> {
        let _ = lease;
        Ok(())
    }

    async fn counts(&self) -> Result<BrokerCounts, BrokerError>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Release connections. Later calls fail with `BrokerError::Closed`.
    async fn close(&self) {}
}
