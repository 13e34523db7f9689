//! TaskContext - handler に渡される実行コンテキスト

use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::domain::{QueueName, TaskEnvelope, TaskId, TaskType};

/// Metadata of the delivery being handled, plus a cooperative cancellation
/// signal.
///
/// The token is cancelled when the dispatcher starts draining. Handlers that
/// run long should check it and return early (usually with a retryable
/// error so the task is redelivered).
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    queue: QueueName,
    attempt: u32,
    enqueued_at: DateTime<Utc>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(envelope: &TaskEnvelope, cancel: CancellationToken) -> Self {
        Self {
            task_id: envelope.task_id(),
            task_type: envelope.task_type().clone(),
            queue: envelope.queue().clone(),
            attempt: envelope.attempt(),
            enqueued_at: envelope.enqueued_at(),
            cancel,
        }
    }

    /// Context that is never cancelled. Handy for calling handlers directly.
    pub fn detached(envelope: &TaskEnvelope) -> Self {
        Self::new(envelope, CancellationToken::new())
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// 0 on the first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the dispatcher asks handlers to wind down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}
