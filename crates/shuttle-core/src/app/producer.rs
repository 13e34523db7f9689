//! Producer - タスク投入の入口
//!
//! 上流（HTTP ハンドラなど）から見えるのはこの型だけです。
//! enqueue は Broker への push を 1 回行うだけで、handler は実行しません。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::broker::Broker;
use crate::domain::{EnqueueError, QueueName, TaskEnvelope, TaskId, TaskType};
use crate::ports::{Clock, IdGenerator};
use crate::typed::{PayloadCodec, Task};

/// One submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub task_type: TaskType,
    pub queue: QueueName,
    pub payload: Vec<u8>,
}

impl EnqueueRequest {
    pub fn new(
        task_type: impl Into<TaskType>,
        queue: impl Into<QueueName>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            queue: queue.into(),
            payload: payload.into(),
        }
    }
}

/// Shared enqueue handle. Clones share the broker and the closed flag.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    queues: Arc<HashSet<QueueName>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    closed: Arc<AtomicBool>,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: impl IntoIterator<Item = QueueName>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            queues: Arc::new(queues.into_iter().collect()),
            ids,
            clock,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Persist one envelope and return its id. Never waits for execution.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<TaskId, EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        if !request.task_type.is_valid() {
            return Err(EnqueueError::InvalidType(request.task_type));
        }
        if !self.queues.contains(&request.queue) {
            return Err(EnqueueError::InvalidQueue(request.queue));
        }

        let task_id = self.ids.generate_task_id();
        let envelope = TaskEnvelope::new(
            task_id,
            request.task_type,
            request.queue,
            request.payload,
            self.clock.now(),
        );
        let task_type = envelope.task_type().clone();
        let queue = envelope.queue().clone();

        self.broker.push(envelope).await?;

        tracing::debug!(%task_id, %task_type, %queue, "task enqueued");
        Ok(task_id)
    }

    /// Encode a typed task as JSON and enqueue it under `T::TYPE`.
    pub async fn enqueue_task<T: Task>(
        &self,
        queue: impl Into<QueueName>,
        task: &T,
    ) -> Result<TaskId, EnqueueError> {
        let payload = PayloadCodec::encode(task)?;
        self.enqueue(EnqueueRequest::new(T::TYPE, queue, payload))
            .await
    }

    /// Reject every later enqueue on this handle and all its clones.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("producer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("queues", &self.queues)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
