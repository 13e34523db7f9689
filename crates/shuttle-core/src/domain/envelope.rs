//! TaskEnvelope - Broker に永続化される作業単位
//!
//! # フィールド
//! - task_id: Producer が採番（再配送でも変わらない）
//! - task_type: Handler を選択するタグ
//! - payload: Handler 固有のバイト列（Broker は中身を解釈しない）
//! - queue: スケジューリング上の重みを決める論理キュー
//! - attempt: 配送回数 - 1（Broker だけが増やす）
//! - enqueued_at: 観測用

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QueueName, TaskId, TaskType};

/// TaskType + payload + metadata の“運搬用”データ。
///
/// Immutable once built; the only mutation paths are [`TaskEnvelope::redelivered`]
/// and [`TaskEnvelope::reset_attempts`], which broker implementations call when
/// they schedule another delivery or re-drive a dead letter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    task_type: TaskType,
    queue: QueueName,
    payload: Vec<u8>,
    attempt: u32,
    enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        queue: QueueName,
        payload: Vec<u8>,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            queue,
            payload,
            attempt: 0,
            enqueued_at,
        }
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

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Number of deliveries including the current one.
    pub fn deliveries(&self) -> u32 {
        self.attempt.saturating_add(1)
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Same envelope, one attempt later.
    pub fn redelivered(mut self) -> Self {
        self.attempt = self.attempt.saturating_add(1);
        self
    }

    /// Same envelope with a fresh attempt budget (dead-letter re-drive).
    pub fn reset_attempts(mut self) -> Self {
        self.attempt = 0;
        self
    }
}
