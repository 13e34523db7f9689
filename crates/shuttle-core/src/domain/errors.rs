//! Errors - エラー型と分類
//!
//! # 分類（ErrorKind）
//! - Configuration: 呼び出し側・設定の誤り（自動リトライしない）
//! - Infrastructure: Broker 障害など一時的なインフラエラー（バックオフ後に再試行）
//! - Transient: タスク単位の一時的な失敗（attempt を増やして再配送）
//! - Permanent: 恒久的な失敗（即 dead-letter）
//!
//! 実行時エラーは enqueue した呼び出し側には戻りません。Broker の dead-letter と
//! ログでのみ観測できます。

use thiserror::Error;

use super::{LeaseId, QueueName, TaskType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Infrastructure,
    Transient,
    Permanent,
}

/// Errors reported by a [`crate::broker::Broker`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The lease was never issued, already settled, or expired.
    #[error("lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("broker is closed")]
    Closed,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Unavailable(_) | BrokerError::Closed => ErrorKind::Infrastructure,
            BrokerError::LeaseNotFound(_) => ErrorKind::Permanent,
        }
    }
}

/// Failure returned by a handler.
///
/// Handlers return `Retryable` for anything that might succeed on another
/// delivery and `Permanent` when retrying cannot help (bad payload, rejected
/// recipient, ...).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        HandlerError::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        HandlerError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(m) | HandlerError::Permanent(m) => m,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Retryable(_) => ErrorKind::Transient,
            HandlerError::Permanent(_) => ErrorKind::Permanent,
        }
    }
}

/// Errors surfaced synchronously by [`crate::app::Producer`].
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid task type '{0}'")]
    InvalidType(TaskType),

    #[error("queue '{0}' is not configured")]
    InvalidQueue(QueueName),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("producer is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] crate::typed::CodecError),
}

impl EnqueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnqueueError::InvalidType(_)
            | EnqueueError::InvalidQueue(_)
            | EnqueueError::Codec(_)
            | EnqueueError::Closed => ErrorKind::Configuration,
            EnqueueError::BrokerUnavailable(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<BrokerError> for EnqueueError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Closed => EnqueueError::Closed,
            other => EnqueueError::BrokerUnavailable(other.to_string()),
        }
    }
}

/// Handler registration errors (detected at startup, never at dispatch).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),

    #[error("invalid task type '{0}'")]
    InvalidType(TaskType),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid queue entry '{0}', expected name=weight")]
    InvalidQueueSpec(String),

    #[error("at least one queue must be configured")]
    NoQueues,

    #[error("queue '{0}' is configured more than once")]
    DuplicateQueue(QueueName),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}
