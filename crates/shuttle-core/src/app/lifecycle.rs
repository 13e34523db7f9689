//! Lifecycle - dispatcher の状態遷移
//!
//! # 状態遷移
//! ```text
//! Created --start--> Running --shutdown--> Draining --slots done / deadline--> Stopped
//! Created --shutdown--> Stopped
//! ```
//! Stopped は終端状態です。再起動はできません。

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::{ConfigError, ErrorKind, QueueName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    /// No new pulls; in-flight handlers are finishing.
    Draining,
    Stopped,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("no handlers registered")]
    EmptyRegistry,

    #[error("queue '{0}' must have a positive weight")]
    NonPositiveWeight(QueueName),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("cannot {action} a dispatcher that is {from}")]
    InvalidTransition {
        from: LifecycleState,
        action: &'static str,
    },
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every slot finished before the deadline.
    pub drained: bool,
    /// Slots aborted at the deadline. Their leases expire and get redelivered.
    pub abandoned: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub(crate) fn immediate() -> Self {
        Self {
            drained: true,
            abandoned: 0,
            elapsed: Duration::ZERO,
        }
    }
}
