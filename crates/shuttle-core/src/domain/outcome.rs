//! Outcome model: what the dispatcher did with one delivery.
//!
//! Execution results never travel back to the enqueuing caller; this is the
//! shape they are logged and recorded in instead.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why an envelope ended up in the dead-letter set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// No handler registered for the task type. Configuration defect.
    MissingHandler,

    /// The handler classified the failure as non-retryable.
    Permanent(String),

    /// Retryable failures used up the attempt budget.
    AttemptsExhausted(String),
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterReason::MissingHandler => f.write_str("no handler registered"),
            DeadLetterReason::Permanent(msg) => write!(f, "permanent failure: {msg}"),
            DeadLetterReason::AttemptsExhausted(msg) => write!(f, "attempts exhausted: {msg}"),
        }
    }
}

/// Result of executing one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Acked,
    Retried { next_attempt: u32, delay: Duration },
    DeadLettered { reason: DeadLetterReason },
}

impl DispatchOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, DispatchOutcome::DeadLettered { .. })
    }
}
