//! Decision model: what happens to a delivery after its handler failed.
//!
//! The Decider is a pure function of (envelope, max_attempts, error). The
//! dispatcher turns the resulting [`Decision`] into a broker
//! [`crate::broker::Disposition`].

use std::time::Duration;

use super::{HandlerError, RetryPolicy, TaskEnvelope};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Redeliver the task after a delay.
    Retry { delay: Duration, reason: String },

    /// Move the task to the dead-letter set.
    MarkDead { reason: String },
}

/// Trait for deciding the next action after a failed delivery.
pub trait Decider: Send + Sync {
    fn decide(&self, envelope: &TaskEnvelope, max_attempts: u32, error: &HandlerError) -> Decision;
}

/// Attempt-based retry with exponential backoff:
/// - permanent errors are never retried
/// - retry while `deliveries < max_attempts`
/// - mark dead once `deliveries >= max_attempts`
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, envelope: &TaskEnvelope, max_attempts: u32, error: &HandlerError) -> Decision {
        let deliveries = envelope.deliveries();

        if !error.is_retryable() {
            return Decision::MarkDead {
                reason: error.to_string(),
            };
        }

        if deliveries >= max_attempts {
            Decision::MarkDead {
                reason: format!(
                    "Max attempts reached: {}/{}: {}",
                    deliveries, max_attempts, error
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(deliveries);
            Decision::Retry {
                delay,
                reason: format!(
                    "Retry attempt {}/{} after {:?}: {}",
                    deliveries + 1,
                    max_attempts,
                    delay,
                    error
                ),
            }
        }
    }
}
