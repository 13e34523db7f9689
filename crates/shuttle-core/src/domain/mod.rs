//! Domain model (IDs, envelope, queues, errors, retry decisions, outcomes).

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod queue;
pub mod retry;
pub mod task_type;

pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::TaskEnvelope;
pub use errors::{
    BrokerError, ConfigError, EnqueueError, ErrorKind, HandlerError, RegistryError,
};
pub use ids::{LeaseId, TaskId};
pub use outcome::{DeadLetterReason, DispatchOutcome};
pub use queue::{QueueConfig, QueueName};
pub use retry::RetryPolicy;
pub use task_type::TaskType;
