//! Status - dispatcher の稼働状況

use serde::Serialize;

use super::lifecycle::LifecycleState;

/// Snapshot of a dispatcher's slots and outcome counters.
///
/// # 使用例
/// ```ignore
/// let status = app.dispatcher().status();
/// tracing::info!(in_flight = status.in_flight, state = %status.state, "dispatcher status");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    pub state: LifecycleState,
    pub concurrency: usize,
    /// Handlers running right now.
    pub in_flight: usize,
    /// Highest `in_flight` ever observed. Never exceeds `concurrency`.
    pub peak_in_flight: usize,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl DispatcherStatus {
    pub fn processed(&self) -> u64 {
        self.acked + self.retried + self.dead_lettered
    }
}
