//! Broker observers.
//!
//! `ObservedBroker` wraps any [`Broker`] and reports every push / pop / ack /
//! fail to a chain of observers. Every observer sees every event, in
//! registration order; none of them can veto or alter the operation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{Broker, BrokerCounts, DeadLetter, Delivery, Disposition, LeaseToken};
use crate::domain::{BrokerError, QueueName, TaskEnvelope};

/// Hooks called after each broker operation. All default to no-ops.
pub trait BrokerObserver: Send + Sync {
    fn on_push(&self, envelope: &TaskEnvelope, result: &Result<(), BrokerError>) {
        let _ = (envelope, result);
    }

    fn on_pop(&self, result: &Result<Option<Delivery>, BrokerError>) {
        let _ = result;
    }

    fn on_ack(&self, lease: &LeaseToken, result: &Result<(), BrokerError>) {
        let _ = (lease, result);
    }

    fn on_fail(
        &self,
        lease: &LeaseToken,
        disposition: &Disposition,
        result: &Result<(), BrokerError>,
    ) {
        let _ = (lease, disposition, result);
    }
}

/// Broker decorator that fans events out to observers.
pub struct ObservedBroker {
    inner: Arc<dyn Broker>,
    observers: Vec<Arc<dyn BrokerObserver>>,
}

impl ObservedBroker {
    pub fn new(inner: Arc<dyn Broker>) -> Self {
        Self {
            inner,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BrokerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn observers(&self) -> usize {
        self.observers.len()
    }
}

#[async_trait]
impl Broker for ObservedBroker {
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        // push は envelope を消費するので通知用に控えておく
        let observed = envelope.clone();
        let result = self.inner.push(envelope).await;
        for observer in &self.observers {
            observer.on_push(&observed, &result);
        }
        result
    }

    async fn pop(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let result = self.inner.pop(queues, timeout).await;
        for observer in &self.observers {
            observer.on_pop(&result);
        }
        result
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<(), BrokerError> {
        let result = self.inner.ack(lease).await;
        for observer in &self.observers {
            observer.on_ack(lease, &result);
        }
        result
    }

    async fn fail(&self, lease: &LeaseToken, disposition: Disposition) -> Result<(), BrokerError> {
        let result = self.inner.fail(lease, disposition.clone()).await;
        for observer in &self.observers {
            observer.on_fail(lease, &disposition, &result);
        }
        result
    }

    async fn renew(&self, lease: &LeaseToken) -> Result<(), BrokerError> {
        self.inner.renew(lease).await
    }

    async fn counts(&self) -> Result<BrokerCounts, BrokerError> {
        self.inner.counts().await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BrokerError> {
        self.inner.dead_letters(limit).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Logs broker traffic with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl BrokerObserver for TracingObserver {
    fn on_push(&self, envelope: &TaskEnvelope, result: &Result<(), BrokerError>) {
        match result {
            Ok(()) => tracing::debug!(
                task_id = %envelope.task_id(),
                task_type = %envelope.task_type(),
                queue = %envelope.queue(),
                "task pushed"
            ),
            Err(e) => tracing::warn!(
                task_id = %envelope.task_id(),
                task_type = %envelope.task_type(),
                error = %e,
                "push failed"
            ),
        }
    }

    fn on_pop(&self, result: &Result<Option<Delivery>, BrokerError>) {
        match result {
            Ok(Some(delivery)) => tracing::debug!(
                task_id = %delivery.envelope.task_id(),
                lease_id = %delivery.lease.lease_id(),
                queue = %delivery.envelope.queue(),
                attempt = delivery.envelope.attempt(),
                "task leased"
            ),
            Ok(None) => tracing::trace!("pop timed out"),
            Err(e) => tracing::warn!(error = %e, "pop failed"),
        }
    }

    fn on_ack(&self, lease: &LeaseToken, result: &Result<(), BrokerError>) {
        match result {
            Ok(()) => tracing::debug!(task_id = %lease.task_id(), "task acked"),
            Err(e) => tracing::warn!(task_id = %lease.task_id(), error = %e, "ack failed"),
        }
    }

    fn on_fail(
        &self,
        lease: &LeaseToken,
        disposition: &Disposition,
        result: &Result<(), BrokerError>,
    ) {
        match (disposition, result) {
            (Disposition::Retry { delay, error }, Ok(())) => tracing::debug!(
                task_id = %lease.task_id(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task scheduled for retry"
            ),
            (Disposition::DeadLetter { reason }, Ok(())) => tracing::debug!(
                task_id = %lease.task_id(),
                reason = %reason,
                "task dead-lettered"
            ),
            (_, Err(e)) => tracing::warn!(task_id = %lease.task_id(), error = %e, "fail report rejected"),
        }
    }
}

/// Point-in-time copy of [`MetricsObserver`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pushed: u64,
    pub popped: u64,
    pub empty_polls: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

/// Counts broker traffic with atomics.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    pushed: AtomicU64,
    popped: AtomicU64,
    empty_polls: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    errors: AtomicU64,
}

impl MetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl BrokerObserver for MetricsObserver {
    fn on_push(&self, _envelope: &TaskEnvelope, result: &Result<(), BrokerError>) {
        match result {
            Ok(()) => Self::bump(&self.pushed),
            Err(_) => Self::bump(&self.errors),
        }
    }

    fn on_pop(&self, result: &Result<Option<Delivery>, BrokerError>) {
        match result {
            Ok(Some(_)) => Self::bump(&self.popped),
            Ok(None) => Self::bump(&self.empty_polls),
            Err(_) => Self::bump(&self.errors),
        }
    }

    fn on_ack(&self, _lease: &LeaseToken, result: &Result<(), BrokerError>) {
        match result {
            Ok(()) => Self::bump(&self.acked),
            Err(_) => Self::bump(&self.errors),
        }
    }

    fn on_fail(
        &self,
        _lease: &LeaseToken,
        disposition: &Disposition,
        result: &Result<(), BrokerError>,
    ) {
        match (disposition, result) {
            (Disposition::Retry { .. }, Ok(())) => Self::bump(&self.retried),
            (Disposition::DeadLetter { .. }, Ok(())) => Self::bump(&self.dead_lettered),
            (_, Err(_)) => Self::bump(&self.errors),
        }
    }
}
