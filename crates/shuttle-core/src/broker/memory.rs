//! In-memory broker implementation.
//!
//! Single-process stand-in for a Redis-style broker: same lease semantics,
//! no durability across restarts. Useful for development, tests and
//! embedding.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    Broker, BrokerCounts, DeadLetter, Delivery, Disposition, LeaseToken, TaskRecord, TaskState,
};
use crate::domain::{BrokerError, DeadLetterReason, LeaseId, QueueName, TaskEnvelope, TaskId};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};

#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// How long a popped envelope stays leased without a renewal.
    pub lease_timeout: Duration,

    /// Dead letters kept for inspection; the oldest are evicted first.
    /// At least 1: a dead letter is never dropped as it is written.
    pub dead_letter_retention: usize,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            dead_letter_retention: 10_000,
        }
    }
}

/// Scheduled task entry for the retry heap.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    next_run_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other.next_run_at.cmp(&self.next_run_at)
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveLease {
    task_id: TaskId,
    expires_at: Instant,
}

struct BrokerState {
    /// All live task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Per-queue FIFO of pending TaskIds.
    ready: HashMap<QueueName, VecDeque<TaskId>>,

    /// Retry backoff heap.
    scheduled: BinaryHeap<ScheduledTask>,

    /// Outstanding leases.
    leases: HashMap<LeaseId, ActiveLease>,

    /// Dead-lettered TaskIds, oldest first.
    dead: VecDeque<TaskId>,

    acked: u64,
    closed: bool,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: HashMap::new(),
            scheduled: BinaryHeap::new(),
            leases: HashMap::new(),
            dead: VecDeque::new(),
            acked: 0,
            closed: false,
        }
    }

    fn push_ready(&mut self, queue: QueueName, task_id: TaskId) {
        self.ready.entry(queue).or_default().push_back(task_id);
    }

    /// Move tasks from scheduled to ready if their time has come.
    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.state == TaskState::Scheduled
            {
                record.requeue();
                let queue = record.envelope.queue().clone();
                self.push_ready(queue, entry.task_id);
            }
        }
    }

    /// Expired leases go back to Pending as a redelivery.
    fn reap_expired_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease_id in expired {
            let Some(lease) = self.leases.remove(&lease_id) else {
                continue;
            };
            let Some(record) = self.records.get_mut(&lease.task_id) else {
                continue;
            };
            if record.lease != Some(lease_id) {
                continue;
            }
            tracing::warn!(
                task_id = %lease.task_id,
                lease_id = %lease_id,
                attempt = record.envelope.attempt(),
                "lease expired, redelivering"
            );
            record.schedule_retry(now, "lease expired".to_string());
            record.requeue();
            let queue = record.envelope.queue().clone();
            self.push_ready(queue, lease.task_id);
        }
    }

    /// Earliest instant at which something may become eligible.
    fn next_wake(&self) -> Option<Instant> {
        let retry = self.scheduled.peek().map(|entry| entry.next_run_at);
        let expiry = self.leases.values().map(|lease| lease.expires_at).min();
        match (retry, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn lease_next(
        &mut self,
        queues: &[QueueName],
        lease_id: LeaseId,
        expires_at: Instant,
    ) -> Option<Delivery> {
        for queue in queues {
            let Some(ready) = self.ready.get_mut(queue) else {
                continue;
            };
            while let Some(task_id) = ready.pop_front() {
                let Some(record) = self.records.get_mut(&task_id) else {
                    continue;
                };
                if !record.state.is_runnable() {
                    continue;
                }
                record.mark_leased(lease_id);
                self.leases.insert(
                    lease_id,
                    ActiveLease {
                        task_id,
                        expires_at,
                    },
                );
                return Some(Delivery {
                    lease: LeaseToken::new(lease_id, task_id),
                    envelope: record.envelope.clone(),
                });
            }
        }
        None
    }

    /// Consume a lease. Unknown, settled and expired leases are all `LeaseNotFound`.
    fn settle_lease(&mut self, lease: &LeaseToken) -> Result<TaskId, BrokerError> {
        let lease_id = lease.lease_id();
        match self.leases.get(&lease_id) {
            Some(active) if active.task_id == lease.task_id() => {}
            _ => return Err(BrokerError::LeaseNotFound(lease_id)),
        }
        self.leases.remove(&lease_id);
        Ok(lease.task_id())
    }

    fn dead_letter(
        &mut self,
        task_id: TaskId,
        reason: DeadLetterReason,
        at: DateTime<Utc>,
        retention: usize,
    ) {
        let Some(record) = self.records.get_mut(&task_id) else {
            return;
        };
        record.mark_dead(reason, at);
        self.dead.push_back(task_id);

        while self.dead.len() > retention {
            let Some(evicted) = self.dead.pop_front() else {
                break;
            };
            if let Some(record) = self.records.remove(&evicted) {
                tracing::warn!(
                    task_id = %evicted,
                    task_type = %record.envelope.task_type(),
                    reason = ?record.dead_reason,
                    retention,
                    "dead letter evicted by retention"
                );
            }
        }
    }

    fn counts(&self) -> BrokerCounts {
        let mut counts = BrokerCounts {
            acked: self.acked,
            ..BrokerCounts::default()
        };
        for record in self.records.values() {
            match record.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Leased => counts.leased += 1,
                TaskState::Scheduled => counts.scheduled += 1,
                TaskState::Dead => counts.dead += 1,
            }
        }
        counts
    }
}

/// In-memory broker.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    config: InMemoryBrokerConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    offline: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }

    pub fn with_parts(
        mut config: InMemoryBrokerConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        if config.dead_letter_retention == 0 {
            tracing::warn!("dead_letter_retention=0 would drop every dead letter, using 1");
            config.dead_letter_retention = 1;
        }
        Self {
            state: Mutex::new(BrokerState::new()),
            notify: Notify::new(),
            config,
            clock,
            ids,
            offline: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &InMemoryBrokerConfig {
        &self.config
    }

    /// Make every operation fail with `BrokerError::Unavailable` until turned off.
    pub fn simulate_outage(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if !offline {
            self.notify.notify_waiters();
        }
    }

    /// Move a dead letter back to Pending with a fresh attempt budget.
    /// Returns false if it is not dead (or evicted).
    pub async fn requeue_dead(&self, task_id: TaskId) -> Result<bool, BrokerError> {
        self.check_online()?;
        let requeued = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let queue = match state.records.get_mut(&task_id) {
                Some(record) if record.state == TaskState::Dead => {
                    record.revive();
                    record.envelope.queue().clone()
                }
                _ => return Ok(false),
            };
            state.dead.retain(|id| *id != task_id);
            state.push_ready(queue, task_id);
            tracing::info!(task_id = %task_id, "dead letter requeued");
            true
        };
        self.notify.notify_one();
        Ok(requeued)
    }

    /// Snapshot of one task record (None once acked or evicted).
    pub async fn record(&self, task_id: TaskId) -> Option<TaskRecord> {
        let state = self.state.lock().await;
        state.records.get(&task_id).cloned()
    }

    fn check_online(&self) -> Result<(), BrokerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(
                "in-memory broker is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push(&self, envelope: TaskEnvelope) -> Result<(), BrokerError> {
        self.check_online()?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let task_id = envelope.task_id();
            let queue = envelope.queue().clone();
            state.records.insert(task_id, TaskRecord::new(envelope));
            state.push_ready(queue, task_id);
        }
        // Notify waiting slots outside the lock
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(
        &self,
        queues: &[QueueName],
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_online()?;

            // ロック解放前に登録しておかないと push の通知を取りこぼす
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(BrokerError::Closed);
                }
                let now = Instant::now();
                state.promote_scheduled(now);
                state.reap_expired_leases(now);

                let lease_id = self.ids.generate_lease_id();
                if let Some(delivery) =
                    state.lease_next(queues, lease_id, now + self.config.lease_timeout)
                {
                    return Ok(Some(delivery));
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = wake_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<(), BrokerError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let task_id = state.settle_lease(lease)?;
        state.records.remove(&task_id);
        state.acked += 1;
        Ok(())
    }

    async fn fail(&self, lease: &LeaseToken, disposition: Disposition) -> Result<(), BrokerError> {
        self.check_online()?;
        let wake = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let task_id = state.settle_lease(lease)?;

            match disposition {
                Disposition::Retry { delay, error } => {
                    let now = Instant::now();
                    let Some(record) = state.records.get_mut(&task_id) else {
                        return Err(BrokerError::LeaseNotFound(lease.lease_id()));
                    };
                    record.schedule_retry(now + delay, error);
                    if delay.is_zero() {
                        record.requeue();
                        let queue = record.envelope.queue().clone();
                        state.push_ready(queue, task_id);
                    } else {
                        state.scheduled.push(ScheduledTask {
                            next_run_at: now + delay,
                            task_id,
                        });
                    }
                    true
                }
                Disposition::DeadLetter { reason } => {
                    let at = self.clock.now();
                    let retention = self.config.dead_letter_retention;
                    state.dead_letter(task_id, reason, at, retention);
                    false
                }
            }
        }; // Lock released here

        if wake {
            // 待機中の slot に次の起床時刻を計算し直させる
            self.notify.notify_waiters();
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn renew(&self, lease: &LeaseToken) -> Result<(), BrokerError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let expires_at = Instant::now() + self.config.lease_timeout;
        match state.leases.get_mut(&lease.lease_id()) {
            Some(active) if active.task_id == lease.task_id() => {
                active.expires_at = expires_at;
                Ok(())
            }
            _ => Err(BrokerError::LeaseNotFound(lease.lease_id())),
        }
    }

    async fn counts(&self) -> Result<BrokerCounts, BrokerError> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.promote_scheduled(now);
        state.reap_expired_leases(now);
        Ok(state.counts())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, BrokerError> {
        self.check_online()?;
        let state = self.state.lock().await;
        let letters = state
            .dead
            .iter()
            .rev()
            .filter_map(|task_id| state.records.get(task_id))
            .filter_map(|record| {
                Some(DeadLetter {
                    envelope: record.envelope.clone(),
                    reason: record.dead_reason.clone()?,
                    failed_at: record.dead_at?,
                })
            })
            .take(limit)
            .collect();
        Ok(letters)
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskType;
    use ulid::Ulid;

    fn envelope(queue: &str) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("test"),
            QueueName::new(queue),
            br#"{"key":"value"}"#.to_vec(),
            Utc::now(),
        )
    }

    fn queues(names: &[&str]) -> Vec<QueueName> {
        names.iter().map(|n| QueueName::new(*n)).collect()
    }

    async fn pop_now(broker: &InMemoryBroker, names: &[&str]) -> Option<Delivery> {
        broker
            .pop(&queues(names), Duration::from_millis(50))
            .await
            .unwrap()
    }

    fn short_lease(lease_timeout: Duration) -> InMemoryBroker {
        InMemoryBroker::new(InMemoryBrokerConfig {
            lease_timeout,
            ..InMemoryBrokerConfig::default()
        })
    }

    #[tokio::test]
    async fn push_and_counts() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("default")).await.unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.leased, 0);
    }

    #[tokio::test]
    async fn pop_transitions_to_leased() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("default")).await.unwrap();

        let delivery = pop_now(&broker, &["default"]).await.unwrap();
        assert_eq!(delivery.envelope.task_type().as_str(), "test");
        assert_eq!(delivery.envelope.attempt(), 0);

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.leased, 1);
    }

    #[tokio::test]
    async fn pop_respects_queue_order() {
        let broker = InMemoryBroker::default();
        let low = envelope("low");
        let critical = envelope("critical");
        broker.push(low.clone()).await.unwrap();
        broker.push(critical.clone()).await.unwrap();

        let first = pop_now(&broker, &["critical", "low"]).await.unwrap();
        assert_eq!(first.envelope.task_id(), critical.task_id());

        let second = pop_now(&broker, &["critical", "low"]).await.unwrap();
        assert_eq!(second.envelope.task_id(), low.task_id());
    }

    #[tokio::test]
    async fn pop_ignores_queues_not_listed() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("low")).await.unwrap();

        assert!(pop_now(&broker, &["critical"]).await.is_none());
    }

    #[tokio::test]
    async fn pop_times_out_with_none() {
        let broker = InMemoryBroker::default();
        let start = Instant::now();
        let popped = broker
            .pop(&queues(&["default"]), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn push_wakes_waiting_pop() {
        let broker = Arc::new(InMemoryBroker::default());
        let env = envelope("default");

        let waiter = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move {
                broker
                    .pop(&queues(&["default"]), Duration::from_secs(5))
                    .await
                    .unwrap()
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.push(env.clone()).await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.envelope.task_id(), env.task_id());
    }

    #[tokio::test]
    async fn ack_removes_and_second_ack_is_lease_not_found() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("default")).await.unwrap();
        let delivery = pop_now(&broker, &["default"]).await.unwrap();

        broker.ack(&delivery.lease).await.unwrap();
        let err = broker.ack(&delivery.lease).await.unwrap_err();
        assert_eq!(err, BrokerError::LeaseNotFound(delivery.lease.lease_id()));

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.outstanding(), 0);
        assert_eq!(counts.acked, 1);
        assert!(broker.record(delivery.envelope.task_id()).await.is_none());
    }

    #[tokio::test]
    async fn retry_increments_attempt_and_redelivers() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("default")).await.unwrap();
        let first = pop_now(&broker, &["default"]).await.unwrap();

        broker
            .fail(
                &first.lease,
                Disposition::Retry {
                    delay: Duration::from_millis(30),
                    error: "boom".into(),
                },
            )
            .await
            .unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.scheduled, 1);

        // not eligible before the backoff elapses
        let early = broker
            .pop(&queues(&["default"]), Duration::ZERO)
            .await
            .unwrap();
        assert!(early.is_none());

        let again = broker
            .pop(&queues(&["default"]), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.envelope.task_id(), first.envelope.task_id());
        assert_eq!(again.envelope.attempt(), 1);
        assert_ne!(again.lease, first.lease);

        let record = broker.record(again.envelope.task_id()).await.unwrap();
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dead_letter_is_kept_for_inspection() {
        let broker = InMemoryBroker::default();
        let env = envelope("default");
        broker.push(env.clone()).await.unwrap();
        let delivery = pop_now(&broker, &["default"]).await.unwrap();

        broker
            .fail(
                &delivery.lease,
                Disposition::DeadLetter {
                    reason: DeadLetterReason::MissingHandler,
                },
            )
            .await
            .unwrap();

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.pending, 0);

        let letters = broker.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].envelope.task_id(), env.task_id());
        assert_eq!(letters[0].reason, DeadLetterReason::MissingHandler);

        // dead letters are never popped again
        assert!(pop_now(&broker, &["default"]).await.is_none());
    }

    #[tokio::test]
    async fn dead_letter_retention_evicts_oldest() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            dead_letter_retention: 2,
            ..InMemoryBrokerConfig::default()
        });

        let mut ids = Vec::new();
        for _ in 0..3 {
            let env = envelope("default");
            ids.push(env.task_id());
            broker.push(env).await.unwrap();
            let delivery = pop_now(&broker, &["default"]).await.unwrap();
            broker
                .fail(
                    &delivery.lease,
                    Disposition::DeadLetter {
                        reason: DeadLetterReason::Permanent("bad".into()),
                    },
                )
                .await
                .unwrap();
        }

        let letters = broker.dead_letters(10).await.unwrap();
        let kept: Vec<TaskId> = letters.iter().map(|l| l.envelope.task_id()).collect();
        assert_eq!(kept, vec![ids[2], ids[1]]);
        assert!(broker.record(ids[0]).await.is_none());
    }

    #[tokio::test]
    async fn zero_retention_still_keeps_the_latest_dead_letter() {
        let broker = InMemoryBroker::new(InMemoryBrokerConfig {
            dead_letter_retention: 0,
            ..InMemoryBrokerConfig::default()
        });
        assert_eq!(broker.config().dead_letter_retention, 1);

        let env = envelope("default");
        let task_id = env.task_id();
        broker.push(env).await.unwrap();
        let delivery = pop_now(&broker, &["default"]).await.unwrap();
        broker
            .fail(
                &delivery.lease,
                Disposition::DeadLetter {
                    reason: DeadLetterReason::Permanent("bad".into()),
                },
            )
            .await
            .unwrap();

        let letters = broker.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].envelope.task_id(), task_id);
        assert_eq!(broker.counts().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn requeue_dead_makes_task_pending_again() {
        let broker = InMemoryBroker::default();
        broker.push(envelope("default")).await.unwrap();
        let delivery = pop_now(&broker, &["default"]).await.unwrap();
        broker
            .fail(
                &delivery.lease,
                Disposition::DeadLetter {
                    reason: DeadLetterReason::Permanent("bad".into()),
                },
            )
            .await
            .unwrap();

        assert!(broker.requeue_dead(delivery.envelope.task_id()).await.unwrap());
        assert!(!broker.requeue_dead(delivery.envelope.task_id()).await.unwrap());

        let counts = broker.counts().await.unwrap();
        assert_eq!(counts.dead, 0);
        assert_eq!(counts.pending, 1);
        assert!(broker.dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_dead_resets_attempt_after_lease_expiry() {
        let broker = short_lease(Duration::from_millis(50));
        broker.push(envelope("default")).await.unwrap();

        // 3 回 lease を放置して attempt を進める
        for _ in 0..3 {
            broker
                .pop(&queues(&["default"]), Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
        }
        let delivery = broker
            .pop(&queues(&["default"]), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.attempt(), 3);
        let task_id = delivery.envelope.task_id();
        broker
            .fail(
                &delivery.lease,
                Disposition::DeadLetter {
                    reason: DeadLetterReason::AttemptsExhausted("lease expired".into()),
                },
            )
            .await
            .unwrap();

        assert!(broker.requeue_dead(task_id).await.unwrap());

        let record = broker.record(task_id).await.unwrap();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.envelope.attempt(), 0);
        assert!(record.last_error.is_none());

        let again = pop_now(&broker, &["default"]).await.unwrap();
        assert_eq!(again.envelope.attempt(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered_and_old_lease_is_rejected() {
        let broker = short_lease(Duration::from_millis(30));
        broker.push(envelope("default")).await.unwrap();
        let first = pop_now(&broker, &["default"]).await.unwrap();

        let second = broker
            .pop(&queues(&["default"]), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.envelope.task_id(), first.envelope.task_id());
        assert_eq!(second.envelope.attempt(), 1);

        assert!(matches!(
            broker.ack(&first.lease).await,
            Err(BrokerError::LeaseNotFound(_))
        ));
        broker.ack(&second.lease).await.unwrap();
    }

    #[tokio::test]
    async fn renew_keeps_lease_alive() {
        let broker = short_lease(Duration::from_millis(60));
        broker.push(envelope("default")).await.unwrap();
        let delivery = pop_now(&broker, &["default"]).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.renew(&delivery.lease).await.unwrap();
        }

        assert_eq!(broker.counts().await.unwrap().leased, 1);
        broker.ack(&delivery.lease).await.unwrap();
    }

    #[tokio::test]
    async fn outage_surfaces_as_unavailable() {
        let broker = InMemoryBroker::default();
        broker.simulate_outage(true);

        let err = broker.push(envelope("default")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        let err = broker
            .pop(&queues(&["default"]), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));

        broker.simulate_outage(false);
        broker.push(envelope("default")).await.unwrap();
    }

    #[tokio::test]
    async fn closed_broker_rejects_operations() {
        let broker = InMemoryBroker::default();
        broker.close().await;

        assert_eq!(
            broker.push(envelope("default")).await.unwrap_err(),
            BrokerError::Closed
        );
        assert_eq!(
            broker
                .pop(&queues(&["default"]), Duration::from_millis(10))
                .await
                .unwrap_err(),
            BrokerError::Closed
        );
    }
}
