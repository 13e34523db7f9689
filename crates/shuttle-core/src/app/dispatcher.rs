//! Dispatcher - worker slot を起動してタスクを実行する
//!
//! # フロー（slot ごと）
//! 1. scheduler から pull 順を取得
//! 2. Broker::pop（poll_timeout まで待つ。shutdown と競合させる）
//! 3. handler を解決して実行（実行中は lease を定期更新）
//! 4. 成功: ack / 失敗: Decider の判断で retry か dead-letter
//!
//! # 設計原則
//! - 同時実行数は slot 数（concurrency）で上限が決まる
//! - Broker 障害はタスクの失敗ではない。バックオフして pull し直す
//! - ack / fail の報告失敗はログに残すだけで slot は止めない

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::lifecycle::{LifecycleError, LifecycleState, ShutdownReport};
use super::producer::Producer;
use super::scheduler::WeightedScheduler;
use super::status::DispatcherStatus;
use crate::broker::{Broker, Delivery, Disposition, LeaseToken};
use crate::config::DispatcherConfig;
use crate::domain::{
    BrokerError, DeadLetterReason, Decider, Decision, DefaultDecider, DispatchOutcome,
    HandlerError, TaskEnvelope,
};
use crate::typed::{DynHandler, HandlerRegistry, TaskContext};

/// State shared by every worker slot.
struct SlotShared {
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    decider: Arc<dyn Decider>,
    scheduler: WeightedScheduler,
    config: DispatcherConfig,

    /// Cancelled at Draining: no new pulls.
    pull_token: CancellationToken,
    /// Parent of every TaskContext token. Cancelled at Draining as a notification.
    handler_token: CancellationToken,

    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Lifecycle bookkeeping. Shared with the drain task so that Stopped is
/// reached even if the `shutdown` caller stops polling.
struct Control {
    state_tx: watch::Sender<LifecycleState>,
    producer: Mutex<Option<Producer>>,
    report: Mutex<Option<ShutdownReport>>,
}

/// Runs handlers for leased envelopes on `concurrency` worker slots.
pub struct Dispatcher {
    shared: Arc<SlotShared>,
    slots: Mutex<Vec<JoinHandle<()>>>,
    control: Arc<Control>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let decider = Arc::new(DefaultDecider::new(config.retry.clone()));
        Self::with_decider(config, broker, registry, decider)
    }

    pub fn with_decider(
        config: DispatcherConfig,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        decider: Arc<dyn Decider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Created);
        let shared = SlotShared {
            broker,
            registry,
            decider,
            scheduler: WeightedScheduler::new(&config.queues),
            config,
            pull_token: CancellationToken::new(),
            handler_token: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            acked: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            slots: Mutex::new(Vec::new()),
            control: Arc::new(Control {
                state_tx,
                producer: Mutex::new(None),
                report: Mutex::new(None),
            }),
        }
    }

    /// Producer to close once the dispatcher reaches Stopped.
    pub fn attach_producer(&self, producer: Producer) {
        *lock(&self.control.producer) = Some(producer);
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.control.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.control.state_tx.subscribe()
    }

    /// Resolves once the dispatcher has reached `target` (or passed it).
    pub async fn wait_for_state(&self, target: LifecycleState) {
        let mut rx = self.control.state_tx.subscribe();
        // Sender は control が保持しているので Err にはならない
        let _ = rx.wait_for(|state| rank(*state) >= rank(target)).await;
    }

    pub fn status(&self) -> DispatcherStatus {
        let shared = &self.shared;
        DispatcherStatus {
            state: self.state(),
            concurrency: shared.config.concurrency,
            in_flight: shared.in_flight.load(Ordering::SeqCst),
            peak_in_flight: shared.peak_in_flight.load(Ordering::SeqCst),
            acked: shared.acked.load(Ordering::Relaxed),
            retried: shared.retried.load(Ordering::Relaxed),
            dead_lettered: shared.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Created -> Running. Spawns the worker slots.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let current = self.state();
        if current != LifecycleState::Created {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                action: "start",
            });
        }
        if self.shared.registry.is_empty() {
            return Err(LifecycleError::EmptyRegistry);
        }
        if let Some(queue) = self.shared.config.queues.iter().find(|q| q.weight == 0) {
            return Err(LifecycleError::NonPositiveWeight(queue.name.clone()));
        }
        self.shared.config.validate()?;

        // shutdown が slot 一覧を取りに来る前に spawn を終わらせる
        let mut slots = lock(&self.slots);
        let mut from = current;
        let started = self.control.state_tx.send_if_modified(|state| {
            from = *state;
            if *state == LifecycleState::Created {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(LifecycleError::InvalidTransition {
                from,
                action: "start",
            });
        }

        for slot in 0..self.shared.config.concurrency {
            let shared = Arc::clone(&self.shared);
            slots.push(tokio::spawn(run_slot(shared, slot)));
        }

        tracing::info!(
            concurrency = self.shared.config.concurrency,
            queues = ?self.shared.scheduler.queues(),
            task_types = ?self.shared.registry.registered_types(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Running -> Draining -> Stopped.
    ///
    /// Stops pulling immediately, notifies handlers through their context,
    /// and waits up to `shutdown_deadline` for in-flight handlers. Slots still
    /// busy at the deadline are aborted; their envelopes come back once the
    /// lease expires. Calling it again returns the first report.
    ///
    /// The drain runs on its own task: dropping this future (e.g. under a
    /// `timeout`) does not leave the dispatcher stuck in Draining.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let mut from = LifecycleState::Stopped;
        self.control.state_tx.send_if_modified(|state| {
            from = *state;
            match *state {
                LifecycleState::Created => {
                    *state = LifecycleState::Stopped;
                    true
                }
                LifecycleState::Running => {
                    *state = LifecycleState::Draining;
                    true
                }
                _ => false,
            }
        });

        match from {
            LifecycleState::Created => {
                self.shared.pull_token.cancel();
                let report = ShutdownReport::immediate();
                *lock(&self.control.report) = Some(report);
                release(&self.shared, &self.control, report).await;
                report
            }
            LifecycleState::Running => {
                tracing::info!(
                    deadline_ms = self.shared.config.shutdown_deadline.as_millis() as u64,
                    in_flight = self.shared.in_flight.load(Ordering::SeqCst),
                    "dispatcher draining"
                );
                self.shared.pull_token.cancel();
                self.shared.handler_token.cancel();

                let handles = std::mem::take(&mut *lock(&self.slots));
                let drain = tokio::spawn(drain(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.control),
                    handles,
                    started,
                ));
                match drain.await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!(error = %e, "shutdown drain task failed");
                        let report = ShutdownReport {
                            drained: false,
                            abandoned: 0,
                            elapsed: started.elapsed(),
                        };
                        lock(&self.control.report).get_or_insert(report);
                        self.control.state_tx.send_replace(LifecycleState::Stopped);
                        report
                    }
                }
            }
            _ => {
                // 別の呼び出しが停止処理中
                self.wait_for_state(LifecycleState::Stopped).await;
                (*lock(&self.control.report)).unwrap_or_else(ShutdownReport::immediate)
            }
        }
    }
}

/// Join the slots up to the deadline, then publish Stopped and release.
async fn drain(
    shared: Arc<SlotShared>,
    control: Arc<Control>,
    handles: Vec<JoinHandle<()>>,
    started: Instant,
) -> ShutdownReport {
    let (drained, abandoned) = join_slots(handles, shared.config.shutdown_deadline).await;
    let report = ShutdownReport {
        drained,
        abandoned,
        elapsed: started.elapsed(),
    };
    *lock(&control.report) = Some(report);
    control.state_tx.send_replace(LifecycleState::Stopped);
    release(&shared, &control, report).await;
    report
}

async fn join_slots(handles: Vec<JoinHandle<()>>, deadline: Duration) -> (bool, usize) {
    let deadline = Instant::now() + deadline;

    let mut abandoned = 0;
    for mut handle in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "worker slot ended abnormally"),
            Err(_) => {
                handle.abort();
                abandoned += 1;
            }
        }
    }
    if abandoned > 0 {
        tracing::warn!(abandoned, "shutdown deadline reached, abandoning in-flight tasks");
    }
    (abandoned == 0, abandoned)
}

async fn release(shared: &SlotShared, control: &Control, report: ShutdownReport) {
    if let Some(producer) = lock(&control.producer).take() {
        producer.close();
    }
    shared.broker.close().await;
    tracing::info!(
        drained = report.drained,
        abandoned = report.abandoned,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "dispatcher stopped"
    );
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // 起動したまま drop された場合に slot を残さない
        self.shared.pull_token.cancel();
        self.shared.handler_token.cancel();
    }
}

fn rank(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Created => 0,
        LifecycleState::Running => 1,
        LifecycleState::Draining => 2,
        LifecycleState::Stopped => 3,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_slot(shared: Arc<SlotShared>, slot: usize) {
    tracing::debug!(slot, "worker slot started");
    loop {
        // shutdown が来ていたら抜ける
        if shared.pull_token.is_cancelled() {
            break;
        }

        let order = shared.scheduler.next_order();

        // pop は「待つ」可能性があるので select で shutdown と競合させる
        let popped = tokio::select! {
            biased;
            _ = shared.pull_token.cancelled() => break,
            popped = shared.broker.pop(&order, shared.config.poll_timeout) => popped,
        };

        match popped {
            Ok(Some(delivery)) => shared.execute(slot, delivery).await,
            Ok(None) => continue,
            Err(BrokerError::Closed) => {
                tracing::debug!(slot, "broker closed, worker slot exiting");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    slot,
                    error = %e,
                    backoff_ms = shared.config.broker_backoff.as_millis() as u64,
                    "broker pull failed, backing off"
                );
                tokio::select! {
                    _ = shared.pull_token.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.broker_backoff) => {}
                }
            }
        }
    }
    tracing::debug!(slot, "worker slot stopped");
}

/// Decrements `in_flight` even when the slot is aborted mid-handler.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SlotShared {
    async fn execute(&self, slot: usize, delivery: Delivery) {
        let span = tracing::info_span!(
            "task",
            slot,
            task_id = %delivery.envelope.task_id(),
            task_type = %delivery.envelope.task_type(),
            queue = %delivery.envelope.queue(),
            attempt = delivery.envelope.attempt(),
        );
        async move {
            let _in_flight = InFlight::enter(&self.in_flight, &self.peak_in_flight);
            let outcome = self.process(&delivery.lease, &delivery.envelope).await;
            self.record(&outcome);
        }
        .instrument(span)
        .await
    }

    async fn process(&self, lease: &LeaseToken, envelope: &TaskEnvelope) -> DispatchOutcome {
        let max_attempts = self.config.max_attempts;

        // lease 切れの再配送で上限を超えたものは handler を呼ばない
        if envelope.attempt() >= max_attempts {
            let reason = DeadLetterReason::AttemptsExhausted(format!(
                "{} deliveries without a result (limit {max_attempts})",
                envelope.attempt()
            ));
            return self.dead_letter(lease, reason).await;
        }

        let Some(handler) = self.registry.get(envelope.task_type()) else {
            tracing::error!("no handler registered for task type");
            return self
                .dead_letter(lease, DeadLetterReason::MissingHandler)
                .await;
        };

        let ctx = TaskContext::new(envelope, self.handler_token.child_token());
        let result = self
            .invoke(handler, ctx, envelope.payload().to_vec(), lease)
            .await;

        let error = match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(lease).await {
                    tracing::warn!(error = %e, "ack failed");
                }
                return DispatchOutcome::Acked;
            }
            Err(error) => error,
        };

        match self.decider.decide(envelope, max_attempts, &error) {
            Decision::Retry { delay, reason } => {
                tracing::debug!(%reason, "retry decided");
                let disposition = Disposition::Retry {
                    delay,
                    error: error.to_string(),
                };
                if let Err(e) = self.broker.fail(lease, disposition).await {
                    tracing::warn!(error = %e, "fail report failed");
                }
                DispatchOutcome::Retried {
                    next_attempt: envelope.attempt() + 1,
                    delay,
                }
            }
            Decision::MarkDead { reason } => {
                tracing::debug!(%reason, "dead-letter decided");
                let reason = if error.is_retryable() {
                    DeadLetterReason::AttemptsExhausted(error.message().to_string())
                } else {
                    DeadLetterReason::Permanent(error.message().to_string())
                };
                self.dead_letter(lease, reason).await
            }
        }
    }

    /// Run the handler, renewing the lease until it returns.
    async fn invoke(
        &self,
        handler: Arc<dyn DynHandler>,
        ctx: TaskContext,
        payload: Vec<u8>,
        lease: &LeaseToken,
    ) -> Result<(), HandlerError> {
        let call = AssertUnwindSafe(handler.call(ctx, payload)).catch_unwind();
        tokio::pin!(call);

        let every = self.config.lease_renew_interval.max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(Instant::now() + every, every);

        loop {
            tokio::select! {
                result = &mut call => {
                    return result.unwrap_or_else(|panic| {
                        Err(HandlerError::retryable(format!(
                            "handler panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                }
                _ = renew.tick() => {
                    if let Err(e) = self.broker.renew(lease).await {
                        tracing::warn!(error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }

    async fn dead_letter(&self, lease: &LeaseToken, reason: DeadLetterReason) -> DispatchOutcome {
        let disposition = Disposition::DeadLetter {
            reason: reason.clone(),
        };
        if let Err(e) = self.broker.fail(lease, disposition).await {
            tracing::warn!(error = %e, "dead-letter report failed");
        }
        DispatchOutcome::DeadLettered { reason }
    }

    fn record(&self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Acked => {
                self.acked.fetch_add(1, Ordering::Relaxed);
                tracing::info!("task completed");
            }
            DispatchOutcome::Retried {
                next_attempt,
                delay,
            } => {
                self.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "task failed, retry scheduled"
                );
            }
            DispatchOutcome::DeadLettered { reason } => {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                match reason {
                    DeadLetterReason::MissingHandler => {
                        tracing::error!(%reason, "task dead-lettered")
                    }
                    _ => tracing::warn!(%reason, "task dead-lettered"),
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
