//! End-to-end scenarios: producer -> broker -> dispatcher -> handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shuttle_core::broker::{InMemoryBrokerConfig, MetricsObserver};
use shuttle_core::domain::RetryPolicy;
use shuttle_core::tasks::{EmailError, EmailSender, WelcomeEmailHandler, WelcomeEmailTask};
use shuttle_core::{
    AppBuilder, Broker, BrokerCounts, BrokerError, DeadLetterReason, DispatcherConfig, Disposition,
    EnqueueError, EnqueueRequest, HandlerError, InMemoryBroker, LifecycleState, QueueConfig,
    QueueName, Task,
};

fn fast_config(queues: Vec<QueueConfig>) -> DispatcherConfig {
    DispatcherConfig::default()
        .with_queues(queues)
        .with_concurrency(2)
        .with_poll_timeout(Duration::from_millis(20))
        .with_broker_backoff(Duration::from_millis(20))
        .with_retry(RetryPolicy::immediate())
        .with_shutdown_deadline(Duration::from_millis(500))
}

fn default_queue() -> Vec<QueueConfig> {
    vec![QueueConfig::new("default", 1)]
}

async fn wait_for_counts<F>(broker: &dyn Broker, done: F) -> BrokerCounts
where
    F: Fn(&BrokerCounts) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let counts = broker.counts().await.unwrap();
        if done(&counts) {
            return counts;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting, last counts: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> Result<(), EmailError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), first_name.to_string()));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn welcome_email_is_sent_exactly_once_and_acked() {
    let sender = Arc::new(RecordingSender::default());
    let app = AppBuilder::new(fast_config(default_queue()))
        .register::<WelcomeEmailTask, _>(WelcomeEmailHandler::new(sender.clone()))
        .unwrap()
        .expect_tasks(&[WelcomeEmailTask::TYPE])
        .build()
        .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new(
            "welcome_email",
            "default",
            br#"{"to":"a@x.io","firstName":"Ana"}"#.to_vec(),
        ))
        .await
        .unwrap();

    let counts = wait_for_counts(app.broker().as_ref(), |c| c.acked == 1).await;
    assert_eq!(counts.outstanding(), 0);
    assert_eq!(counts.dead, 0);

    let report = app.shutdown().await;
    assert!(report.drained);
    assert_eq!(
        *sender.sent.lock().unwrap(),
        vec![("a@x.io".to_string(), "Ana".to_string())]
    );
}

#[tokio::test]
async fn unknown_task_type_is_dead_lettered_without_running_any_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let app = AppBuilder::new(fast_config(default_queue()))
        .register_fn("welcome_email", move |_ctx, _payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .unwrap()
        .build()
        .unwrap();
    app.start().unwrap();

    let task_id = app
        .producer()
        .enqueue(EnqueueRequest::new("unknown_type", "default", b"{}".to_vec()))
        .await
        .unwrap();

    wait_for_counts(app.broker().as_ref(), |c| c.dead == 1).await;
    let letters = app.broker().dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope.task_id(), task_id);
    assert_eq!(letters[0].reason, DeadLetterReason::MissingHandler);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    app.shutdown().await;
}

#[tokio::test]
async fn retryable_failures_stop_at_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let app = AppBuilder::new(fast_config(default_queue()).with_max_attempts(3))
        .register_fn("flaky", move |_ctx, _payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::retryable("smtp timeout")) }
        })
        .unwrap()
        .build()
        .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new("flaky", "default", Vec::new()))
        .await
        .unwrap();

    let counts = wait_for_counts(app.broker().as_ref(), |c| c.dead == 1).await;
    assert_eq!(counts.outstanding(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let letters = app.broker().dead_letters(1).await.unwrap();
    assert_eq!(letters[0].envelope.attempt(), 2);
    assert!(matches!(
        letters[0].reason,
        DeadLetterReason::AttemptsExhausted(ref msg) if msg.contains("smtp timeout")
    ));

    app.shutdown().await;
    let status = app.dispatcher().status();
    assert_eq!(status.retried, 2);
    assert_eq!(status.dead_lettered, 1);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let app = AppBuilder::new(fast_config(default_queue()))
        .register_fn("strict", move |_ctx, _payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::permanent("malformed address")) }
        })
        .unwrap()
        .build()
        .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new("strict", "default", Vec::new()))
        .await
        .unwrap();

    wait_for_counts(app.broker().as_ref(), |c| c.dead == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let letters = app.broker().dead_letters(1).await.unwrap();
    assert_eq!(
        letters[0].reason,
        DeadLetterReason::Permanent("malformed address".into())
    );

    app.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_handlers_never_exceed_concurrency() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, pk) = (Arc::clone(&current), Arc::clone(&peak));

    let app = AppBuilder::new(fast_config(default_queue()).with_concurrency(3))
        .register_fn("slow", move |_ctx, _payload| {
            let (cur, pk) = (Arc::clone(&cur), Arc::clone(&pk));
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                pk.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap()
        .build()
        .unwrap();

    let producer = app.producer();
    for _ in 0..20 {
        producer
            .enqueue(EnqueueRequest::new("slow", "default", Vec::new()))
            .await
            .unwrap();
    }
    app.start().unwrap();

    wait_for_counts(app.broker().as_ref(), |c| c.acked == 20).await;
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert!(app.dispatcher().status().peak_in_flight <= 3);

    app.shutdown().await;
}

#[tokio::test]
async fn pulls_follow_queue_weights() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let queues = vec![QueueConfig::new("high", 3), QueueConfig::new("low", 1)];
    let app = AppBuilder::new(fast_config(queues).with_concurrency(1))
        .register_fn("work", move |ctx, _payload| {
            log.lock().unwrap().push(ctx.queue().to_string());
            async { Ok(()) }
        })
        .unwrap()
        .build()
        .unwrap();

    let producer = app.producer();
    for _ in 0..40 {
        for queue in ["high", "low"] {
            producer
                .enqueue(EnqueueRequest::new("work", queue, Vec::new()))
                .await
                .unwrap();
        }
    }
    app.start().unwrap();

    wait_for_counts(app.broker().as_ref(), |c| c.acked == 80).await;
    app.shutdown().await;

    let seen = seen.lock().unwrap().clone();
    let first_window = &seen[..20];
    let high = first_window.iter().filter(|q| *q == "high").count();
    assert_eq!(high, 15);
    assert_eq!(first_window.len() - high, 5);
}

#[tokio::test]
async fn shutdown_abandons_handlers_that_ignore_the_deadline() {
    let app = AppBuilder::new(
        fast_config(default_queue()).with_shutdown_deadline(Duration::from_millis(200)),
    )
    .register_fn("stuck", |_ctx, _payload| async {
        std::future::pending::<()>().await;
        Ok(())
    })
    .unwrap()
    .build()
    .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new("stuck", "default", Vec::new()))
        .await
        .unwrap();
    wait_for_counts(app.broker().as_ref(), |c| c.leased == 1).await;

    let report = app.shutdown().await;
    assert!(!report.drained);
    assert_eq!(report.abandoned, 1);
    assert!(report.elapsed >= Duration::from_millis(200));
    assert!(report.elapsed < Duration::from_secs(2));
    assert_eq!(app.dispatcher().state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn dropped_shutdown_future_still_reaches_stopped() {
    let app = AppBuilder::new(
        fast_config(default_queue()).with_shutdown_deadline(Duration::from_millis(200)),
    )
    .register_fn("stuck", |_ctx, _payload| async {
        std::future::pending::<()>().await;
        Ok(())
    })
    .unwrap()
    .build()
    .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new("stuck", "default", Vec::new()))
        .await
        .unwrap();
    wait_for_counts(app.broker().as_ref(), |c| c.leased == 1).await;

    // 締め切り前に呼び出し側が諦める
    let gave_up = tokio::time::timeout(Duration::from_millis(20), app.shutdown()).await;
    assert!(gave_up.is_err());
    assert_eq!(app.dispatcher().state(), LifecycleState::Draining);

    let report = tokio::time::timeout(Duration::from_secs(2), app.shutdown())
        .await
        .expect("second shutdown must not hang");
    assert_eq!(report.abandoned, 1);
    assert!(!report.drained);
    assert_eq!(app.dispatcher().state(), LifecycleState::Stopped);
    assert!(app.producer().is_closed());
}

#[tokio::test]
async fn cooperative_handlers_finish_within_the_deadline() {
    let app = AppBuilder::new(fast_config(default_queue()))
        .register_fn("patient", |ctx, _payload| async move {
            ctx.cancelled().await;
            Err(HandlerError::retryable("interrupted by shutdown"))
        })
        .unwrap()
        .build()
        .unwrap();
    app.start().unwrap();

    app.producer()
        .enqueue(EnqueueRequest::new("patient", "default", Vec::new()))
        .await
        .unwrap();
    wait_for_counts(app.broker().as_ref(), |c| c.leased == 1).await;

    let report = app.shutdown().await;
    assert!(report.drained);
    assert_eq!(report.abandoned, 0);
    assert_eq!(app.dispatcher().status().retried, 1);
}

#[tokio::test]
async fn nothing_is_pulled_once_draining() {
    let late_calls = Arc::new(AtomicUsize::new(0));
    let late = Arc::clone(&late_calls);
    let app = AppBuilder::new(fast_config(default_queue()).with_concurrency(2))
        .register_fn("blocker", |ctx, _payload| async move {
            ctx.cancelled().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .unwrap()
        .register_fn("late", move |_ctx, _payload| {
            late.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .unwrap()
        .build()
        .unwrap();
    app.start().unwrap();

    let producer = app.producer();
    producer
        .enqueue(EnqueueRequest::new("blocker", "default", Vec::new()))
        .await
        .unwrap();
    wait_for_counts(app.broker().as_ref(), |c| c.leased == 1).await;

    let (report, late_enqueue) = tokio::join!(app.shutdown(), async {
        app.dispatcher()
            .wait_for_state(LifecycleState::Draining)
            .await;
        producer
            .enqueue(EnqueueRequest::new("late", "default", Vec::new()))
            .await
    });

    assert!(report.drained);
    // the producer stays open while draining, but no slot pulls the task
    assert!(late_enqueue.is_ok());
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        producer
            .enqueue(EnqueueRequest::new("late", "default", Vec::new()))
            .await,
        Err(EnqueueError::Closed)
    ));
}

#[tokio::test]
async fn settling_a_lease_twice_is_lease_not_found() {
    let app = AppBuilder::new(fast_config(default_queue()))
        .register_fn("noop", |_ctx, _payload| async { Ok(()) })
        .unwrap()
        .build()
        .unwrap();
    let producer = app.producer();
    producer
        .enqueue(EnqueueRequest::new("noop", "default", Vec::new()))
        .await
        .unwrap();

    // drive the broker by hand, the dispatcher is never started
    let delivery = app
        .broker()
        .pop(&[QueueName::new("default")], Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    app.broker().ack(&delivery.lease).await.unwrap();
    assert!(matches!(
        app.broker().ack(&delivery.lease).await,
        Err(BrokerError::LeaseNotFound(_))
    ));
    assert!(matches!(
        app.broker()
            .fail(
                &delivery.lease,
                Disposition::DeadLetter {
                    reason: DeadLetterReason::MissingHandler
                }
            )
            .await,
        Err(BrokerError::LeaseNotFound(_))
    ));
}

#[tokio::test]
async fn broker_outage_surfaces_on_enqueue_and_dispatch_recovers() {
    let broker = Arc::new(InMemoryBroker::default());
    let metrics = Arc::new(MetricsObserver::new());
    let app = AppBuilder::new(fast_config(default_queue()))
        .broker(broker.clone())
        .observer(metrics.clone())
        .register_fn("noop", |_ctx, _payload| async { Ok(()) })
        .unwrap()
        .build()
        .unwrap();

    broker.simulate_outage(true);
    app.start().unwrap();

    let err = app
        .producer()
        .enqueue(EnqueueRequest::new("noop", "default", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EnqueueError::BrokerUnavailable(_)));

    // slots keep backing off instead of dying
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(metrics.snapshot().errors > 0);
    assert_eq!(app.dispatcher().state(), LifecycleState::Running);

    broker.simulate_outage(false);
    app.producer()
        .enqueue(EnqueueRequest::new("noop", "default", Vec::new()))
        .await
        .unwrap();
    wait_for_counts(broker.as_ref(), |c| c.acked == 1).await;

    app.shutdown().await;
}

#[tokio::test]
async fn requeued_dead_letter_gets_a_fresh_attempt_budget() {
    let broker = Arc::new(InMemoryBroker::new(InMemoryBrokerConfig {
        lease_timeout: Duration::from_millis(50),
        ..InMemoryBrokerConfig::default()
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let app = AppBuilder::new(fast_config(default_queue()).with_max_attempts(3))
        .broker(broker.clone())
        .register_fn("noop", move |_ctx, _payload| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .unwrap()
        .build()
        .unwrap();

    let task_id = app
        .producer()
        .enqueue(EnqueueRequest::new("noop", "default", Vec::new()))
        .await
        .unwrap();

    // 3 deliveries whose leases are never settled
    let queues = [QueueName::new("default")];
    for _ in 0..3 {
        broker
            .pop(&queues, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
    }

    app.start().unwrap();
    wait_for_counts(broker.as_ref(), |c| c.dead == 1).await;
    let letters = broker.dead_letters(10).await.unwrap();
    assert!(matches!(letters[0].reason, DeadLetterReason::AttemptsExhausted(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(broker.requeue_dead(task_id).await.unwrap());
    let counts = wait_for_counts(broker.as_ref(), |c| c.acked == 1).await;
    assert_eq!(counts.dead, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    app.shutdown().await;
}
