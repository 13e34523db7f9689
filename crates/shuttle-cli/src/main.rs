use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use shuttle_core::broker::{MetricsObserver, TracingObserver};
use shuttle_core::domain::RetryPolicy;
use shuttle_core::tasks::{EmailError, EmailSender, WelcomeEmailHandler, WelcomeEmailTask};
use shuttle_core::{
    AppBuilder, Broker, BrokerCounts, DispatcherConfig, EnqueueRequest, QueueConfig, Task,
    install_shutdown_handler,
};

#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(version)]
#[command(about = "Priority-queued background task dispatcher (in-memory demo)")]
struct Args {
    /// Worker slots (overrides SHUTTLE_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Queue and weight, repeatable. Example: --queue critical=6 --queue low=1
    #[arg(long = "queue", value_name = "NAME=WEIGHT")]
    queues: Vec<QueueConfig>,

    /// Deliveries per task before dead-lettering (overrides SHUTTLE_MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Grace period for in-flight handlers on shutdown
    #[arg(long)]
    shutdown_deadline_secs: Option<u64>,

    /// First retry delay in milliseconds
    #[arg(long, default_value_t = 200)]
    retry_base_ms: u64,

    /// Welcome emails to enqueue
    #[arg(long, default_value_t = 5)]
    tasks: usize,

    /// Sends that fail with a transport error before the sender recovers
    #[arg(long, default_value_t = 2)]
    failures: u32,

    /// Keep running after the demo workload drains; stop with Ctrl-C
    #[arg(long)]
    keep_running: bool,
}

/// Email sender that fails the first `n` sends.
struct FlakyEmailSender {
    remaining_failures: AtomicU32,
}

impl FlakyEmailSender {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl EmailSender for FlakyEmailSender {
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> Result<(), EmailError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(EmailError::Transport(format!(
                "intentional failure (left={left})"
            )));
        }

        println!("Welcome, {first_name} <{to}>!");
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(args: &Args) -> anyhow::Result<DispatcherConfig> {
    let mut config = DispatcherConfig::from_env().context("invalid SHUTTLE_* environment")?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if !args.queues.is_empty() {
        config.queues = args.queues.clone();
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(secs) = args.shutdown_deadline_secs {
        config.shutdown_deadline = Duration::from_secs(secs);
    }
    config.retry = RetryPolicy {
        base_delay: Duration::from_millis(args.retry_base_ms),
        ..RetryPolicy::default()
    };
    config.validate()?;
    Ok(config)
}

/// Poll until nothing is pending, leased or scheduled.
async fn wait_until_idle(broker: &dyn Broker) -> anyhow::Result<BrokerCounts> {
    loop {
        let counts = broker.counts().await?;
        if counts.outstanding() == 0 {
            return Ok(counts);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = build_config(&args)?;
    let queues: Vec<_> = config.queues.iter().map(|q| q.name.clone()).collect();

    // (A) Producer と Dispatcher を同じ Broker で組み立てる
    let metrics = Arc::new(MetricsObserver::new());
    let sender = Arc::new(FlakyEmailSender::new(args.failures));
    let app = AppBuilder::new(config)
        .observer(Arc::new(TracingObserver))
        .observer(metrics.clone())
        .register::<WelcomeEmailTask, _>(WelcomeEmailHandler::new(sender))?
        .expect_tasks(&[WelcomeEmailTask::TYPE])
        .build()?;

    // (B) worker slot を起動
    app.start()?;
    let shutdown = install_shutdown_handler();

    // (C) タスク投入（queue は順番に割り振る）
    let producer = app.producer();
    for i in 0..args.tasks {
        let queue = queues[i % queues.len()].clone();
        let task = WelcomeEmailTask::new(format!("user{i}@example.com"), format!("User{i}"));
        let id = producer.enqueue_task(queue.clone(), &task).await?;
        println!("enqueued welcome_email: id={id} queue={queue}");
    }

    // handler が無い task_type は dead-letter に行く
    let payload = serde_json::to_vec(&serde_json::json!({ "hello": "world" }))?;
    let id = producer
        .enqueue(EnqueueRequest::new("unknown_type", queues[0].clone(), payload))
        .await?;
    println!("enqueued unknown_type: id={id}");

    // (D) 全部終わるか、シグナルが来るまで待つ
    let counts = if args.keep_running {
        shutdown.cancelled().await;
        app.broker().counts().await?
    } else {
        tokio::select! {
            _ = shutdown.cancelled() => app.broker().counts().await?,
            counts = wait_until_idle(app.broker().as_ref()) => counts?,
        }
    };
    let dead_letters = app.broker().dead_letters(10).await?;

    // (E) graceful shutdown
    let report = app.shutdown().await;

    println!(
        "final counts: acked={} dead={} pending={} scheduled={} leased={}",
        counts.acked, counts.dead, counts.pending, counts.scheduled, counts.leased
    );
    for letter in &dead_letters {
        println!(
            "dead letter: id={} type={} reason={}",
            letter.envelope.task_id(),
            letter.envelope.task_type(),
            letter.reason
        );
    }
    println!("broker traffic: {:?}", metrics.snapshot());
    println!(
        "shutdown: drained={} abandoned={} elapsed={:?}",
        report.drained, report.abandoned, report.elapsed
    );
    Ok(())
}
