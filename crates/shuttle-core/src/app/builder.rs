//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! Producer と Dispatcher を同じ Broker・同じ queue 設定で組み立てます。
//!
//! # Fail-fast 設計
//! - expect_tasks() で期待される task_type を登録
//! - build() 時に「期待集合 ⊆ 登録済み集合」と設定の整合性をチェック
//! - 不足があれば BuildError を返す

use std::future::Future;
use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::lifecycle::{LifecycleError, ShutdownReport};
use super::producer::Producer;
use crate::broker::{Broker, BrokerObserver, InMemoryBroker, ObservedBroker};
use crate::config::DispatcherConfig;
use crate::domain::{ConfigError, Decider, DefaultDecider, HandlerError, RegistryError, TaskType};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::typed::{Handler, HandlerRegistry, Task, TaskContext};

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<TaskType>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(DispatcherConfig::default())
///     .register::<WelcomeEmailTask, _>(WelcomeEmailHandler::new(sender))?
///     .expect_tasks(&[WelcomeEmailTask::TYPE])
///     .build()?;
/// app.start()?;
/// ```
pub struct AppBuilder {
    config: DispatcherConfig,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<TaskType>>,
    broker: Option<Arc<dyn Broker>>,
    observers: Vec<Arc<dyn BrokerObserver>>,
    decider: Option<Arc<dyn Decider>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl AppBuilder {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            broker: None,
            observers: Vec::new(),
            decider: None,
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// 共有 Broker を指定（省略時は InMemoryBroker）
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Observer を追加（登録順に呼ばれる）
    pub fn observer(mut self, observer: Arc<dyn BrokerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// Closure handler を登録
    pub fn register_fn<F, Fut>(
        mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.registry.register_fn(task_type, f)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| TaskType::new(*t)).collect());
        self
    }

    /// AppBuilder を構築して App を生成
    pub fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<TaskType> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let mut broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::default()));
        if !self.observers.is_empty() {
            let observed = self
                .observers
                .into_iter()
                .fold(ObservedBroker::new(broker), ObservedBroker::with_observer);
            broker = Arc::new(observed);
        }

        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry.clone())));

        let producer = Producer::new(
            Arc::clone(&broker),
            self.config.queues.iter().map(|q| q.name.clone()),
            ids,
            self.clock,
        );
        let dispatcher =
            Dispatcher::with_decider(self.config, broker, Arc::new(self.registry), decider);
        dispatcher.attach_producer(producer.clone());

        Ok(App {
            producer,
            dispatcher,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

/// App は Producer と Dispatcher の組
///
/// Producer は上流に配り、Dispatcher はこのプロセスで実行します。
pub struct App {
    producer: Producer,
    dispatcher: Dispatcher,
}

impl App {
    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        self.producer.broker()
    }

    pub fn start(&self) -> Result<(), LifecycleError> {
        self.dispatcher.start()
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.dispatcher.shutdown().await
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run_until<F>(&self, signal: F) -> Result<ShutdownReport, LifecycleError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        signal.await;
        tracing::info!("shutdown signal received");
        Ok(self.shutdown().await)
    }
}
