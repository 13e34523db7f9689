//! shuttle-core
//!
//! Durable, priority-queued background task dispatcher.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, queue, envelope, retry, decision, outcome, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator）
//! - **broker**: Broker trait、InMemoryBroker、Observer
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry, PayloadCodec）
//! - **app**: Producer, Dispatcher, Lifecycle, AppBuilder
//! - **tasks**: 組み込みタスク（welcome email）
//!
//! # 使用例
//! ```ignore
//! let app = AppBuilder::new(DispatcherConfig::from_env()?)
//!     .register::<WelcomeEmailTask, _>(WelcomeEmailHandler::new(Arc::new(LoggingEmailSender)))?
//!     .build()?;
//!
//! let producer = app.producer();
//! producer
//!     .enqueue_task("default", &WelcomeEmailTask::new("ana@example.com", "Ana"))
//!     .await?;
//!
//! let token = install_shutdown_handler();
//! app.run_until(token.cancelled_owned()).await?;
//! ```

pub mod app;
pub mod broker;
pub mod config;
pub mod domain;
pub mod ports;
pub mod shutdown;
pub mod tasks;
pub mod typed;

pub use app::{
    App, AppBuilder, BuildError, Dispatcher, DispatcherStatus, EnqueueRequest, LifecycleError,
    LifecycleState, Producer, ShutdownReport,
};
pub use broker::{Broker, BrokerCounts, DeadLetter, Delivery, Disposition, InMemoryBroker, LeaseToken};
pub use config::DispatcherConfig;
pub use domain::{
    BrokerError, DeadLetterReason, EnqueueError, HandlerError, QueueConfig, QueueName,
    RegistryError, TaskEnvelope, TaskId, TaskType,
};
pub use shutdown::install_shutdown_handler;
pub use typed::{Handler, HandlerRegistry, Task, TaskContext};
