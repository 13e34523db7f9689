//! App - アプリケーション層
//!
//! Broker・Registry・設定を組み合わせて、投入と実行のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder / App**: 構築とワイヤリング
//! - **Producer**: タスク投入
//! - **Dispatcher**: worker slot による実行（pop→handle→decide→ack/fail）
//! - **WeightedScheduler**: queue の重み付き pull 順
//! - **Lifecycle**: Created → Running → Draining → Stopped

pub mod builder;
pub mod dispatcher;
pub mod lifecycle;
pub mod producer;
pub mod scheduler;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::dispatcher::Dispatcher;
pub use self::lifecycle::{LifecycleError, LifecycleState, ShutdownReport};
pub use self::producer::{EnqueueRequest, Producer};
pub use self::scheduler::WeightedScheduler;
pub use self::status::DispatcherStatus;
