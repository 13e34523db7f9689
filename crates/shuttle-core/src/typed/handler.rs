//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (`Handler<T>`): 型安全な表層
//! - Object-safe trait (`DynHandler`): Registry と Dispatcher が扱う内部表現
//! - Type erasure (`TypedHandler<T, H>` → `DynHandler`)

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::codec::PayloadCodec;
use super::context::TaskContext;
use super::task::Task;
use crate::domain::HandlerError;

/// Handler は Task を実行する
///
/// # 使用例
/// ```ignore
/// struct ResizeHandler;
///
/// #[async_trait]
/// impl Handler<ResizeImage> for ResizeHandler {
///     async fn handle(&self, ctx: &TaskContext, task: ResizeImage) -> Result<(), HandlerError> {
///         tracing::info!(task_id = %ctx.task_id(), path = %task.path, "resizing");
///         Ok(())
///     }
/// }
/// ```
///
/// # エラーの返し方
/// - 再試行で成功しうる失敗: `HandlerError::Retryable`
/// - 再試行しても無駄な失敗: `HandlerError::Permanent`（即 dead-letter）
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, task: T) -> Result<(), HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// payload bytes をそのまま受け取るので、
/// `HashMap<TaskType, Arc<dyn DynHandler>>` に格納できます。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn call(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<(), HandlerError> {
        // 壊れた payload は何度配送しても壊れたまま
        let task: T = PayloadCodec::decode(&payload)
            .map_err(|e| HandlerError::permanent(e.to_string()))?;
        self.handler.handle(&ctx, task).await
    }
}

/// Closure-backed handler working on raw payload bytes.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<(), HandlerError> {
        (self.f)(ctx, payload).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::typed::task::fixtures::{AnotherTestTask, TestTask};

    pub struct TestTaskHandler;

    #[async_trait]
    impl Handler<TestTask> for TestTaskHandler {
        async fn handle(&self, _ctx: &TaskContext, task: TestTask) -> Result<(), HandlerError> {
            if task.value < 0 {
                return Err(HandlerError::permanent("negative value"));
            }
            Ok(())
        }
    }

    pub struct AnotherTestTaskHandler;

    #[async_trait]
    impl Handler<AnotherTestTask> for AnotherTestTaskHandler {
        async fn handle(&self, _ctx: &TaskContext, _task: AnotherTestTask) -> Result<(), HandlerError> {
            Ok(())
        }
    }
}
