//! HandlerRegistry - Handler の登録と管理
//!
//! 登録は起動前にだけ行い、起動後は `Arc<HandlerRegistry>` として
//! 読み取り専用で共有します（ロック不要）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::context::TaskContext;
use super::handler::{DynHandler, FnHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{HandlerError, RegistryError, TaskType};

/// HandlerRegistry は task_type ごとに Handler を 1 つだけ保持する
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<WelcomeEmailTask, _>(WelcomeEmailHandler::new(sender))?;
///
/// // task_type で DynHandler を取得
/// let handler = registry.get(&TaskType::new("welcome_email"));
/// ```
///
/// # 内部実装
/// - `register::<T, H>(handler)` は TypedHandler でラップして DynHandler に変換
/// - `HashMap<TaskType, Arc<dyn DynHandler>>` で管理
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(T::TYPE, Arc::new(TypedHandler::new(handler)))
    }

    /// Register a closure over raw payload bytes.
    pub fn register_fn<F, Fut>(
        &mut self,
        task_type: impl Into<TaskType>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register_dyn(task_type, Arc::new(FnHandler::new(f)))
    }

    pub fn register_dyn(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), RegistryError> {
        let task_type = task_type.into();
        if !task_type.is_valid() {
            return Err(RegistryError::InvalidType(task_type));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Sorted, so logs and error messages are stable.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.registered_types())
            .finish()
    }
}
