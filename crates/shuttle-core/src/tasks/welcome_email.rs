//! Welcome email - サインアップ直後に送るメール
//!
//! メール送信そのものは [`EmailSender`] に委譲します。handler はグローバルな
//! client を持たず、構築時に sender を受け取ります。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::HandlerError;
use crate::typed::{Handler, Task, TaskContext};

/// Payload: `{"to": "...", "firstName": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeEmailTask {
    pub to: String,
    pub first_name: String,
}

impl WelcomeEmailTask {
    pub fn new(to: impl Into<String>, first_name: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            first_name: first_name.into(),
        }
    }
}

impl Task for WelcomeEmailTask {
    const TYPE: &'static str = "welcome_email";
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmailError {
    /// The provider refused the message. Sending again will not help.
    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("failed to send email: {0}")]
    Transport(String),
}

impl From<EmailError> for HandlerError {
    fn from(err: EmailError) -> Self {
        match err {
            EmailError::Rejected(_) => HandlerError::permanent(err.to_string()),
            EmailError::Transport(_) => HandlerError::retryable(err.to_string()),
        }
    }
}

/// Outbound email port.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> Result<(), EmailError>;
}

/// Logs instead of sending. For local runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_welcome_email(&self, to: &str, first_name: &str) -> Result<(), EmailError> {
        tracing::info!(to, first_name, "welcome email rendered (not delivered)");
        Ok(())
    }
}

pub struct WelcomeEmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl WelcomeEmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Handler<WelcomeEmailTask> for WelcomeEmailHandler {
    async fn handle(&self, ctx: &TaskContext, task: WelcomeEmailTask) -> Result<(), HandlerError> {
        tracing::info!(
            kind = "welcome",
            to = %task.to,
            attempt = ctx.attempt(),
            "Processing welcome email task"
        );

        if task.to.trim().is_empty() {
            return Err(HandlerError::permanent("welcome email has no recipient"));
        }

        if let Err(e) = self
            .sender
            .send_welcome_email(&task.to, &task.first_name)
            .await
        {
            tracing::error!(kind = "welcome", to = %task.to, error = %e, "Failed to send welcome email");
            return Err(e.into());
        }

        tracing::info!(kind = "welcome", to = %task.to, "Welcome email sent successfully");
        Ok(())
    }
}
