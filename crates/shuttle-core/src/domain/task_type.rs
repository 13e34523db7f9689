//! TaskType - Handler を選択するためのタグ
//!
//! # 命名規約（推奨）
//! - `{domain}_{action}` または `{namespace}.{domain}.{action}.v{major}`
//! - 例: `welcome_email`, `acme.billing.charge.v1`
//!
//! payload のスキーマを壊す変更をするときは新しい TaskType を切ることで、
//! Broker に残っている古い envelope と新しい Handler を独立に進化させられます。

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only tags can never be routed.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}
