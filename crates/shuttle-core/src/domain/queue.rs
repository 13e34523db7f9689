//! Queue - 名前付きパーティションと重み

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::ConfigError;

/// Logical queue name ("critical", "default", "low", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A queue and its scheduling weight.
///
/// Weight 0 is kept representable so that configuration mistakes surface at
/// dispatcher start instead of being silently clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: QueueName,
    pub weight: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<QueueName>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Parses `name=weight`, e.g. `critical=6`.
impl FromStr for QueueConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, weight) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidQueueSpec(s.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidQueueSpec(s.to_string()));
        }
        let weight = weight
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidQueueSpec(s.to_string()))?;
        Ok(Self::new(name, weight))
    }
}
