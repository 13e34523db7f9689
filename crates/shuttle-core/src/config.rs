//! Dispatcher configuration.

use std::collections::HashSet;
use std::time::Duration;

use crate::domain::{ConfigError, QueueConfig, RetryPolicy};

pub const ENV_CONCURRENCY: &str = "SHUTTLE_CONCURRENCY";
pub const ENV_QUEUES: &str = "SHUTTLE_QUEUES";
pub const ENV_MAX_ATTEMPTS: &str = "SHUTTLE_MAX_ATTEMPTS";
pub const ENV_SHUTDOWN_DEADLINE_MS: &str = "SHUTTLE_SHUTDOWN_DEADLINE_MS";

/// Startup configuration for a dispatcher and its producer.
///
/// Fixed once the dispatcher is built.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queues in declaration order; the order breaks scheduling ties.
    pub queues: Vec<QueueConfig>,
    /// Worker slots, i.e. maximum concurrent handler invocations.
    pub concurrency: usize,
    /// Deliveries allowed per task before it is dead-lettered.
    pub max_attempts: u32,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_deadline: Duration,
    /// How long one broker pop blocks before the slot re-checks the schedule.
    pub poll_timeout: Duration,
    /// Pause after the broker reports itself unavailable.
    pub broker_backoff: Duration,
    /// Lease heartbeat while a handler runs.
    pub lease_renew_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueConfig::new("critical", 6),
                QueueConfig::new("default", 3),
                QueueConfig::new("low", 1),
            ],
            concurrency: 10,
            max_attempts: 5,
            shutdown_deadline: Duration::from_secs(8),
            poll_timeout: Duration::from_secs(1),
            broker_backoff: Duration::from_secs(1),
            lease_renew_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `SHUTTLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_CONCURRENCY) {
            config.concurrency = parse_env(ENV_CONCURRENCY, &value)?;
        }
        if let Some(value) = lookup(ENV_QUEUES) {
            config.queues = parse_queues(&value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            config.max_attempts = parse_env(ENV_MAX_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_SHUTDOWN_DEADLINE_MS) {
            let ms: u64 = parse_env(ENV_SHUTDOWN_DEADLINE_MS, &value)?;
            config.shutdown_deadline = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_queues(mut self, queues: Vec<QueueConfig>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_broker_backoff(mut self, backoff: Duration) -> Self {
        self.broker_backoff = backoff;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Structural checks. Queue weights are checked when the dispatcher starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.as_str().trim().is_empty() {
                return Err(ConfigError::InvalidQueueSpec(queue.name.to_string()));
            }
            if !seen.insert(&queue.name) {
                return Err(ConfigError::DuplicateQueue(queue.name.clone()));
            }
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(())
    }
}

/// Parses `critical=6,default=3,low=1`.
pub fn parse_queues(value: &str) -> Result<Vec<QueueConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueName;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_mirror_the_job_service() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(
            cfg.queues,
            vec![
                QueueConfig::new("critical", 6),
                QueueConfig::new("default", 3),
                QueueConfig::new("low", 1),
            ]
        );
        assert_eq!(cfg.shutdown_deadline, Duration::from_secs(8));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        let cfg = DispatcherConfig::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "4"),
            (ENV_QUEUES, "high=2, low=1"),
            (ENV_MAX_ATTEMPTS, "3"),
            (ENV_SHUTDOWN_DEADLINE_MS, "1500"),
        ]))
        .unwrap();

        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.queues.len(), 2);
        assert_eq!(cfg.queues[0].name, QueueName::new("high"));
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.shutdown_deadline, Duration::from_millis(1500));
    }

    #[test]
    fn invalid_env_value_is_reported() {
        let err = DispatcherConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "many")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_CONCURRENCY.to_string(),
                value: "many".to_string(),
            }
        );
    }

    #[test]
    fn validate_rejects_structural_mistakes() {
        let base = DispatcherConfig::default();

        assert_eq!(
            base.clone().with_queues(Vec::new()).validate(),
            Err(ConfigError::NoQueues)
        );
        assert_eq!(
            base.clone()
                .with_queues(vec![QueueConfig::new("a", 1), QueueConfig::new("a", 2)])
                .validate(),
            Err(ConfigError::DuplicateQueue(QueueName::new("a")))
        );
        assert_eq!(
            base.clone().with_concurrency(0).validate(),
            Err(ConfigError::ZeroConcurrency)
        );
        assert_eq!(
            base.with_max_attempts(0).validate(),
            Err(ConfigError::ZeroMaxAttempts)
        );
    }
}
