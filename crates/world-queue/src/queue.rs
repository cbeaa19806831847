//! Queue contract and worker configuration

use std::time::Duration;

use async_trait::async_trait;

use world_core::Result;

use crate::retry::RetryPolicy;

/// Options for a single enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Deduplication key: an enqueue whose key already exists returns the
    /// existing message id without inserting
    pub idempotency_key: Option<String>,
}

/// Receipt returned by a successful (or deduplicated) enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub message_id: String,
}

/// At-least-once job queue over the jobs table.
///
/// Both implementations share this contract; only dispatch latency differs
/// (LISTEN/NOTIFY wakeups on postgres, a 200 ms poll otherwise).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message onto a caller-side queue name
    /// (`__wkf_workflow_<id>` / `__wkf_step_<id>`)
    async fn enqueue(
        &self,
        queue_name: &str,
        message: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt>;

    /// Begin the worker loops; idempotent, call once per process
    async fn start(&self) -> Result<()>;

    /// Stop accepting new polls; in-flight handlers run to completion
    async fn stop(&self);
}

/// Worker and retry configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Prefix for the stable job-queue names (`{job_prefix}flows` / `steps`)
    pub job_prefix: String,

    /// Workers per queue name
    pub worker_concurrency: usize,

    /// Tick between polls for due jobs
    pub poll_interval: Duration,

    /// How long a lease holds before the job becomes stealable; doubles as
    /// the de-facto handler timeout
    pub lease_duration: Duration,

    /// Candidates fetched per poll
    pub batch_size: usize,

    /// Default max_attempts stamped on new job rows
    pub max_attempts: i32,

    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_prefix: "workflow_".to_string(),
            worker_concurrency: 10,
            poll_interval: Duration::from_millis(200),
            lease_duration: Duration::from_secs(30),
            batch_size: 10,
            max_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_prefix = prefix.into();
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, attempts: i32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.job_prefix, "workflow_");
        assert_eq!(config.worker_concurrency, 10);
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_job_prefix("jobs_")
            .with_worker_concurrency(2)
            .with_poll_interval(Duration::from_millis(20))
            .with_lease_duration(Duration::from_secs(5))
            .with_batch_size(4)
            .with_max_attempts(5);

        assert_eq!(config.job_prefix, "jobs_");
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.lease_duration, Duration::from_secs(5));
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_builder_floors() {
        let config = QueueConfig::new()
            .with_worker_concurrency(0)
            .with_batch_size(0)
            .with_max_attempts(0);
        assert_eq!(config.worker_concurrency, 1);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
    }
}
