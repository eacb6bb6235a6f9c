//! Explicit configuration injected into the ingest service and the worker.

use std::time::Duration;

pub use crate::queue::{QueueConfig, RetryPolicy};

/// Wait-loop settings for the ingest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Budget used when the caller sends no `x-wait-time-ms`.
    pub default_wait: Duration,
    /// Hard cap on any caller-supplied budget.
    pub max_wait: Duration,
    /// Re-read interval while waiting.
    pub poll_interval: Duration,
    /// A PENDING record older than this is assumed orphaned and re-enqueued.
    pub requeue_after: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_millis(2_000),
            max_wait: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(250),
            requeue_after: Duration::from_secs(60),
        }
    }
}

impl IngestConfig {
    /// Resolve the effective wait budget for a request.
    pub fn wait_budget(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_wait).min(self.max_wait)
    }
}

/// How long request records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub standard: Duration,
    /// Applied to completed audit-critical operations.
    pub audit: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            standard: Duration::from_secs(24 * 60 * 60),
            audit: Duration::from_secs(3 * 365 * 24 * 60 * 60),
        }
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Messages received per poll.
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty.
    pub idle_interval: Duration,
    /// Must match the queue's `max_receive_count`; the worker writes the final
    /// FAILED record on the last allowed receive.
    pub max_receive_count: u32,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_interval: Duration::from_millis(200),
            max_receive_count: QueueConfig::default().max_receive_count,
            retry_policy: RetryPolicy::default(),
        }
    }
}
