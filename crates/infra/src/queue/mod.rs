//! Work queue: one message per accepted request, at-least-once delivery.
//!
//! Two implementations share [`WorkQueue`]:
//! - [`InMemoryWorkQueue`] for tests and single-process deployments
//! - `RedisStreamsWorkQueue` (feature `redis`) for durable multi-worker setups

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod types;
pub mod work_queue;

pub use memory::{InMemoryWorkQueue, QueueStats};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsWorkQueue;
pub use types::{
    BackoffStrategy, DeadLetterEntry, Delivery, QueueConfig, QueueMessage, Receipt, RetryPolicy,
    jitter_seed,
};
pub use work_queue::{QueueError, WorkQueue};
