//! Queue message types and redelivery policy.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use handoff_core::{MessageId, OwnerId, RequestId};

/// One accepted request, as carried by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub owner_id: OwnerId,
    pub request_id: RequestId,
    /// Opaque domain input, identical to the request record's payload.
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(owner_id: OwnerId, request_id: RequestId, payload: serde_json::Value) -> Self {
        Self {
            message_id: MessageId::new(),
            owner_id,
            request_id,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Handle proving a consumer currently holds a delivery.
///
/// A receipt is invalidated once the message becomes visible again, so a slow
/// consumer cannot ack a message somebody else is now processing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub(crate) String);

impl Receipt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Receipt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub message: QueueMessage,
    /// How many times this message has been received, this delivery included.
    pub receive_count: u32,
}

/// Entry in the dead-letter sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub message: QueueMessage,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(message: QueueMessage, receive_count: u32, reason: impl Into<String>) -> Self {
        Self {
            message,
            receive_count,
            dead_lettered_at: Utc::now(),
            reason: reason.into(),
        }
    }
}

/// Broker-side delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Receives allowed before the message is dead-lettered.
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 5,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Redelivery spacing for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of a burst
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after a given failed attempt (1-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_ms(attempt) as u64)
    }

    /// Delay after a failed attempt, offset by up to `jitter` of itself in
    /// either direction.
    ///
    /// The offset is derived from `seed` and the attempt, so messages failing
    /// together on the same attempt come back at different times while any one
    /// message's schedule stays reproducible.
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        let delay_ms = self.base_ms(attempt);
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            jitter_range * (unit_interval(seed, attempt) - 0.5) * 2.0
        } else {
            0.0
        };

        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Delay to use when the downstream suggested one (e.g. `Retry-After`).
    ///
    /// The hint wins when it is longer than the policy's own delay, capped at
    /// `max_delay` so one header cannot park a message indefinitely.
    pub fn delay_with_hint(&self, attempt: u32, seed: u64, hint: Option<Duration>) -> Duration {
        let own = self.delay_for(attempt, seed);
        match hint {
            Some(h) if h > own => h.min(self.max_delay),
            _ => own,
        }
    }

    fn base_ms(&self, attempt: u32) -> f64 {
        if attempt == 0 {
            return 0.0;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        }
    }
}

/// Jitter seed for one queue message.
pub fn jitter_seed(message_id: &MessageId) -> u64 {
    let mut hasher = DefaultHasher::new();
    message_id.hash(&mut hasher);
    hasher.finish()
}

/// Map `(seed, attempt)` to `[0, 1)` with a splitmix64 finaliser.
fn unit_interval(seed: u64, attempt: u32) -> f64 {
    let mut z = seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}
