//! Work queue abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use handoff_core::MessageId;

use super::types::{DeadLetterEntry, Delivery, QueueMessage, Receipt};

/// At-least-once broker carrying one message per accepted request.
///
/// Consumers must tolerate duplicates: a message whose receipt is neither
/// acked nor rescheduled reappears after the visibility timeout.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message.
    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError>;

    /// Receive up to `max` visible messages, hiding them for the visibility
    /// timeout. Messages past the max receive count are dead-lettered instead.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Delete a message after it was handled.
    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Make a received message visible again after `delay` (backoff).
    async fn retry_later(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError>;

    /// Inspect the dead-letter sink (oldest first).
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Move a dead-lettered message back onto the queue with a fresh receive count.
    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("receipt is no longer valid: {0}")]
    StaleReceipt(String),
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("broker error: {0}")]
    Broker(String),
}

#[async_trait]
impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        (**self).send(message).await
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        (**self).receive(max).await
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        (**self).ack(receipt).await
    }

    async fn retry_later(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        (**self).retry_later(receipt, delay).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).dead_letters(limit).await
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
        (**self).redrive(message_id).await
    }
}
