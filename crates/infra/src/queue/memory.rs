//! In-memory work queue with SQS-style visibility semantics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use handoff_core::MessageId;

use super::types::{DeadLetterEntry, Delivery, QueueConfig, QueueMessage, Receipt};
use super::work_queue::{QueueError, WorkQueue};

/// Queue depth snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
    pub delayed: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
struct Slot {
    message: QueueMessage,
    receive_count: u32,
    visible_at: Instant,
    /// Set while a consumer holds the message.
    receipt: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    slots: VecDeque<Slot>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// In-memory queue for tests/dev.
///
/// Uses `tokio::time::Instant`, so tests can drive visibility timeouts with a
/// paused clock.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    config: QueueConfig,
    state: Mutex<State>,
}

impl InMemoryWorkQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> QueueStats {
        let Ok(state) = self.state.lock() else {
            return QueueStats::default();
        };
        let now = Instant::now();
        let mut stats = QueueStats {
            dead_lettered: state.dead_letters.len(),
            ..QueueStats::default()
        };
        for slot in &state.slots {
            if slot.visible_at <= now {
                stats.visible += 1;
            } else if slot.receipt.is_some() {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats
    }

    /// Messages not yet deleted, in flight and delayed ones included.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::Broker("queue lock poisoned".to_string())
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn send(&self, message: QueueMessage) -> Result<MessageId, QueueError> {
        let id = message.message_id;
        let mut state = self.state.lock().map_err(poisoned)?;
        state.slots.push_back(Slot {
            message,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(poisoned)?;
        let State {
            slots,
            dead_letters,
        } = &mut *state;

        let mut deliveries = Vec::new();
        let mut idx = 0;
        while idx < slots.len() && deliveries.len() < max {
            if slots[idx].visible_at > now {
                idx += 1;
                continue;
            }

            if slots[idx].receive_count >= self.config.max_receive_count {
                if let Some(slot) = slots.remove(idx) {
                    warn!(
                        message_id = %slot.message.message_id,
                        request_id = %slot.message.request_id,
                        receive_count = slot.receive_count,
                        "message exceeded max receive count, dead-lettering"
                    );
                    dead_letters.push(DeadLetterEntry::new(
                        slot.message,
                        slot.receive_count,
                        "max receive count exceeded",
                    ));
                }
                continue;
            }

            let slot = &mut slots[idx];
            slot.receive_count += 1;
            slot.visible_at = now + self.config.visibility_timeout;
            let receipt = format!("{}:{}", slot.message.message_id, slot.receive_count);
            slot.receipt = Some(receipt.clone());
            deliveries.push(Delivery {
                receipt: Receipt(receipt),
                message: slot.message.clone(),
                receive_count: slot.receive_count,
            });
            idx += 1;
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(poisoned)?;
        let pos = state
            .slots
            .iter()
            .position(|s| s.receipt.as_deref() == Some(receipt.as_str()) && s.visible_at > now)
            .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;
        state.slots.remove(pos);
        Ok(())
    }

    async fn retry_later(&self, receipt: &Receipt, delay: Duration) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().map_err(poisoned)?;
        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.receipt.as_deref() == Some(receipt.as_str()) && s.visible_at > now)
            .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;
        slot.receipt = None;
        slot.visible_at = now + delay;
        Ok(())
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.dead_letters.iter().take(limit).cloned().collect())
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let pos = state
            .dead_letters
            .iter()
            .position(|d| &d.message.message_id == message_id)
            .ok_or(QueueError::NotFound(*message_id))?;
        let entry = state.dead_letters.remove(pos);
        state.slots.push_back(Slot {
            message: entry.message,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt: None,
        });
        Ok(())
    }
}
