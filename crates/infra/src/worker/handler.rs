//! Per-message processing: PROCESSING, side effect, exactly one terminal write.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::{TtlPolicy, WorkerConfig};
use crate::grants::{ExecutionError, GrantExecutor, GrantOperation, user_facing};
use crate::queue::{Delivery, Receipt, jitter_seed};
use crate::request_store::{
    ErrorCode, RequestError, RequestStore, RequestStoreError, Transition, TransitionOutcome,
};

/// What the queue should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete it.
    Done,
    /// Make it visible again after `delay`.
    Retry { delay: Duration },
}

/// What happened to the request behind a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// Nothing to do: record missing, already terminal, or taken by a concurrent worker.
    Skipped,
    /// Left non-terminal for a later attempt.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct MessageReport {
    pub receipt: Receipt,
    pub outcome: Outcome,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub messages: Vec<MessageReport>,
}

impl BatchReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.messages.iter().filter(|m| m.outcome == outcome).count()
    }

    pub fn retries(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m.disposition, Disposition::Retry { .. }))
            .count()
    }
}

/// Consumes queue messages and drives request records to a terminal state.
#[derive(Clone)]
pub struct WorkerHandler {
    store: Arc<dyn RequestStore>,
    executor: GrantExecutor,
    config: WorkerConfig,
    ttl: TtlPolicy,
}

impl core::fmt::Debug for WorkerHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandler")
            .field("config", &self.config)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl WorkerHandler {
    pub fn new(
        store: Arc<dyn RequestStore>,
        executor: GrantExecutor,
        config: WorkerConfig,
        ttl: TtlPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            ttl,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle a batch. Messages are independent; one failing never affects another.
    pub async fn handle_batch(&self, deliveries: &[Delivery]) -> BatchReport {
        let mut report = BatchReport::default();
        for delivery in deliveries {
            let (outcome, disposition) = self.handle(delivery).await;
            report.messages.push(MessageReport {
                receipt: delivery.receipt.clone(),
                outcome,
                disposition,
            });
        }
        report
    }

    #[instrument(
        skip(self, delivery),
        fields(
            request_id = %delivery.message.request_id,
            message_id = %delivery.message.message_id,
            receive_count = delivery.receive_count
        )
    )]
    pub async fn handle(&self, delivery: &Delivery) -> (Outcome, Disposition) {
        let message = &delivery.message;
        let request_id = &message.request_id;
        let owner_id = &message.owner_id;

        let record = match self.store.get(request_id, owner_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("no live record for message; dropping");
                return (Outcome::Skipped, Disposition::Done);
            }
            Err(err) => return self.store_unavailable(delivery, err),
        };
        if record.is_terminal() {
            debug!(status = %record.status, "duplicate delivery for finished request");
            return (Outcome::Skipped, Disposition::Done);
        }

        let operation = match GrantOperation::from_payload(&message.payload) {
            Ok(op) => op,
            Err(err) => {
                let error = user_facing(
                    ErrorCode::InvalidPayload,
                    format!("payload could not be decoded: {err}"),
                );
                return self.finish_failed(delivery, error, Disposition::Done).await;
            }
        };

        match self
            .store
            .transition(request_id, owner_id, Transition::processing())
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(TransitionOutcome::Ignored { .. }) | Err(RequestStoreError::NotFound(_)) => {
                return (Outcome::Skipped, Disposition::Done);
            }
            Err(err) => return self.store_unavailable(delivery, err),
        }

        match self.executor.execute(owner_id, request_id, &operation).await {
            Ok(result) => {
                let ttl = if operation.is_audit_critical() {
                    self.ttl.audit
                } else {
                    self.ttl.standard
                };
                let transition = Transition::completed(result).with_ttl(ttl);
                match self.store.transition(request_id, owner_id, transition).await {
                    Ok(_) => {
                        info!(op = operation.name(), "request completed");
                        (Outcome::Completed, Disposition::Done)
                    }
                    // The side effect is idempotent, so redelivery converges.
                    Err(err) => self.store_unavailable(delivery, err),
                }
            }
            Err(ExecutionError::Terminal(error)) => {
                self.finish_failed(delivery, error, Disposition::Done).await
            }
            Err(err) => {
                let delay = self
                    .config
                    .retry_policy
                    .delay_with_hint(
                        delivery.receive_count,
                        jitter_seed(&delivery.message.message_id),
                        err.retry_after(),
                    );

                if delivery.receive_count >= self.config.max_receive_count {
                    warn!(error = %err, "retries exhausted");
                    let error = err.into_request_error();
                    // Still retried so the queue moves the message to the dead-letter sink.
                    return self
                        .finish_failed(delivery, error, Disposition::Retry { delay })
                        .await;
                }

                debug!(error = %err, delay_ms = delay.as_millis() as u64, "deferring request");
                (Outcome::Deferred, Disposition::Retry { delay })
            }
        }
    }

    async fn finish_failed(
        &self,
        delivery: &Delivery,
        error: RequestError,
        disposition: Disposition,
    ) -> (Outcome, Disposition) {
        let message = &delivery.message;
        let code = error.code;
        let transition = Transition::failed(error).with_ttl(self.ttl.standard);
        match self
            .store
            .transition(&message.request_id, &message.owner_id, transition)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(code = code.as_str(), "request failed");
                (Outcome::Failed, disposition)
            }
            Ok(TransitionOutcome::Ignored { .. }) | Err(RequestStoreError::NotFound(_)) => {
                (Outcome::Skipped, disposition)
            }
            Err(err) => self.store_unavailable(delivery, err),
        }
    }

    fn store_unavailable(&self, delivery: &Delivery, err: RequestStoreError) -> (Outcome, Disposition) {
        error!(error = %err, "request store unavailable");
        let delay = self
            .config
            .retry_policy
            .delay_for(
                delivery.receive_count,
                jitter_seed(&delivery.message.message_id),
            );
        (Outcome::Deferred, Disposition::Retry { delay })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use handoff_core::{OwnerId, RequestId};

    use super::*;
    use crate::downstream::{DownstreamError, ScriptedGrantApi};
    use crate::grants::store::GrantStore;
    use crate::grants::InMemoryGrantStore;
    use crate::queue::{
        BackoffStrategy, InMemoryWorkQueue, QueueConfig, QueueMessage, RetryPolicy, WorkQueue,
    };
    use crate::request_store::{InMemoryRequestStore, NewRequest, RequestStatus};

    struct Harness {
        store: Arc<InMemoryRequestStore>,
        grants: Arc<InMemoryGrantStore>,
        api: Arc<ScriptedGrantApi>,
        queue: InMemoryWorkQueue,
        handler: WorkerHandler,
    }

    fn harness(max_receive_count: u32) -> Harness {
        harness_with_api(max_receive_count, ScriptedGrantApi::new())
    }

    fn harness_with_api(max_receive_count: u32, api: ScriptedGrantApi) -> Harness {
        let store = InMemoryRequestStore::arc();
        let grants = InMemoryGrantStore::arc();
        let api = Arc::new(api);
        let executor = GrantExecutor::new(api.clone(), grants.clone());
        let config = WorkerConfig {
            max_receive_count,
            retry_policy: RetryPolicy {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(60),
                strategy: BackoffStrategy::Exponential,
                jitter: 0.0,
            },
            ..WorkerConfig::default()
        };
        Harness {
            store: store.clone(),
            grants,
            api,
            queue: InMemoryWorkQueue::new(QueueConfig {
                max_receive_count,
                ..QueueConfig::default()
            }),
            handler: WorkerHandler::new(store, executor, config, TtlPolicy::default()),
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from_hashed("owner")
    }

    async fn accept(h: &Harness, payload: serde_json::Value) -> RequestId {
        let id = RequestId::generate();
        h.store
            .create(NewRequest {
                request_id: id.clone(),
                owner_id: owner(),
                payload: payload.clone(),
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();
        h.queue
            .send(QueueMessage::new(owner(), id.clone(), payload))
            .await
            .unwrap();
        id
    }

    async fn receive_one(h: &Harness) -> Delivery {
        h.queue.receive(1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn successful_grant_completes_with_audit_ttl() {
        let h = harness(5);
        let id = accept(&h, json!({"op": "grant", "registrationNumber": "AB12CDE"})).await;

        let delivery = receive_one(&h).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(disposition, Disposition::Done);

        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        assert_eq!(record.result.unwrap().status_code, 201);
        assert!(record.expires_at - record.created_at > chrono::Duration::days(365));
    }

    #[tokio::test]
    async fn duplicate_delivery_after_completion_has_no_side_effect() {
        let h = harness(5);
        accept(&h, json!({"op": "grant", "registrationNumber": "AB12CDE"})).await;
        let delivery = receive_one(&h).await;

        h.handler.handle(&delivery).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(disposition, Disposition::Done);
        assert_eq!(h.api.grant_calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_defers_without_terminal_write() {
        let h = harness(5);
        let id = accept(&h, json!({"op": "lookup", "registrationNumber": "AB12CDE"})).await;
        h.api
            .push_failure(DownstreamError::from_status(503, Some(Duration::from_secs(2)), "down"));

        let delivery = receive_one(&h).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;

        assert_eq!(outcome, Outcome::Deferred);
        assert_eq!(
            disposition,
            Disposition::Retry {
                delay: Duration::from_secs(2)
            }
        );
        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_failure_is_recorded_and_acked() {
        let h = harness(5);
        let id = accept(&h, json!({"op": "grant", "registrationNumber": "AB12CDE"})).await;
        h.api
            .push_failure(DownstreamError::from_status(422, None, "unknown vehicle"));

        let delivery = receive_one(&h).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;
        assert_eq!((outcome, disposition), (Outcome::Failed, Disposition::Done));

        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.code, ErrorCode::DownstreamRejected);
        assert!(error.user_message.is_some());
        assert!(error.action_advice.is_some());
    }

    #[tokio::test]
    async fn final_receive_writes_failed_and_still_retries() {
        let h = harness(1);
        let id = accept(&h, json!({"op": "lookup", "registrationNumber": "AB12CDE"})).await;
        h.api.push_failure(DownstreamError::transient("timeout", None));

        let delivery = receive_one(&h).await;
        assert_eq!(delivery.receive_count, 1);
        let (outcome, disposition) = h.handler.handle(&delivery).await;

        assert_eq!(outcome, Outcome::Failed);
        assert!(matches!(disposition, Disposition::Retry { .. }));
        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.error.unwrap().code, ErrorCode::DownstreamUnavailable);
    }

    #[tokio::test]
    async fn undecodable_payload_fails_as_invalid_payload() {
        let h = harness(5);
        let id = accept(&h, json!({"op": "teleport"})).await;

        let delivery = receive_one(&h).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;
        assert_eq!((outcome, disposition), (Outcome::Failed, Disposition::Done));

        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.error.unwrap().code, ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn message_without_record_is_dropped() {
        let h = harness(5);
        let id = RequestId::generate();
        h.queue
            .send(QueueMessage::new(owner(), id, json!({"op": "lookup", "registrationNumber": "AB12CDE"})))
            .await
            .unwrap();

        let delivery = receive_one(&h).await;
        let report = h.handler.handle_batch(&[delivery]).await;
        assert_eq!(report.count(Outcome::Skipped), 1);
        assert_eq!(report.retries(), 0);
        assert_eq!(h.api.status_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_one_request_converge() {
        let h = harness_with_api(
            5,
            ScriptedGrantApi::new().with_latency(Duration::from_millis(20)),
        );
        let payload = json!({"op": "grant", "registrationNumber": "AB12CDE"});
        let id = accept(&h, payload.clone()).await;
        // A re-enqueue raced the original message.
        h.queue
            .send(QueueMessage::new(owner(), id.clone(), payload))
            .await
            .unwrap();

        let deliveries = h.queue.receive(2).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        let (a, b) = tokio::join!(
            h.handler.handle(&deliveries[0]),
            h.handler.handle(&deliveries[1]),
        );
        assert_eq!(a, (Outcome::Completed, Disposition::Done));
        assert_eq!(b, (Outcome::Completed, Disposition::Done));

        // Both reached the downstream, which deduplicated on the shared key.
        assert_eq!(h.api.grant_calls(), 2);
        assert_eq!(h.api.grants_issued(), 1);

        let record = h.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);
        let result = record.result.unwrap();
        assert_eq!(result.status_code, 201);

        let receipts = h.grants.list(&owner()).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(result.body["receiptId"], receipts[0].receipt_id.as_str());
    }

    #[tokio::test]
    async fn grant_store_fault_is_retried_then_failed_as_internal() {
        let h = harness(5);
        accept(&h, json!({"op": "grant", "registrationNumber": "AB12CDE"})).await;
        h.grants.poison();

        let delivery = receive_one(&h).await;
        let (outcome, disposition) = h.handler.handle(&delivery).await;
        assert_eq!(outcome, Outcome::Deferred);
        assert!(matches!(disposition, Disposition::Retry { .. }));
        assert_eq!(h.api.grant_calls(), 0);

        let last = harness(1);
        let id = accept(&last, json!({"op": "grant", "registrationNumber": "AB12CDE"})).await;
        last.grants.poison();

        let delivery = receive_one(&last).await;
        let (outcome, disposition) = last.handler.handle(&delivery).await;
        assert_eq!(outcome, Outcome::Failed);
        assert!(matches!(disposition, Disposition::Retry { .. }));
        let record = last.store.get(&id, &owner()).await.unwrap().unwrap();
        assert_eq!(record.error.unwrap().code, ErrorCode::InternalError);
    }
}
