//! In-memory stand-in for the grant API.
//!
//! Behaves like a well-mannered idempotent REST API, and can be told to fail
//! the next N calls, optionally with added latency. Used by the dev binary
//! when no downstream is configured, and by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use handoff_core::RegistrationNumber;

use super::api::{GrantApi, GrantConfirmation, GrantRequest, GrantStatus, RevokeRequest};
use super::error::DownstreamError;

#[derive(Debug, Default)]
struct State {
    grants: HashMap<RegistrationNumber, GrantConfirmation>,
    by_key: HashMap<String, GrantConfirmation>,
    failures: VecDeque<DownstreamError>,
}

#[derive(Debug, Default)]
pub struct ScriptedGrantApi {
    state: Mutex<State>,
    latency: Option<Duration>,
    grant_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
    status_calls: AtomicUsize,
    issued: AtomicUsize,
}

impl ScriptedGrantApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Sleep this long before answering every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call (of any kind) with `error`. Queued failures are
    /// consumed in order.
    pub fn push_failure(&self, error: DownstreamError) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back(error);
        }
    }

    pub fn fail_next(&self, times: usize, error: DownstreamError) {
        for _ in 0..times {
            self.push_failure(error.clone());
        }
    }

    pub fn grant_calls(&self) -> usize {
        self.grant_calls.load(Ordering::SeqCst)
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Grants actually issued (idempotent replays excluded).
    pub fn grants_issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn is_granted(&self, registration_number: &RegistrationNumber) -> bool {
        self.state
            .lock()
            .map(|s| s.grants.contains_key(registration_number))
            .unwrap_or(false)
    }

    async fn before_call(&self) -> Result<(), DownstreamError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock()?;
        match state.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, DownstreamError> {
        self.state
            .lock()
            .map_err(|_| DownstreamError::unavailable("scripted api lock poisoned"))
    }
}

#[async_trait]
impl GrantApi for ScriptedGrantApi {
    async fn grant(&self, request: &GrantRequest) -> Result<GrantConfirmation, DownstreamError> {
        self.grant_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let mut state = self.lock()?;
        if let Some(existing) = state.by_key.get(&request.idempotency_key) {
            return Ok(existing.clone());
        }

        let confirmation = GrantConfirmation {
            receipt_id: format!("rcpt-{}", uuid::Uuid::new_v4().simple()),
            granted_at: Utc::now(),
        };
        state
            .grants
            .insert(request.registration_number.clone(), confirmation.clone());
        state
            .by_key
            .insert(request.idempotency_key.clone(), confirmation.clone());
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(confirmation)
    }

    async fn revoke(&self, request: &RevokeRequest) -> Result<(), DownstreamError> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let mut state = self.lock()?;
        state.grants.remove(&request.registration_number);
        Ok(())
    }

    async fn status(
        &self,
        registration_number: &RegistrationNumber,
    ) -> Result<GrantStatus, DownstreamError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let state = self.lock()?;
        Ok(GrantStatus {
            granted: state.grants.contains_key(registration_number),
        })
    }
}
