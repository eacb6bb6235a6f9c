use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use handoff_core::{OwnerId, RegistrationNumber, RequestId};

/// Permanent record of an issued grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantReceipt {
    pub owner_id: OwnerId,
    pub registration_number: RegistrationNumber,
    pub receipt_id: String,
    /// The request that issued the grant.
    pub request_id: RequestId,
    pub purpose: Option<String>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrantStoreError {
    #[error("grant storage error: {0}")]
    Storage(String),
}

/// Owner-scoped domain store for grant receipts.
///
/// Holds the audit copy of every grant and answers the synchronous
/// "does this owner hold a grant" pre-check. A storage fault is always an
/// error, never an empty answer.
pub trait GrantStore: Send + Sync {
    fn find(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError>;

    /// Store `receipt` unless the owner already holds a grant for the same
    /// registration. Returns whichever receipt is stored afterwards.
    fn insert_if_absent(&self, receipt: GrantReceipt) -> Result<GrantReceipt, GrantStoreError>;

    fn remove(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError>;

    fn list(&self, owner_id: &OwnerId) -> Result<Vec<GrantReceipt>, GrantStoreError>;
}

impl<S> GrantStore for Arc<S>
where
    S: GrantStore + ?Sized,
{
    fn find(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError> {
        (**self).find(owner_id, registration_number)
    }

    fn insert_if_absent(&self, receipt: GrantReceipt) -> Result<GrantReceipt, GrantStoreError> {
        (**self).insert_if_absent(receipt)
    }

    fn remove(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError> {
        (**self).remove(owner_id, registration_number)
    }

    fn list(&self, owner_id: &OwnerId) -> Result<Vec<GrantReceipt>, GrantStoreError> {
        (**self).list(owner_id)
    }
}

/// In-memory grant store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    inner: RwLock<HashMap<(OwnerId, RegistrationNumber), GrantReceipt>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Poison the lock, as a panicking writer would (test helper).
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = self.inner.write();
            panic!("writer panicked while holding the grant store lock");
        }));
    }
}

fn poisoned<T>(_: T) -> GrantStoreError {
    GrantStoreError::Storage("grant store lock poisoned".to_string())
}

impl GrantStore for InMemoryGrantStore {
    fn find(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError> {
        let map = self.inner.read().map_err(poisoned)?;
        Ok(map
            .get(&(owner_id.clone(), registration_number.clone()))
            .cloned())
    }

    fn insert_if_absent(&self, receipt: GrantReceipt) -> Result<GrantReceipt, GrantStoreError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        Ok(map
            .entry((receipt.owner_id.clone(), receipt.registration_number.clone()))
            .or_insert(receipt)
            .clone())
    }

    fn remove(
        &self,
        owner_id: &OwnerId,
        registration_number: &RegistrationNumber,
    ) -> Result<Option<GrantReceipt>, GrantStoreError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        Ok(map.remove(&(owner_id.clone(), registration_number.clone())))
    }

    fn list(&self, owner_id: &OwnerId) -> Result<Vec<GrantReceipt>, GrantStoreError> {
        let map = self.inner.read().map_err(poisoned)?;

        let mut receipts: Vec<_> = map
            .iter()
            .filter_map(|((o, _), r)| if o == owner_id { Some(r.clone()) } else { None })
            .collect();
        receipts.sort_by_key(|r| r.granted_at);
        Ok(receipts)
    }
}
