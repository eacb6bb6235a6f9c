//! Request State Store: one record per logical operation.
//!
//! ## Design
//!
//! - Records are keyed by `(request_id, owner_id)`
//! - Status moves monotonically: PENDING → PROCESSING → COMPLETED | FAILED
//! - Terminal records are immutable; refused writes are reported, not applied
//! - Expiry is an absolute `expires_at`; expired rows read as absent
//!
//! ## Components
//!
//! - `RequestStore`: conditional-write store abstraction
//! - `InMemoryRequestStore`: tests/dev
//! - `PostgresRequestStore`: durable, SQLx-backed

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresRequestStore;
pub use store::{InMemoryRequestStore, RequestStore, RequestStoreError};
pub use types::{
    CreateOutcome, ErrorCode, NewRequest, RequestError, RequestRecord, RequestResult,
    RequestStatus, Transition, TransitionOutcome,
};
