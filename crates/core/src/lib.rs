//! `handoff-core`: shared primitives for the request hand-off layer.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns):
//! strongly-typed identifiers, validated domain values and the domain error model.

pub mod error;
pub mod id;
pub mod registration;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{MessageId, OwnerId, RequestId};
pub use registration::RegistrationNumber;
pub use value_object::ValueObject;
