//! `handoff-auth`: bearer credential boundary.
//!
//! This crate is intentionally decoupled from HTTP and storage: it turns a raw
//! bearer token into a verified [`Principal`] whose [`handoff_core::OwnerId`]
//! scopes everything downstream.

pub mod claims;
pub mod principal;
pub mod verifier;

pub use claims::{AccessClaims, TokenError, validate_claims};
pub use principal::{Principal, owner_for_subject};
pub use verifier::{Hs256TokenVerifier, TokenVerifier};
