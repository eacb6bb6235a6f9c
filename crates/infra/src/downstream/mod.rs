//! Client side of the wrapped third-party grant API.

pub mod api;
pub mod error;
pub mod http;
pub mod scripted;

pub use api::{GrantApi, GrantConfirmation, GrantRequest, GrantStatus, RevokeRequest};
pub use error::{DownstreamError, DownstreamErrorKind};
pub use http::HttpGrantApi;
pub use scripted::ScriptedGrantApi;
