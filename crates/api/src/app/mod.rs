//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (request store, queue, downstream API, worker)
//! - `routes/`: HTTP routes + handlers
//! - `headers.rs`: `x-request-id` / `x-wait-time-ms` / `x-initial-request` parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use handoff_auth::TokenVerifier;

use crate::middleware;

pub mod errors;
pub mod headers;
pub mod routes;
pub mod services;

pub use services::AppServices;

/// Build the full HTTP router over already-wired services.
///
/// The worker runtime is not started here; callers spawn it from
/// [`AppServices::worker`].
pub fn build_app(services: Arc<AppServices>, verifier: Arc<dyn TokenVerifier>) -> Router {
    let auth_state = middleware::AuthState { verifier };

    // Outermost first: request id resolution runs before auth so 401s echo it.
    let protected = routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::request_id_middleware))
            .layer(axum::middleware::from_fn_with_state(
                auth_state,
                middleware::auth_middleware,
            ))
            .layer(Extension(services)),
    );

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
}
