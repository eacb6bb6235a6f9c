use axum::{routing::get, Router};

pub mod grants;
pub mod system;

/// Router for all authenticated (owner-scoped) endpoints.
pub fn router() -> Router {
    Router::new().route(
        "/grants",
        get(grants::lookup_grant)
            .post(grants::create_grant)
            .delete(grants::revoke_grant),
    )
}
