//! Route registration.

pub mod submissions;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::server::AppState;

/// Builds the submission routes.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/submissions",
            get(submissions::list).post(submissions::create),
        )
        .route(
            "/submissions/{id}",
            get(submissions::get).delete(submissions::delete),
        )
}
