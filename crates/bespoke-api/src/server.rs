//! HTTP server over the coordinator.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use bespoke_flow::coordinator::Coordinator;
use bespoke_flow::error::{Error, Result};

use crate::config::ApiConfig;
use crate::openapi::ApiDoc;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Liveness flag.
    pub ok: bool,
    /// Build version of the coordinator.
    pub version: String,
}

/// Shared application state for request handlers.
pub struct AppState {
    /// The coordinator core serving every route.
    pub coordinator: Arc<Coordinator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi_document(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

/// The coordinator HTTP server.
pub struct Server {
    config: ApiConfig,
    coordinator: Arc<Coordinator>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server over a running coordinator.
    #[must_use]
    pub fn new(config: ApiConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Returns the server configuration.
    #[must_use]
    pub const fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn create_router(&self) -> Router {
        let state = Arc::new(AppState {
            coordinator: Arc::clone(&self.coordinator),
        });

        Router::new()
            .route("/health", get(health))
            .route("/openapi.json", get(openapi_document))
            .merge(crate::routes::api_routes())
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::with_status_code(
                axum::http::StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout,
            ))
            .with_state(state)
    }

    /// Serves until the shutdown signal flips.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let router = self.create_router();
        let listener = tokio::net::TcpListener::bind(self.config.bind)
            .await
            .map_err(|e| Error::internal(format!("failed to bind {}: {e}", self.config.bind)))?;

        tracing::info!(bind = %self.config.bind, "coordinator API listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::internal(format!("server error: {e}")))?;
        Ok(())
    }

    /// Builds the router without binding a port.
    ///
    /// Integration tests drive this with `tower::ServiceExt::oneshot`.
    #[doc(hidden)]
    #[must_use]
    pub fn test_router(&self) -> Router {
        self.create_router()
    }
}
