//! Submission routes.
//!
//! ## Routes
//!
//! - `POST   /submissions` - Submit one or more workflows
//! - `GET    /submissions/{id}` - Full submission state
//! - `GET    /submissions` - Paged listing with optional status filter
//! - `DELETE /submissions/{id}` - Cooperative cancellation

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use bespoke_core::SubmissionId;
use bespoke_flow::coordinator::{SubmissionDetail, SubmissionPage};
use bespoke_flow::submission::SubmissionStatus;
use bespoke_flow::workflow::BespokeWorkflow;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Default page size for the listing.
const DEFAULT_LIMIT: usize = 100;

/// Maximum accepted page size.
const MAX_LIMIT: usize = 1000;

/// Request body for `POST /submissions`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitRequest {
    /// Workflow documents, one submission each.
    #[schema(value_type = Vec<Object>)]
    pub workflows: Vec<BespokeWorkflow>,
}

/// One accepted submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmissionLink {
    /// Assigned submission id.
    pub id: u64,
    /// URL of the submission resource.
    #[serde(rename = "self")]
    pub self_url: String,
}

/// Response body for `POST /submissions`.
#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    /// Accepted submissions, in request order.
    pub submissions: Vec<SubmissionLink>,
}

/// Query parameters of the listing route.
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListParams {
    /// Status filter (`waiting`, `running`, `success`, `errored`,
    /// `cancelled`).
    pub status: Option<String>,
    /// Cursor from the previous page.
    pub cursor: Option<u64>,
    /// Page size (default 100, maximum 1000).
    pub limit: Option<usize>,
}

/// Accepts workflows and returns the ids assigned to them.
#[utoipa::path(
    post,
    path = "/submissions",
    request_body = SubmitRequest,
    responses(
        (status = 200, description = "Submissions accepted", body = SubmitResponse),
        (status = 400, description = "A workflow failed validation", body = crate::error::ApiErrorBody),
    )
)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    let ids = state.coordinator.submit(request.workflows).await?;
    let submissions = ids
        .into_iter()
        .map(|id| SubmissionLink {
            id: id.as_u64(),
            self_url: format!("/submissions/{id}"),
        })
        .collect();
    Ok(Json(SubmitResponse { submissions }))
}

/// Returns the full state document of one submission.
#[utoipa::path(
    get,
    path = "/submissions/{id}",
    params(("id" = u64, Path, description = "Submission id")),
    responses(
        (status = 200, description = "Submission state"),
        (status = 404, description = "Unknown submission", body = crate::error::ApiErrorBody),
    )
)]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<SubmissionDetail>> {
    let detail = state
        .coordinator
        .get_detail(SubmissionId::from_u64(id))
        .await?;
    Ok(Json(detail))
}

/// Lists submissions with optional status filtering and cursor paging.
#[utoipa::path(
    get,
    path = "/submissions",
    params(ListParams),
    responses(
        (status = 200, description = "One page of submissions"),
        (status = 400, description = "Unparseable filter", body = crate::error::ApiErrorBody),
    )
)]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<SubmissionPage>> {
    let status = params
        .status
        .as_deref()
        .map(SubmissionStatus::from_str)
        .transpose()
        .map_err(|_| {
            ApiError::invalid_filter(format!(
                "unknown status filter: {:?}",
                params.status.unwrap_or_default()
            ))
        })?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let page = state.coordinator.list(status, params.cursor, limit).await?;
    Ok(Json(page))
}

/// Cooperatively cancels a submission. Idempotent: repeating the call on
/// a terminal submission returns the same 204.
#[utoipa::path(
    delete,
    path = "/submissions/{id}",
    params(("id" = u64, Path, description = "Submission id")),
    responses(
        (status = 204, description = "Cancellation acknowledged"),
        (status = 404, description = "Unknown submission", body = crate::error::ApiErrorBody),
    )
)]
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    state
        .coordinator
        .cancel(SubmissionId::from_u64(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
