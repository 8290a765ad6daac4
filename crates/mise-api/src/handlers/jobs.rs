use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use mise_core::models::TranscodeJob;
use mise_core::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    tag = "jobs",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job state, attempts and progress", body = TranscodeJob),
        (status = 404, description = "Job not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state), fields(job.id = %id))]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TranscodeJob>, HttpAppError> {
    Ok(Json(state.ingest.job(id).await?))
}

/// Cancelling a finished job is a no-op that returns it unchanged.
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/cancel",
    tag = "jobs",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Cancellation requested", body = TranscodeJob),
        (status = 404, description = "Job not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state), fields(job.id = %id))]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TranscodeJob>, HttpAppError> {
    let job = state
        .workers
        .cancel(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
    Ok(Json(job))
}
