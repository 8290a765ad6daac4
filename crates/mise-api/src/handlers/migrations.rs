//! Backend-to-backend storage migrations.
//!
//! Migrations run in the background; the returned record id is the handle for polling and
//! resuming.

use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use mise_core::models::{BackendId, MigrationRecord};
use mise_core::AppError;
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateMigrationRequest {
    #[validate(length(min = 1, max = 64))]
    pub source: String,
    #[validate(length(min = 1, max = 64))]
    pub dest: String,
    /// Only keys under this prefix are moved; empty moves everything.
    #[serde(default)]
    #[validate(length(max = 1024))]
    pub prefix: String,
}

fn backend_id(value: &str) -> Result<BackendId, AppError> {
    value
        .parse()
        .map_err(|e| AppError::InvalidInput(format!("Invalid backend id '{}': {}", value, e)))
}

#[utoipa::path(
    post,
    path = "/api/v1/migrations",
    tag = "migrations",
    request_body = CreateMigrationRequest,
    responses(
        (status = 202, description = "Migration started", body = MigrationRecord),
        (status = 400, description = "Unknown or identical backends", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, request), fields(source = %request.source, dest = %request.dest))]
pub async fn create_migration(
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<CreateMigrationRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let source = backend_id(&request.source)?;
    let dest = backend_id(&request.dest)?;
    let record = state
        .migrations
        .start(&source, &dest, &request.prefix)
        .await?;
    tracing::info!(migration.id = %record.id, prefix = %record.prefix, "Migration started");
    Ok((StatusCode::ACCEPTED, Json(record)))
}

#[utoipa::path(
    get,
    path = "/api/v1/migrations/{id}",
    tag = "migrations",
    params(("id" = Uuid, Path, description = "Migration ID")),
    responses(
        (status = 200, description = "Migration progress", body = MigrationRecord),
        (status = 404, description = "Migration not found", body = ErrorResponse)
    )
)]
pub async fn get_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MigrationRecord>, HttpAppError> {
    Ok(Json(state.migrations.get(id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/migrations/{id}/resume",
    tag = "migrations",
    params(("id" = Uuid, Path, description = "Migration ID")),
    responses(
        (status = 202, description = "Migration resumed from its cursor, or restarted to retry failures", body = MigrationRecord),
        (status = 404, description = "Migration not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state), fields(migration.id = %id))]
pub async fn resume_migration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = state.migrations.resume_in_background(id).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}
