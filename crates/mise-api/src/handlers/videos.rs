//! Video intake, status, re-transcoding and playback access.

use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use crate::utils::client_ip::ClientIp;
use crate::utils::upload::submit_multipart;
use axum::{
    body::Bytes,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use mise_core::models::{BitrateLadder, BitrateRung, RecipeVideo, TranscodeJob};
use mise_core::AppError;
use mise_services::PlaybackAccess;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

/// Header carrying the identity playback is requested for.
pub const PRINCIPAL_HEADER: &str = "x-principal-id";

#[derive(Debug, Serialize, ToSchema)]
pub struct VideoStatusResponse {
    pub video: RecipeVideo,
    /// Most recent transcode job, active or not.
    pub latest_job: Option<TranscodeJob>,
    /// Master playlist key once renditions are published.
    pub manifest_key: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RetranscodeRequest {
    /// Rungs to encode; the configured default ladder when absent.
    #[serde(default)]
    pub ladder: Option<Vec<BitrateRung>>,
}

fn principal(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or_else(|| AppError::InvalidInput(format!("Missing {} header", PRINCIPAL_HEADER)))
}

#[utoipa::path(
    post,
    path = "/api/v1/videos",
    tag = "videos",
    request_body(content = inline(Object), content_type = "multipart/form-data",
        description = "Fields `recipe_id`, `ordinal`, optional `ladder` (JSON array of rungs), then `file`"),
    responses(
        (status = 201, description = "Master stored and transcode queued", body = RecipeVideo),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "A transcode is already running for this slot", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse),
        (status = 503, description = "Storage temporarily unavailable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, multipart), fields(operation = "upload_video"))]
pub async fn upload_video(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse, HttpAppError> {
    let start = std::time::Instant::now();
    let video = submit_multipart(&state.ingest, multipart, state.config.max_upload_bytes).await?;
    tracing::info!(
        video.id = %video.id,
        recipe.id = %video.recipe_id,
        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Master upload accepted"
    );
    Ok((StatusCode::CREATED, Json(video)))
}

#[utoipa::path(
    get,
    path = "/api/v1/videos/{id}",
    tag = "videos",
    params(("id" = Uuid, Path, description = "Video ID")),
    responses(
        (status = 200, description = "Video and its latest job", body = VideoStatusResponse),
        (status = 404, description = "Video not found", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state), fields(video.id = %id))]
pub async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<VideoStatusResponse>, HttpAppError> {
    let status = state.ingest.status(id).await?;
    let manifest_key = status.manifest_key().map(String::from);
    Ok(Json(VideoStatusResponse {
        video: status.video,
        latest_job: status.latest_job,
        manifest_key,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/videos/{id}/retranscode",
    tag = "videos",
    params(("id" = Uuid, Path, description = "Video ID")),
    request_body(content = Option<RetranscodeRequest>, content_type = "application/json"),
    responses(
        (status = 202, description = "Transcode job queued", body = TranscodeJob),
        (status = 400, description = "Invalid ladder", body = ErrorResponse),
        (status = 404, description = "Video not found", body = ErrorResponse),
        (status = 409, description = "A transcode is already running", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, body), fields(video.id = %id))]
pub async fn retranscode_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<impl IntoResponse, HttpAppError> {
    // An empty body means "re-run with the default ladder".
    let request: RetranscodeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RetranscodeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::InvalidInput(format!("Invalid request body: {}", e)))?
    };
    let ladder = request
        .ladder
        .map(BitrateLadder::new)
        .transpose()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let job = state.ingest.retranscode(id, ladder).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[utoipa::path(
    post,
    path = "/api/v1/videos/{id}/playback",
    tag = "playback",
    params(
        ("id" = Uuid, Path, description = "Video ID"),
        ("x-principal-id" = String, Header, description = "Viewer the descriptors are issued for")
    ),
    responses(
        (status = 200, description = "Signed descriptors for the master playlist, renditions and leading segments", body = PlaybackAccess),
        (status = 400, description = "Missing principal", body = ErrorResponse),
        (status = 404, description = "Video not found", body = ErrorResponse),
        (status = 503, description = "Authorization service unavailable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, headers, client_ip), fields(video.id = %id))]
pub async fn playback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ClientIp(client_ip): ClientIp,
    headers: HeaderMap,
) -> Result<Json<PlaybackAccess>, HttpAppError> {
    let principal = principal(&headers)?;
    let decision = state.authorizer.authorize(&principal, id).await?;
    let access = state
        .playback
        .playback(id, &principal, &decision, client_ip, Utc::now())
        .await?;
    Ok(Json(access))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn principal_header_is_required() {
        let mut headers = HeaderMap::new();
        assert!(matches!(principal(&headers), Err(AppError::InvalidInput(_))));

        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("  "));
        assert!(principal(&headers).is_err());

        headers.insert(PRINCIPAL_HEADER, HeaderValue::from_static("user:42"));
        assert_eq!(principal(&headers).unwrap(), "user:42");
    }
}
