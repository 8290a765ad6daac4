//! Signed origin.
//!
//! Serves rendition objects to anyone holding a valid descriptor URL. Every rejection,
//! whether a bad signature, an expired URL or a missing object, is the same 404.

use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use crate::utils::client_ip::ClientIp;
use axum::{
    body::Body,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
};
use chrono::Utc;
use futures::TryStreamExt;
use mise_core::models::ObjectKind;
use mise_core::AppError;
use mise_services::{OriginBody, PlaybackService, SignedParams};
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/origin/{key}",
    tag = "origin",
    params(
        ("key" = String, Path, description = "Object key, e.g. renditions/{video}/{job}/a1/720p/segment_00000.ts"),
        ("b" = String, Query, description = "Backend the descriptor was issued for"),
        ("exp" = i64, Query, description = "Expiry, unix seconds"),
        ("iat" = i64, Query, description = "Issue time, unix seconds"),
        ("p" = String, Query, description = "Principal"),
        ("ip" = Option<String>, Query, description = "Bound client IP"),
        ("sig" = String, Query, description = "HMAC-SHA256 signature, hex")
    ),
    responses(
        (status = 200, description = "Playlist (rewritten with fresh descriptors) or segment bytes"),
        (status = 404, description = "Invalid, expired or unknown", body = ErrorResponse),
        (status = 503, description = "Storage or authorization temporarily unavailable", body = ErrorResponse)
    )
)]
#[tracing::instrument(skip(state, params, client_ip), fields(key = %key))]
pub async fn serve_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    ClientIp(client_ip): ClientIp,
    params: Result<Query<SignedParams>, QueryRejection>,
) -> Result<Response, HttpAppError> {
    let Query(params) =
        params.map_err(|e| AppError::Denied(format!("Malformed signed URL: {}", e.body_text())))?;
    let now = Utc::now();
    let grant = state.issuer.verify(&key, &params, client_ip, now)?;

    // Playlists mint new descriptors, so the viewer's access is checked again before they
    // are rewritten. Segments are served on the signature alone.
    let fresh = match PlaybackService::video_for_key(&grant.key) {
        Some(video_id) if ObjectKind::from_key(&grant.key).is_manifest() => {
            let decision = state.authorizer.authorize(&grant.principal, video_id).await?;
            if !decision.allowed {
                return Err(AppError::Denied(format!(
                    "Authorization for {} withdrawn",
                    grant.key
                ))
                .into());
            }
            Some(decision)
        }
        _ => None,
    };

    let object = state
        .playback
        .serve(&grant, fresh.as_ref(), client_ip, now)
        .await?;

    let body = match object.body {
        OriginBody::Bytes(bytes) => Body::from(bytes),
        OriginBody::Stream(stream) => Body::from_stream(
            stream.map_err(|e| std::io::Error::other(format!("Storage stream error: {}", e))),
        ),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, object.content_type)
        .header(header::CACHE_CONTROL, object.cache_control)
        .header(header::CONTENT_LENGTH, object.size)
        .body(body)
        .map_err(|e| {
            HttpAppError(AppError::Internal(format!(
                "Failed to build origin response: {}",
                e
            )))
        })
}
