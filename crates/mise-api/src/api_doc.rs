//! OpenAPI documentation, served at `/api-docs/openapi.json` and browsable at `/docs`.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use mise_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Mise Video API",
        version = "0.1.0",
        description = "Recipe video intake, adaptive-bitrate transcoding, signed playback access and storage migration. Application endpoints are versioned under /api/v1/; the signed origin lives under /origin/."
    ),
    paths(
        // Videos
        handlers::videos::upload_video,
        handlers::videos::get_video,
        handlers::videos::retranscode_video,
        // Playback
        handlers::videos::playback,
        handlers::origin::serve_object,
        // Jobs
        handlers::jobs::get_job,
        handlers::jobs::cancel_job,
        // Migrations
        handlers::migrations::create_migration,
        handlers::migrations::get_migration,
        handlers::migrations::resume_migration,
        // Health
        handlers::health::health_check,
    ),
    components(schemas(
        error::ErrorResponse,
        models::RecipeVideo,
        models::VideoState,
        models::TranscodeJob,
        models::JobState,
        models::JobProgress,
        models::BitrateLadder,
        models::BitrateRung,
        models::MigrationRecord,
        models::MigrationState,
        models::BackendId,
        mise_core::JobErrorKind,
        mise_services::PlaybackAccess,
        mise_services::RenditionAccess,
        mise_services::AccessDescriptor,
        handlers::videos::VideoStatusResponse,
        handlers::videos::RetranscodeRequest,
        handlers::migrations::CreateMigrationRequest,
        handlers::health::HealthCheckResponse,
    )),
    tags(
        (name = "videos", description = "Master upload and transcode status"),
        (name = "playback", description = "Signed playback access and the signed origin"),
        (name = "origin", description = "Signed object delivery"),
        (name = "jobs", description = "Transcode jobs"),
        (name = "migrations", description = "Backend-to-backend storage migration"),
        (name = "health", description = "Health checks")
    )
)]
pub struct ApiDoc;
