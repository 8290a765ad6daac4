//! Route configuration and setup

use crate::api_doc::ApiDoc;
use crate::handlers;
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

const API_PREFIX: &str = "/api/v1";
/// Server-level cap on in-flight requests.
const HTTP_CONCURRENCY_LIMIT: usize = 10_000;

/// Setup all application routes
pub fn setup_routes(state: Arc<AppState>) -> Router<()> {
    let api = Router::new()
        .route("/videos", post(handlers::videos::upload_video))
        .route("/videos/{id}", get(handlers::videos::get_video))
        .route(
            "/videos/{id}/retranscode",
            post(handlers::videos::retranscode_video),
        )
        .route("/videos/{id}/playback", post(handlers::videos::playback))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel_job))
        .route("/migrations", post(handlers::migrations::create_migration))
        .route("/migrations/{id}", get(handlers::migrations::get_migration))
        .route(
            "/migrations/{id}/resume",
            post(handlers::migrations::resume_migration),
        );

    // Uploads are streamed and capped by the request limit layer, not the extractor default.
    let max_body = usize::try_from(state.config.max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .nest(API_PREFIX, api)
        .route("/origin/{*key}", get(handlers::origin::serve_object))
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(utoipa_rapidoc::RapiDoc::new("/api-docs/openapi.json").path("/docs"))
        .layer(ConcurrencyLimitLayer::new(HTTP_CONCURRENCY_LIMIT))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(setup_cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Players fetch the origin cross-origin; everything else is called server to server.
fn setup_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}
