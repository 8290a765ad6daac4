//! Health check handlers and response types.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_KEY: &str = "health-check-non-existent-key";

/// Run an async check with timeout; returns "healthy", "timeout", or "{prefix}: {error}".
async fn run_check<F, E>(f: F, error_prefix: &str) -> String
where
    F: Future<Output = Result<(), E>>,
    E: Display,
{
    match tokio::time::timeout(CHECK_TIMEOUT, f).await {
        Ok(Ok(())) => "healthy".to_string(),
        Ok(Err(e)) => format!("{}: {}", error_prefix, e),
        Err(_) => "timeout".to_string(),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthCheckResponse {
    pub status: String,
    /// "memory" when running without Postgres.
    pub database: String,
    /// Per-backend probe result.
    pub storage: BTreeMap<String, String>,
    pub transcodes_in_flight: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "All dependencies reachable", body = HealthCheckResponse),
        (status = 503, description = "A dependency is unreachable", body = HealthCheckResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match &state.db {
        Some(pool) => {
            run_check(
                async { sqlx::query("SELECT 1").execute(pool).await.map(|_| ()) },
                "unhealthy",
            )
            .await
        }
        None => "memory".to_string(),
    };

    let mut storage = BTreeMap::new();
    for id in state.storage.backend_ids() {
        let status = match state.storage.backend(&id) {
            Ok(backend) => {
                // Reaching the backend is what counts; the probe key never exists.
                run_check(
                    async {
                        match backend.head(PROBE_KEY).await {
                            Ok(_) => Ok(()),
                            Err(e) if e.is_not_found() => Ok(()),
                            Err(e) => Err(e),
                        }
                    },
                    "unhealthy",
                )
                .await
            }
            Err(e) => format!("unhealthy: {}", e),
        };
        storage.insert(id.to_string(), status);
    }

    let healthy = matches!(database.as_str(), "healthy" | "memory")
        && storage.values().all(|s| s == "healthy");
    if !healthy {
        tracing::warn!(database = %database, storage = ?storage, "Health check failed");
    }

    let response = HealthCheckResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
        storage,
        transcodes_in_flight: state.workers.in_flight(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
