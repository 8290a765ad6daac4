//! Authorization collaborator.
//!
//! The pipeline never decides who may watch a video. It asks an external service and signs
//! whatever that service allows, bounded by the decision's `valid_until`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mise_core::AppError;
use mise_services::AuthorizationDecision;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const AUTHORIZER_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decide whether `principal` may watch `video_id`. Failing to reach a decision is an
    /// error, never an implicit allow.
    async fn authorize(&self, principal: &str, video_id: Uuid) -> Result<AuthorizationDecision, AppError>;
}

/// Development authorizer that allows everyone.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, principal: &str, _video_id: Uuid) -> Result<AuthorizationDecision, AppError> {
        Ok(AuthorizationDecision::allow(principal))
    }
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    principal: &'a str,
    video_id: Uuid,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    allowed: bool,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

/// Calls `POST {url}` with `{principal, video_id}` and expects `{allowed, valid_until?}`.
pub struct HttpAuthorizer {
    client: reqwest::Client,
    url: String,
}

impl HttpAuthorizer {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(AUTHORIZER_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// 5xx is retriable; any other non-success status means the request itself was refused.
fn status_error(status: reqwest::StatusCode) -> Option<AppError> {
    if status.is_success() {
        None
    } else if status.is_server_error() {
        Some(AppError::Transient(format!("Authorizer returned {}", status)))
    } else {
        Some(AppError::Permanent(format!("Authorizer rejected the request: {}", status)))
    }
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    #[tracing::instrument(skip(self, principal), fields(video.id = %video_id))]
    async fn authorize(&self, principal: &str, video_id: Uuid) -> Result<AuthorizationDecision, AppError> {
        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.url)
            .json(&AuthorizeRequest { principal, video_id })
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("Authorizer unreachable: {}", e)))?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }
        let answer: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("Malformed authorizer response: {}", e)))?;

        tracing::debug!(
            allowed = answer.allowed,
            valid_until = ?answer.valid_until,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Authorization decided"
        );
        let decision = if answer.allowed {
            AuthorizationDecision::allow(principal)
        } else {
            AuthorizationDecision::deny(principal)
        };
        Ok(match answer.valid_until {
            Some(until) => decision.until(until),
            None => decision,
        })
    }
}
