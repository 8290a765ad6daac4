//! Playback access and origin serving.
//!
//! `playback` hands a player descriptors for the master playlist, every rendition playlist
//! and the first segments of each rendition. Everything after that is fetched through the
//! origin, which serves playlists with each URI replaced by a freshly signed descriptor for
//! the same principal, so expiring segment URLs are renewed without the client noticing.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use mise_core::models::{ObjectKind, StorageObject};
use mise_core::AppError;
use mise_db::VideoStore;
use mise_processing::playlist;
use mise_storage::{ByteStream, ObjectStoreAdapter};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::access::{AccessDescriptor, AccessGrant, AuthorizationDecision, SignedUrlIssuer};
use crate::error::storage_app_error;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RenditionAccess {
    pub label: String,
    pub width: i32,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub duration_ms: i64,
    pub playlist: AccessDescriptor,
    /// The first segments, so playback can start before the playlist is fetched.
    pub segments: Vec<AccessDescriptor>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PlaybackAccess {
    pub video_id: Uuid,
    pub manifest: AccessDescriptor,
    pub renditions: Vec<RenditionAccess>,
}

pub enum OriginBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for OriginBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginBody::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            OriginBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An object ready to be sent by the origin.
#[derive(Debug)]
pub struct OriginObject {
    pub key: String,
    pub content_type: String,
    pub cache_control: String,
    pub size: u64,
    pub body: OriginBody,
}

pub struct PlaybackService {
    videos: Arc<dyn VideoStore>,
    storage: Arc<ObjectStoreAdapter>,
    issuer: Arc<SignedUrlIssuer>,
    segment_window: usize,
}

impl PlaybackService {
    pub fn new(
        videos: Arc<dyn VideoStore>,
        storage: Arc<ObjectStoreAdapter>,
        issuer: Arc<SignedUrlIssuer>,
        segment_window: usize,
    ) -> Self {
        Self {
            videos,
            storage,
            issuer,
            segment_window,
        }
    }

    pub fn issuer(&self) -> &SignedUrlIssuer {
        &self.issuer
    }

    /// Video a rendition key belongs to: `renditions/{video_id}/...`.
    pub fn video_for_key(key: &str) -> Option<Uuid> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next()) {
            (Some("renditions"), Some(id)) => id.parse().ok(),
            _ => None,
        }
    }

    /// Descriptors for a ready video. A refused decision is rejected before the video is
    /// looked up, so the answer never depends on whether it exists.
    #[tracing::instrument(skip(self, decision, client_ip, now), fields(video.id = %video_id))]
    pub async fn playback(
        &self,
        video_id: Uuid,
        principal: &str,
        decision: &AuthorizationDecision,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<PlaybackAccess, AppError> {
        if !decision.allowed || decision.principal != principal {
            return Err(AppError::Denied(format!("Playback of {} denied", video_id)));
        }
        let not_ready = || AppError::NotFound(format!("Video {} not found", video_id));

        let video = self.videos.get_video(video_id).await?.ok_or_else(not_ready)?;
        let (Some(set_id), Some(manifest_key)) =
            (video.current_rendition_set, video.manifest_key.as_deref())
        else {
            return Err(not_ready());
        };

        let issue = |object: &StorageObject| {
            self.issuer.issue(object, principal, decision, client_ip, now)
        };
        let manifest = issue(&self.resolve(manifest_key).await?)?;

        let renditions = self.videos.renditions(set_id).await?;
        let mut access = Vec::with_capacity(renditions.len());
        for rendition in renditions {
            let playlist = issue(&self.resolve(&rendition.manifest_key).await?)?;
            let mut segments = Vec::with_capacity(self.segment_window);
            for key in rendition.segment_keys.iter().take(self.segment_window) {
                segments.push(issue(&self.resolve(key).await?)?);
            }
            access.push(RenditionAccess {
                label: rendition.label,
                width: rendition.width,
                height: rendition.height,
                bitrate_kbps: rendition.bitrate_kbps,
                duration_ms: rendition.duration_ms,
                playlist,
                segments,
            });
        }

        tracing::info!(
            renditions = access.len(),
            expires_at = %manifest.expires_at,
            "Playback access issued"
        );
        Ok(PlaybackAccess {
            video_id,
            manifest,
            renditions: access,
        })
    }

    async fn resolve(&self, key: &str) -> Result<StorageObject, AppError> {
        self.storage.resolve(key).await.map_err(storage_app_error)
    }

    /// Serve the object of a verified grant from its current authoritative backend, which
    /// may differ from the backend the descriptor was issued for.
    ///
    /// Playlists are rewritten with descriptors for `grant.principal`. They are bounded by
    /// `fresh` when the caller re-checked authorization, otherwise by the grant's own expiry.
    #[tracing::instrument(skip(self, grant, fresh, client_ip, now), fields(key = %grant.key))]
    pub async fn serve(
        &self,
        grant: &AccessGrant,
        fresh: Option<&AuthorizationDecision>,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<OriginObject, AppError> {
        let kind = ObjectKind::from_key(&grant.key);
        if kind == ObjectKind::Master {
            return Err(AppError::Denied(format!("Access to {} denied", grant.key)));
        }
        let entry = self.resolve(&grant.key).await?;
        let cache_control = self.issuer.cache_policy().policy_for(kind).cache_control();

        if !kind.is_manifest() {
            let body = self
                .storage
                .get_stream(&grant.key)
                .await
                .map_err(storage_app_error)?;
            return Ok(OriginObject {
                key: entry.key,
                content_type: entry.content_type,
                cache_control,
                size: entry.size as u64,
                body: OriginBody::Stream(body),
            });
        }

        let fallback;
        let decision = match fresh {
            Some(decision) => decision,
            None => {
                fallback = AuthorizationDecision::allow(grant.principal.clone()).until(grant.expires_at);
                &fallback
            }
        };
        let text = self.storage.get(&grant.key).await.map_err(storage_app_error)?;
        let text = std::str::from_utf8(&text)
            .map_err(|_| AppError::Internal(format!("Playlist {} is not UTF-8", grant.key)))?;

        let mut signed = HashMap::new();
        for uri in playlist::uris(text) {
            if uri.contains("://") || signed.contains_key(&uri) {
                continue;
            }
            let target = self
                .storage
                .lookup(&playlist::resolve_key(&grant.key, &uri))
                .await
                .map_err(storage_app_error)?
                .ok_or_else(|| {
                    AppError::Internal(format!("Playlist {} references missing {}", grant.key, uri))
                })?;
            let descriptor = self
                .issuer
                .issue(&target, &grant.principal, decision, client_ip, now)?;
            signed.insert(uri, descriptor.url);
        }

        let rewritten =
            playlist::rewrite_uris(text, |uri| signed.get(uri).cloned().unwrap_or_else(|| uri.to_string()));
        let body = Bytes::from(rewritten);
        Ok(OriginObject {
            key: entry.key,
            content_type: kind.content_type().to_string(),
            cache_control,
            size: body.len() as u64,
            body: OriginBody::Bytes(body),
        })
    }
}
