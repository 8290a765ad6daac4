//! Playback descriptors and origin serving of published videos.

mod helpers;

use chrono::Duration as ChronoDuration;
use futures::TryStreamExt;
use helpers::{backend, now, parse_descriptor_url, three_rung_ladder, Harness, SEGMENTS_PER_RUNG};
use mise_core::models::{RecipeVideo, VideoState};
use mise_core::AppError;
use mise_processing::{playlist, EncodeOutcome, ScriptedEngine};
use mise_services::{AuthorizationDecision, OriginBody, OriginObject, PlaybackAccess};
use uuid::Uuid;

const VIEWER: &str = "user:42";

async fn ready_video(harness: &Harness) -> RecipeVideo {
    let video = harness
        .upload(Uuid::new_v4(), 0, Some(three_rung_ladder()))
        .await
        .unwrap();
    harness.wait_for_video(video.id, VideoState::Ready).await
}

async fn access(harness: &Harness, video: &RecipeVideo) -> PlaybackAccess {
    harness
        .playback
        .playback(video.id, VIEWER, &AuthorizationDecision::allow(VIEWER), None, now())
        .await
        .unwrap()
}

/// Fetch a descriptor URL through the origin the way the API route does.
async fn fetch(harness: &Harness, url: &str) -> Result<OriginObject, AppError> {
    let (key, params) = parse_descriptor_url(url);
    let at = now();
    let grant = harness.issuer.verify(&key, &params, None, at)?;
    harness.playback.serve(&grant, None, None, at).await
}

fn text(object: &OriginObject) -> String {
    match &object.body {
        OriginBody::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
        OriginBody::Stream(_) => panic!("playlist served as a stream"),
    }
}

/// Playback returns descriptors for the master playlist, every rendition playlist and the
/// configured window of leading segments, with their cache metadata.
#[tokio::test]
async fn test_playback_issues_descriptors() {
    let harness = Harness::new(ScriptedEngine::new(SEGMENTS_PER_RUNG));
    let video = ready_video(&harness).await;
    let access = access(&harness, &video).await;

    assert_eq!(access.video_id, video.id);
    assert_eq!(Some(access.manifest.key.as_str()), video.manifest_key.as_deref());
    assert_eq!(access.manifest.backend, backend("primary"));
    assert_eq!(access.manifest.cache_control, "private, max-age=300");
    assert_eq!(
        access.manifest.expires_at - access.manifest.issued_at,
        ChronoDuration::seconds(600)
    );

    assert_eq!(access.renditions.len(), 3);
    for rendition in &access.renditions {
        assert!(rendition.playlist.key.ends_with(&format!("{}/index.m3u8", rendition.label)));
        assert_eq!(rendition.segments.len(), 2);
        for segment in &rendition.segments {
            assert!(segment.key.ends_with(".ts"));
            assert!(segment.cache_control.contains("immutable"));
            assert_eq!(
                segment.expires_at - segment.issued_at,
                ChronoDuration::seconds(900)
            );
        }
    }
}

/// Playlists come back from the origin with every URI replaced by a signed URL that the
/// origin itself accepts.
#[tokio::test]
async fn test_origin_rewrites_playlists() {
    let harness = Harness::new(ScriptedEngine::new(SEGMENTS_PER_RUNG));
    let video = ready_video(&harness).await;
    let access = access(&harness, &video).await;

    let master = fetch(&harness, &access.manifest.url).await.unwrap();
    assert_eq!(master.content_type, "application/vnd.apple.mpegurl");
    let master_text = text(&master);
    let variants = playlist::uris(&master_text);
    assert_eq!(variants.len(), 3);
    assert!(variants.iter().all(|u| u.contains("sig=") && u.contains("p=user%3A42")));

    let media = fetch(&harness, &variants[0]).await.unwrap();
    let segments = playlist::uris(&text(&media));
    assert_eq!(segments.len(), SEGMENTS_PER_RUNG);
    assert!(segments.iter().all(|u| u.starts_with(helpers::PUBLIC_URL)));

    let last = fetch(&harness, &segments[SEGMENTS_PER_RUNG - 1]).await.unwrap();
    assert!(last.key.ends_with("segment_00002.ts"));
}

/// Segments are streamed with their stored bytes and immutable cache headers.
#[tokio::test]
async fn test_origin_streams_segments() {
    let harness = Harness::new(ScriptedEngine::new(SEGMENTS_PER_RUNG).with_segment_bytes(4096));
    let video = ready_video(&harness).await;
    let access = access(&harness, &video).await;

    let descriptor = &access.renditions[0].segments[0];
    let object = fetch(&harness, &descriptor.url).await.unwrap();
    assert_eq!(object.size, 4096);
    assert_eq!(object.cache_control, descriptor.cache_control);

    let OriginBody::Stream(stream) = object.body else {
        panic!("segment not streamed");
    };
    let chunks: Vec<_> = stream.try_collect().await.unwrap();
    let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(body.len(), 4096);
    assert_eq!(body, harness.storage.get(&descriptor.key).await.unwrap().to_vec());
}

/// A refused decision and a nonexistent video produce the same error.
#[tokio::test]
async fn test_denied_indistinguishable_from_missing() {
    let harness = Harness::new(ScriptedEngine::new(1));
    let video = ready_video(&harness).await;

    let refused = harness
        .playback
        .playback(video.id, VIEWER, &AuthorizationDecision::deny(VIEWER), None, now())
        .await
        .unwrap_err();
    let unknown = harness
        .playback
        .playback(Uuid::new_v4(), VIEWER, &AuthorizationDecision::deny(VIEWER), None, now())
        .await
        .unwrap_err();
    assert!(matches!(refused, AppError::Denied(_)));
    assert!(matches!(unknown, AppError::Denied(_)));

    // A decision made for someone else does not count.
    let other = harness
        .playback
        .playback(video.id, VIEWER, &AuthorizationDecision::allow("user:7"), None, now())
        .await
        .unwrap_err();
    assert!(matches!(other, AppError::Denied(_)));
}

/// Authorized requests for videos without published renditions are `NotFound`.
#[tokio::test]
async fn test_unpublished_video_not_found() {
    let engine = ScriptedEngine::new(SEGMENTS_PER_RUNG);
    engine.push_outcome(EncodeOutcome::Hang { after_segments: 1 });
    let harness = Harness::new(engine);
    let video = harness.upload(Uuid::new_v4(), 0, None).await.unwrap();

    let err = harness
        .playback
        .playback(video.id, VIEWER, &AuthorizationDecision::allow(VIEWER), None, now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = harness
        .playback
        .playback(Uuid::new_v4(), VIEWER, &AuthorizationDecision::allow(VIEWER), None, now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

/// Rewritten playlists never outlive the authorization they were fetched under.
#[tokio::test]
async fn test_rewritten_urls_bounded_by_authorization() {
    let harness = Harness::new(ScriptedEngine::new(SEGMENTS_PER_RUNG));
    let video = ready_video(&harness).await;
    let at = now();
    let until = at + ChronoDuration::seconds(120);
    let decision = AuthorizationDecision::allow(VIEWER).until(until);

    let access = harness
        .playback
        .playback(video.id, VIEWER, &decision, None, at)
        .await
        .unwrap();
    assert_eq!(access.manifest.expires_at.timestamp(), until.timestamp());

    let (key, params) = parse_descriptor_url(&access.manifest.url);
    let grant = harness.issuer.verify(&key, &params, None, at).unwrap();
    let master = harness.playback.serve(&grant, None, None, at).await.unwrap();
    for url in playlist::uris(&text(&master)) {
        let (_, params) = parse_descriptor_url(&url);
        assert!(params.exp <= until.timestamp());
    }
}

/// Source masters are never served, even with a grant naming them.
#[tokio::test]
async fn test_masters_not_served() {
    let harness = Harness::new(ScriptedEngine::new(1));
    let video = ready_video(&harness).await;
    let at = now();
    let grant = mise_services::AccessGrant {
        principal: VIEWER.to_string(),
        key: video.master_key.clone(),
        backend: backend("primary"),
        issued_at: at,
        expires_at: at + ChronoDuration::seconds(60),
        ip: None,
    };
    let err = harness.playback.serve(&grant, None, None, at).await.unwrap_err();
    assert!(matches!(err, AppError::Denied(_)));
}

/// Descriptors issued before a migration keep working after it: the origin serves from the
/// object's new authoritative backend.
#[tokio::test]
async fn test_descriptors_survive_migration() {
    let harness = Harness::new(ScriptedEngine::new(SEGMENTS_PER_RUNG));
    let video = ready_video(&harness).await;
    let access = access(&harness, &video).await;
    let segment = access.renditions[0].segments[0].clone();
    let expected = harness.storage.get(&segment.key).await.unwrap();

    let record = harness
        .migrations
        .migrate(&backend("primary"), &backend("secondary"), "renditions/")
        .await
        .unwrap();
    assert_eq!(record.failed, 0);
    assert_eq!(
        harness.storage.resolve(&segment.key).await.unwrap().backend,
        backend("secondary")
    );

    let object = fetch(&harness, &segment.url).await.unwrap();
    let OriginBody::Stream(stream) = object.body else {
        panic!("segment not streamed");
    };
    let chunks: Vec<_> = stream.try_collect().await.unwrap();
    let body: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(body, expected.to_vec());

    // Playlists fetched with the old descriptor now point at the new backend.
    let master = fetch(&harness, &access.manifest.url).await.unwrap();
    for url in playlist::uris(&text(&master)) {
        assert!(url.contains("b=secondary"));
    }
}
