//! Cache policy: TTL class per object kind.
//!
//! The policy never looks at object content, only at [`ObjectKind`], so evaluation is
//! deterministic and free of side effects.

use serde::Serialize;
use std::time::Duration;
use utoipa::ToSchema;

use crate::models::ObjectKind;

pub const DEFAULT_MANIFEST_TTL_SECS: u64 = 300;
pub const DEFAULT_SEGMENT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Cacheability {
    Public,
    Private,
    /// Never stored by shared or browser caches.
    NoStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub cacheability: Cacheability,
    pub immutable: bool,
}

impl CachePolicy {
    /// Value for the `Cache-Control` response header.
    pub fn cache_control(&self) -> String {
        match self.cacheability {
            Cacheability::NoStore => "private, no-store".to_string(),
            Cacheability::Private => format!("private, max-age={}", self.ttl.as_secs()),
            Cacheability::Public if self.immutable => {
                format!("public, max-age={}, immutable", self.ttl.as_secs())
            }
            Cacheability::Public => format!("public, max-age={}", self.ttl.as_secs()),
        }
    }
}

/// Maps object kinds to cache metadata using configured TTLs.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicyEngine {
    manifest_ttl: Duration,
    segment_ttl: Duration,
}

impl Default for CachePolicyEngine {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_MANIFEST_TTL_SECS),
            Duration::from_secs(DEFAULT_SEGMENT_TTL_SECS),
        )
    }
}

impl CachePolicyEngine {
    pub fn new(manifest_ttl: Duration, segment_ttl: Duration) -> Self {
        Self {
            manifest_ttl,
            segment_ttl,
        }
    }

    /// Manifests are served with per-principal signed URIs inside, so they are private.
    pub fn policy_for(&self, kind: ObjectKind) -> CachePolicy {
        match kind {
            ObjectKind::MasterPlaylist | ObjectKind::MediaPlaylist => CachePolicy {
                ttl: self.manifest_ttl,
                cacheability: Cacheability::Private,
                immutable: false,
            },
            ObjectKind::Segment => CachePolicy {
                ttl: self.segment_ttl,
                cacheability: Cacheability::Public,
                immutable: true,
            },
            ObjectKind::Master => CachePolicy {
                ttl: Duration::ZERO,
                cacheability: Cacheability::NoStore,
                immutable: false,
            },
        }
    }

    pub fn policy_for_key(&self, key: &str) -> CachePolicy {
        self.policy_for(ObjectKind::from_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifests_get_short_private_ttl() {
        let engine = CachePolicyEngine::default();
        for kind in [ObjectKind::MasterPlaylist, ObjectKind::MediaPlaylist] {
            let policy = engine.policy_for(kind);
            assert_eq!(policy.ttl, Duration::from_secs(300));
            assert_eq!(policy.cacheability, Cacheability::Private);
            assert_eq!(policy.cache_control(), "private, max-age=300");
        }
    }

    #[test]
    fn segments_get_long_public_immutable_ttl() {
        let policy = CachePolicyEngine::default().policy_for(ObjectKind::Segment);
        assert_eq!(policy.ttl, Duration::from_secs(86_400));
        assert_eq!(policy.cache_control(), "public, max-age=86400, immutable");
    }

    #[test]
    fn masters_are_never_cached() {
        let policy = CachePolicyEngine::default().policy_for(ObjectKind::Master);
        assert_eq!(policy.cache_control(), "private, no-store");
    }

    #[test]
    fn policy_depends_only_on_kind() {
        let engine = CachePolicyEngine::new(Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(
            engine.policy_for_key("renditions/a/b/1/720p/segment_00001.ts"),
            engine.policy_for_key("something/else/segment_99999.ts"),
        );
        assert_eq!(
            engine.policy_for_key("x/720p/index.m3u8").ttl,
            Duration::from_secs(60)
        );
    }
}
