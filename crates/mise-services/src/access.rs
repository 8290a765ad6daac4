//! Signed URL issuer.
//!
//! An access descriptor is a URL on the object's backend carrying the expiry, issue time,
//! principal and an optional client IP binding, plus an HMAC-SHA256 tag over those fields
//! keyed by the backend's signing secret:
//!
//! `{public_url}/{key}?b={backend}&exp={unix}&iat={unix}&p={principal}[&ip={ip}]&sig={hex}`
//!
//! Descriptors cannot be revoked. Their lifetime comes from the object's access TTL class and
//! never exceeds the configured ceiling or the end of the caller's authorization.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use mise_core::models::{BackendId, ObjectKind, StorageObject};
use mise_core::{AccessSettings, AppError, CachePolicyEngine, StorageSettings};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use utoipa::ToSchema;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_VERSION: &str = "v1";
const MAX_PRINCIPAL_LEN: usize = 256;

const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');
const KEY_PATH: &AsciiSet = &QUERY_VALUE.remove(b'/');

/// Answer of the external authorization collaborator for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub principal: String,
    pub allowed: bool,
    /// Access must not outlive this instant, e.g. the end of a paid period.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl AuthorizationDecision {
    pub fn allow(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            allowed: true,
            valid_until: None,
        }
    }

    pub fn deny(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            allowed: false,
            valid_until: None,
        }
    }

    pub fn until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }
}

/// A signed, expiring URL for one storage object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AccessDescriptor {
    pub key: String,
    pub backend: BackendId,
    pub url: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// What the origin will send as `Cache-Control` for this object.
    pub cache_control: String,
}

/// A verified descriptor. Never stored; rebuilt from the signed URL on every fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub principal: String,
    pub key: String,
    pub backend: BackendId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip: Option<IpAddr>,
}

/// Query parameters of a signed URL, as received by the origin.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedParams {
    pub b: String,
    pub exp: i64,
    pub iat: i64,
    pub p: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub sig: String,
}

struct SigningKey {
    public_url: String,
    secret: Vec<u8>,
}

pub struct SignedUrlIssuer {
    keys: HashMap<BackendId, SigningKey>,
    manifest_ttl: Duration,
    segment_ttl: Duration,
    max_ttl: Duration,
    bind_ip: bool,
    cache: CachePolicyEngine,
}

fn denied(key: &str, reason: &'static str) -> AppError {
    tracing::debug!(key = %key, reason, "Access denied");
    AppError::Denied(format!("Access to {} denied", key))
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

impl SignedUrlIssuer {
    /// Issuer without any backend keys; add them with [`Self::with_backend`].
    pub fn new(access: &AccessSettings, cache: CachePolicyEngine) -> Self {
        Self {
            keys: HashMap::new(),
            manifest_ttl: access.manifest_ttl,
            segment_ttl: access.segment_ttl,
            max_ttl: access.max_ttl,
            bind_ip: access.bind_ip,
            cache,
        }
    }

    pub fn from_config(
        storage: &StorageSettings,
        access: &AccessSettings,
        cache: CachePolicyEngine,
    ) -> Self {
        storage
            .backends
            .iter()
            .fold(Self::new(access, cache), |issuer, backend| {
                issuer.with_backend(
                    backend.id.clone(),
                    backend.public_url.clone(),
                    backend.signing_secret.as_bytes(),
                )
            })
    }

    pub fn with_backend(
        mut self,
        backend: BackendId,
        public_url: impl Into<String>,
        secret: impl AsRef<[u8]>,
    ) -> Self {
        let public_url = public_url.into().trim_end_matches('/').to_string();
        self.keys.insert(
            backend,
            SigningKey {
                public_url,
                secret: secret.as_ref().to_vec(),
            },
        );
        self
    }

    pub fn cache_policy(&self) -> &CachePolicyEngine {
        &self.cache
    }

    /// Access lifetime for an object kind, already clamped to the ceiling. Source masters are
    /// never served.
    pub fn access_ttl(&self, kind: ObjectKind) -> Option<Duration> {
        let ttl = match kind {
            ObjectKind::MasterPlaylist | ObjectKind::MediaPlaylist => self.manifest_ttl,
            ObjectKind::Segment => self.segment_ttl,
            ObjectKind::Master => return None,
        };
        Some(ttl.min(self.max_ttl))
    }

    /// Mint a descriptor for `object`. The decision must allow `principal`; the issuer makes
    /// no authorization decisions of its own.
    pub fn issue(
        &self,
        object: &StorageObject,
        principal: &str,
        decision: &AuthorizationDecision,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<AccessDescriptor, AppError> {
        validate_principal(principal)?;
        if !decision.allowed || decision.principal != principal {
            return Err(denied(&object.key, "authorization refused"));
        }
        let kind = ObjectKind::from_key(&object.key);
        let ttl = self
            .access_ttl(kind)
            .ok_or_else(|| denied(&object.key, "source masters are not served"))?;
        let key = self.keys.get(&object.backend).ok_or_else(|| {
            AppError::Internal(format!("No signing key for backend {}", object.backend))
        })?;

        let iat = now.timestamp();
        let mut exp = iat + ttl.as_secs() as i64;
        if let Some(until) = decision.valid_until {
            exp = exp.min(until.timestamp());
        }
        if exp <= iat {
            return Err(denied(&object.key, "authorization already lapsed"));
        }

        let ip = if self.bind_ip { client_ip } else { None };
        let ip_text = ip.map(|ip| ip.to_string()).unwrap_or_default();
        let sig = sign(
            &key.secret,
            &object.backend,
            &object.key,
            exp,
            iat,
            principal,
            &ip_text,
        )?;

        let mut url = format!(
            "{}/{}?b={}&exp={}&iat={}&p={}",
            key.public_url,
            utf8_percent_encode(&object.key, KEY_PATH),
            object.backend,
            exp,
            iat,
            utf8_percent_encode(principal, QUERY_VALUE),
        );
        if !ip_text.is_empty() {
            url.push_str(&format!("&ip={}", utf8_percent_encode(&ip_text, QUERY_VALUE)));
        }
        url.push_str(&format!("&sig={}", sig));

        let issued_at = timestamp(iat).ok_or_else(|| AppError::Internal("Clock out of range".into()))?;
        let expires_at = timestamp(exp).ok_or_else(|| AppError::Internal("Clock out of range".into()))?;
        Ok(AccessDescriptor {
            key: object.key.clone(),
            backend: object.backend.clone(),
            url,
            issued_at,
            expires_at,
            cache_control: self.cache.policy_for(kind).cache_control(),
        })
    }

    /// Check a signed fetch of `key`. Accepted iff the tag matches, `iat <= now < exp`, and
    /// the client IP equals the bound IP when there is one. Every rejection is `Denied`.
    pub fn verify(
        &self,
        key: &str,
        params: &SignedParams,
        client_ip: Option<IpAddr>,
        now: DateTime<Utc>,
    ) -> Result<AccessGrant, AppError> {
        let backend: BackendId = params
            .b
            .parse()
            .map_err(|_| denied(key, "malformed backend"))?;
        let signing = self
            .keys
            .get(&backend)
            .ok_or_else(|| denied(key, "unknown backend"))?;
        let tag = hex::decode(&params.sig).map_err(|_| denied(key, "malformed signature"))?;
        let ip_text = params.ip.clone().unwrap_or_default();

        let mut mac = HmacSha256::new_from_slice(&signing.secret)
            .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
        mac.update(
            canonical(&backend, key, params.exp, params.iat, &params.p, &ip_text).as_bytes(),
        );
        mac.verify_slice(&tag)
            .map_err(|_| denied(key, "signature mismatch"))?;

        let now = now.timestamp();
        if now >= params.exp {
            return Err(denied(key, "expired"));
        }
        if params.iat > now {
            return Err(denied(key, "issued in the future"));
        }

        let ip = match params.ip.as_deref() {
            Some(bound) => {
                let bound: IpAddr = bound.parse().map_err(|_| denied(key, "malformed ip"))?;
                if client_ip != Some(bound) {
                    return Err(denied(key, "ip mismatch"));
                }
                Some(bound)
            }
            None => None,
        };

        Ok(AccessGrant {
            principal: params.p.clone(),
            key: key.to_string(),
            backend,
            issued_at: timestamp(params.iat).ok_or_else(|| denied(key, "iat out of range"))?,
            expires_at: timestamp(params.exp).ok_or_else(|| denied(key, "exp out of range"))?,
            ip,
        })
    }
}

fn validate_principal(principal: &str) -> Result<(), AppError> {
    if principal.is_empty()
        || principal.len() > MAX_PRINCIPAL_LEN
        || principal.chars().any(char::is_control)
    {
        return Err(AppError::InvalidInput(format!(
            "Principal must be 1-{} printable characters",
            MAX_PRINCIPAL_LEN
        )));
    }
    Ok(())
}

fn canonical(backend: &BackendId, key: &str, exp: i64, iat: i64, principal: &str, ip: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}",
        SIGNATURE_VERSION, backend, key, exp, iat, principal, ip
    )
}

fn sign(
    secret: &[u8],
    backend: &BackendId,
    key: &str,
    exp: i64,
    iat: i64,
    principal: &str,
    ip: &str,
) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AppError::Internal(format!("Invalid signing key: {}", e)))?;
    mac.update(canonical(backend, key, exp, iat, principal, ip).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
