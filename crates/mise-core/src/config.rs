//! Configuration module
//!
//! Everything is read from environment variables (after loading `.env` with `dotenvy`).
//! Storage backends are declared as a list in `STORAGE_BACKENDS` and configured through
//! `STORAGE_<ID>_*` variables, so adding a provider is a configuration change only.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache_policy::{CachePolicyEngine, DEFAULT_MANIFEST_TTL_SECS, DEFAULT_SEGMENT_TTL_SECS};
use crate::models::{BackendId, BackendKind};

const SERVER_PORT: u16 = 3000;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MIN_SIGNING_SECRET_BYTES: usize = 32;
const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Where pipeline state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    /// Process-local; development and tests only.
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(StoreKind::Postgres),
            "memory" => Ok(StoreKind::Memory),
            _ => Err(anyhow::anyhow!("Invalid STORE: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub id: BackendId,
    pub kind: BackendKind,
    pub bucket: Option<String>,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible providers (MinIO, R2, Spaces...).
    pub endpoint: Option<String>,
    pub local_path: Option<PathBuf>,
    /// Base URL embedded in access descriptors for objects on this backend.
    pub public_url: String,
    pub signing_secret: String,
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    pub backends: Vec<BackendConfig>,
    pub primary: BackendId,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub verify_checksum_max_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct TranscodeSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub hls_segment_duration: u64,
    pub scratch_dir: PathBuf,
    pub max_workers: usize,
    pub poll_interval_ms: u64,
    pub job_timeout_secs: u64,
    pub max_attempts: i32,
    pub stale_reap_interval_secs: u64,
    pub stale_grace_secs: i64,
}

#[derive(Clone, Debug)]
pub struct AccessSettings {
    pub manifest_ttl: Duration,
    pub segment_ttl: Duration,
    /// Hard ceiling on any descriptor lifetime, independent of cache TTLs.
    pub max_ttl: Duration,
    pub bind_ip: bool,
    pub playback_segment_window: usize,
    pub authorizer_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub manifest_ttl: Duration,
    pub segment_ttl: Duration,
}

impl CacheSettings {
    pub fn engine(&self) -> CachePolicyEngine {
        CachePolicyEngine::new(self.manifest_ttl, self.segment_ttl)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub environment: String,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub max_upload_bytes: u64,
    pub migration_batch_size: i64,
    pub log_json: bool,
    /// Proxies in front of the server whose `X-Forwarded-For` entries are trusted.
    pub trusted_proxy_count: usize,
    pub storage: StorageSettings,
    pub transcode: TranscodeSettings,
    pub access: AccessSettings,
    pub cache: CacheSettings,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    lookup(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from an arbitrary variable source. Does not validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let server_port = parse_or(&lookup, "SERVER_PORT", SERVER_PORT);
        let store = match lookup("STORE") {
            Some(v) => v.parse()?,
            None => StoreKind::Postgres,
        };

        let storage = Self::storage_from_lookup(&lookup, server_port)?;

        let transcode = TranscodeSettings {
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_path: lookup("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
            hls_segment_duration: parse_or(&lookup, "HLS_SEGMENT_DURATION", 6),
            scratch_dir: lookup("TRANSCODE_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            max_workers: parse_or(&lookup, "TRANSCODE_MAX_WORKERS", 2),
            poll_interval_ms: parse_or(&lookup, "TRANSCODE_POLL_INTERVAL_MS", 1000),
            job_timeout_secs: parse_or(&lookup, "TRANSCODE_JOB_TIMEOUT_SECS", 7200),
            max_attempts: parse_or(&lookup, "TRANSCODE_MAX_ATTEMPTS", 3),
            stale_reap_interval_secs: parse_or(&lookup, "TRANSCODE_STALE_REAP_INTERVAL_SECS", 60),
            stale_grace_secs: parse_or(&lookup, "TRANSCODE_STALE_GRACE_SECS", 300),
        };

        let access = AccessSettings {
            manifest_ttl: Duration::from_secs(parse_or(&lookup, "ACCESS_MANIFEST_TTL_SECS", 600)),
            segment_ttl: Duration::from_secs(parse_or(&lookup, "ACCESS_SEGMENT_TTL_SECS", 900)),
            max_ttl: Duration::from_secs(parse_or(&lookup, "ACCESS_MAX_TTL_SECS", 900)),
            bind_ip: parse_bool(&lookup, "ACCESS_BIND_IP", false),
            playback_segment_window: parse_or(&lookup, "PLAYBACK_SEGMENT_WINDOW", 3),
            authorizer_url: lookup("AUTHORIZER_URL").filter(|v| !v.is_empty()),
        };

        let cache = CacheSettings {
            manifest_ttl: Duration::from_secs(parse_or(
                &lookup,
                "CACHE_MANIFEST_TTL_SECS",
                DEFAULT_MANIFEST_TTL_SECS,
            )),
            segment_ttl: Duration::from_secs(parse_or(
                &lookup,
                "CACHE_SEGMENT_TTL_SECS",
                DEFAULT_SEGMENT_TTL_SECS,
            )),
        };

        Ok(Config {
            server_port,
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            store,
            database_url: lookup("DATABASE_URL"),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", MAX_CONNECTIONS),
            db_timeout_seconds: parse_or(&lookup, "DB_TIMEOUT_SECONDS", CONNECTION_TIMEOUT_SECS),
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", MAX_UPLOAD_BYTES),
            migration_batch_size: parse_or(&lookup, "MIGRATION_BATCH_SIZE", 100),
            log_json: lookup("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
            trusted_proxy_count: parse_or(&lookup, "TRUSTED_PROXY_COUNT", 0),
            storage,
            transcode,
            access,
            cache,
        })
    }

    fn storage_from_lookup(
        lookup: &impl Fn(&str) -> Option<String>,
        server_port: u16,
    ) -> anyhow::Result<StorageSettings> {
        let ids: Vec<BackendId> = lookup("STORAGE_BACKENDS")
            .unwrap_or_else(|| "primary".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<anyhow::Result<_>>()?;

        let mut backends = Vec::with_capacity(ids.len());
        for id in &ids {
            let var = |suffix: &str| {
                lookup(&format!(
                    "STORAGE_{}_{}",
                    id.as_str().to_uppercase().replace('-', "_"),
                    suffix
                ))
            };
            let kind = match var("KIND") {
                Some(kind) => kind.parse()?,
                None => BackendKind::Local,
            };
            backends.push(BackendConfig {
                id: id.clone(),
                kind,
                bucket: var("BUCKET"),
                region: var("REGION").or_else(|| lookup("AWS_REGION")),
                endpoint: var("ENDPOINT"),
                local_path: Some(
                    var("PATH")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("./data").join(id.as_str())),
                ),
                public_url: var("PUBLIC_URL")
                    .unwrap_or_else(|| format!("http://localhost:{}/origin", server_port)),
                signing_secret: var("SIGNING_SECRET").unwrap_or_default(),
            });
        }

        let primary = match lookup("STORAGE_PRIMARY_BACKEND") {
            Some(p) => p.parse()?,
            None => ids
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("STORAGE_BACKENDS must name at least one backend"))?,
        };

        Ok(StorageSettings {
            backends,
            primary,
            retry_max_attempts: parse_or(lookup, "STORAGE_RETRY_MAX_ATTEMPTS", 4),
            retry_base_delay: Duration::from_millis(parse_or(
                lookup,
                "STORAGE_RETRY_BASE_DELAY_MS",
                200,
            )),
            retry_max_delay: Duration::from_millis(parse_or(
                lookup,
                "STORAGE_RETRY_MAX_DELAY_MS",
                5000,
            )),
            verify_checksum_max_bytes: parse_or(
                lookup,
                "STORAGE_VERIFY_CHECKSUM_MAX_BYTES",
                64 * 1024 * 1024,
            ),
        })
    }

    /// Check cross-field constraints. Called by [`Config::from_env`].
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store == StoreKind::Postgres && self.database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required when STORE=postgres");
        }

        let mut seen = HashMap::new();
        for backend in &self.storage.backends {
            if seen.insert(backend.id.clone(), ()).is_some() {
                anyhow::bail!("Storage backend '{}' declared twice", backend.id);
            }
            if backend.signing_secret.len() < MIN_SIGNING_SECRET_BYTES {
                anyhow::bail!(
                    "STORAGE_{}_SIGNING_SECRET must be at least {} bytes",
                    backend.id.as_str().to_uppercase(),
                    MIN_SIGNING_SECRET_BYTES
                );
            }
            if backend.kind == BackendKind::S3 && backend.bucket.is_none() {
                anyhow::bail!(
                    "STORAGE_{}_BUCKET is required for s3 backends",
                    backend.id.as_str().to_uppercase()
                );
            }
        }
        if !seen.contains_key(&self.storage.primary) {
            anyhow::bail!(
                "Primary backend '{}' is not listed in STORAGE_BACKENDS",
                self.storage.primary
            );
        }

        if self.access.max_ttl.is_zero() {
            anyhow::bail!("ACCESS_MAX_TTL_SECS must be positive");
        }
        if self.transcode.max_workers == 0 {
            anyhow::bail!("TRANSCODE_MAX_WORKERS must be at least 1");
        }
        if self.transcode.max_attempts < 1 {
            anyhow::bail!("TRANSCODE_MAX_ATTEMPTS must be at least 1");
        }
        if self.storage.retry_max_attempts == 0 {
            anyhow::bail!("STORAGE_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }

    pub fn backend(&self, id: &BackendId) -> Option<&BackendConfig> {
        self.storage.backends.iter().find(|b| &b.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn defaults_apply_for_minimal_environment() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE", "memory"),
            ("STORAGE_PRIMARY_SIGNING_SECRET", SECRET),
        ]))
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server_port, 3000);
        assert_eq!(config.storage.primary.as_str(), "primary");
        assert_eq!(config.storage.backends[0].kind, BackendKind::Local);
        assert_eq!(config.cache.manifest_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.segment_ttl, Duration::from_secs(86_400));
        assert_eq!(config.access.max_ttl, Duration::from_secs(900));
        assert_eq!(config.transcode.max_attempts, 3);
    }

    #[test]
    fn multiple_backends_parsed_with_prefixed_vars() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE", "memory"),
            ("STORAGE_BACKENDS", "aws, r2-eu"),
            ("STORAGE_PRIMARY_BACKEND", "r2-eu"),
            ("STORAGE_AWS_KIND", "s3"),
            ("STORAGE_AWS_BUCKET", "videos"),
            ("STORAGE_AWS_SIGNING_SECRET", SECRET),
            ("STORAGE_R2_EU_KIND", "s3"),
            ("STORAGE_R2_EU_BUCKET", "videos-eu"),
            ("STORAGE_R2_EU_ENDPOINT", "https://r2.example.com"),
            ("STORAGE_R2_EU_SIGNING_SECRET", SECRET),
        ]))
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.storage.backends.len(), 2);
        assert_eq!(config.storage.primary.as_str(), "r2-eu");
        let r2 = config.backend(&"r2-eu".parse().unwrap()).unwrap();
        assert_eq!(r2.endpoint.as_deref(), Some("https://r2.example.com"));
    }

    #[test]
    fn short_signing_secret_rejected() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE", "memory"),
            ("STORAGE_PRIMARY_SIGNING_SECRET", "short"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn postgres_requires_database_url() {
        let config = Config::from_lookup(lookup_from(&[(
            "STORAGE_PRIMARY_SIGNING_SECRET",
            SECRET,
        )]))
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn unknown_primary_rejected() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE", "memory"),
            ("STORAGE_PRIMARY_BACKEND", "other"),
            ("STORAGE_PRIMARY_SIGNING_SECRET", SECRET),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }
}
