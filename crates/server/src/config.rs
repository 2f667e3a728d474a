//! Layered configuration: defaults merged with the process environment,
//! matching the `UPSTREAM_BASE_URL`/`POOL_*`/etc surface.

use std::time::Duration;

use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which storage backend to use. `Auto` picks SQL when a database URL
/// is configured, file otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Decide based on whether a database URL is present.
    Auto,
    /// Force the file-backed store.
    File,
    /// Force the SQL-backed store.
    Database,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the upstream chat-completions provider.
    pub upstream_base_url: String,
    /// SQL connection string, if configured.
    pub database_url: Option<String>,
    /// SQLite file path, used to derive `database_url` when unset.
    pub database_path: Option<String>,
    /// File-backend document path.
    pub data_file: String,
    /// Backend selection override.
    pub storage_type: StorageType,
    /// Whether the credential cache is enabled at all.
    pub cache_enabled: bool,
    /// Positive-entry cache TTL.
    pub cache_ttl_ms: u64,
    /// Whether the fallback controller may demote to the file backend.
    pub storage_fallback_enabled: bool,
    /// Reconnection probe interval while in fallback mode.
    pub storage_fallback_retry_interval_ms: u64,
    /// Connections kept warm in the upstream pool.
    pub pool_min_connections: usize,
    /// Hard cap on upstream pool connections.
    pub pool_max_connections: usize,
    /// How long `acquire` waits for a pooled connection.
    pub pool_acquire_timeout_ms: u64,
    /// SSE forwarder read-buffer size.
    pub stream_chunk_size: usize,
    /// Listen port.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: "https://api.openai.com".to_string(),
            database_url: None,
            database_path: None,
            data_file: "data/keys.json".to_string(),
            storage_type: StorageType::Auto,
            cache_enabled: true,
            cache_ttl_ms: 60_000,
            storage_fallback_enabled: true,
            storage_fallback_retry_interval_ms: 60_000,
            pool_min_connections: 1,
            pool_max_connections: 10,
            pool_acquire_timeout_ms: 30_000,
            stream_chunk_size: 16 * 1024,
            port: 8080,
        }
    }
}

/// Startup configuration failure; maps to exit code 1 (or 2 for a bind
/// failure detected later, handled separately in `main`).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment failed to merge or deserialize the configuration.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] figment::Error),
    /// A value parsed but fails a semantic check (e.g. zero pool size).
    #[error("invalid configuration: {0}")]
    Semantic(String),
}

impl GatewayConfig {
    /// Load configuration: built-in defaults, optionally a `gateway.toml`
    /// in the working directory, then environment variables (highest
    /// precedence), matching the env-var surface of the external
    /// interfaces contract.
    ///
    /// Environment variables are overlaid by hand rather than through
    /// `figment`'s generic `Env` provider: the spec's env-var names
    /// (`UPSTREAM_BASE_URL`, `POOL_MIN_CONNECTIONS`, ...) don't share a
    /// common prefix or casing convention with the struct's field
    /// names, so a direct per-field read is both simpler and more
    /// predictable than fighting `Env`'s key-mapping rules.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file("gateway.toml"))
            .extract()?;

        defaults.overlay_env().validate()
    }

    fn overlay_env(self) -> Self {
        let mut config = self;
        if let Ok(v) = std::env::var("UPSTREAM_BASE_URL") {
            config.upstream_base_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            config.database_url = Some(v);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            config.database_path = Some(v);
        }
        if let Ok(v) = std::env::var("DATA_FILE") {
            config.data_file = v;
        }
        if let Ok(v) = std::env::var("STORAGE_TYPE") {
            config.storage_type = match v.to_ascii_lowercase().as_str() {
                "file" => StorageType::File,
                "database" => StorageType::Database,
                _ => StorageType::Auto,
            };
        }
        if let Ok(v) = std::env::var("CACHE_ENABLED") {
            config.cache_enabled = parse_bool(&v, config.cache_enabled);
        }
        if let Ok(v) = std::env::var("CACHE_TTL_MS") {
            config.cache_ttl_ms = v.parse().unwrap_or(config.cache_ttl_ms);
        }
        if let Ok(v) = std::env::var("STORAGE_FALLBACK_ENABLED") {
            config.storage_fallback_enabled = parse_bool(&v, config.storage_fallback_enabled);
        }
        if let Ok(v) = std::env::var("STORAGE_FALLBACK_RETRY_INTERVAL_MS") {
            config.storage_fallback_retry_interval_ms =
                v.parse().unwrap_or(config.storage_fallback_retry_interval_ms);
        }
        if let Ok(v) = std::env::var("POOL_MIN_CONNECTIONS") {
            config.pool_min_connections = v.parse().unwrap_or(config.pool_min_connections);
        }
        if let Ok(v) = std::env::var("POOL_MAX_CONNECTIONS") {
            config.pool_max_connections = v.parse().unwrap_or(config.pool_max_connections);
        }
        if let Ok(v) = std::env::var("POOL_ACQUIRE_TIMEOUT_MS") {
            config.pool_acquire_timeout_ms = v.parse().unwrap_or(config.pool_acquire_timeout_ms);
        }
        if let Ok(v) = std::env::var("STREAM_CHUNK_SIZE") {
            config.stream_chunk_size = v.parse().unwrap_or(config.stream_chunk_size);
        }
        if let Ok(v) = std::env::var("PORT") {
            config.port = v.parse().unwrap_or(config.port);
        }
        config
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.pool_max_connections == 0 {
            return Err(ConfigError::Semantic(
                "POOL_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.pool_min_connections > self.pool_max_connections {
            return Err(ConfigError::Semantic(
                "POOL_MIN_CONNECTIONS must not exceed POOL_MAX_CONNECTIONS".to_string(),
            ));
        }
        Ok(self)
    }

    /// Whether the SQL backend should be used, given `storage_type` and
    /// which connection strings are present.
    #[must_use]
    pub fn use_sql_backend(&self) -> bool {
        match self.storage_type {
            StorageType::Database => true,
            StorageType::File => false,
            StorageType::Auto => self.database_url.is_some() || self.database_path.is_some(),
        }
    }

    /// The effective `sqlx` connection string: `database_url` if set,
    /// else derived from `database_path`.
    #[must_use]
    pub fn sql_connection_string(&self) -> Option<String> {
        if let Some(url) = &self.database_url {
            return Some(url.clone());
        }
        self.database_path
            .as_ref()
            .map(|path| format!("sqlite://{path}?mode=rwc"))
    }

    /// [`Duration`] view of `pool_acquire_timeout_ms`.
    #[must_use]
    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    /// [`Duration`] view of `cache_ttl_ms`.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
