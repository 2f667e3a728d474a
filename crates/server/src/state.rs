//! Dependency-injected request context, built once at startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use gateway_core::{Error, Result};
use gateway_credential::store::file::FileStore;
use gateway_credential::store::sql::SqlStore;
use gateway_credential::{CacheConfig, CredentialCache, CredentialRecord, CredentialStats, CredentialStore};
use gateway_pool::{BufferPool, Pool, PoolConfig, UpstreamConfig, UpstreamConnection};
use gateway_resilience::{Backend, FallbackConfig, FallbackController, RateLimiter};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::GatewayConfig;

/// Shared, dependency-injected context handed to every request handler.
///
/// Constructed once at startup (or fresh per test case); holds no
/// global statics.
pub struct GatewayState {
    /// Resolved configuration.
    pub config: GatewayConfig,
    /// SQL-backed store, present whenever `config.use_sql_backend()` and
    /// the last connection attempt (initial or reconnect-probe) succeeded.
    /// Swapped in by the background reconnect loop, so it's an
    /// `ArcSwapOption` rather than a plain field set once at startup.
    pub sql_store: Arc<ArcSwapOption<SqlStore>>,
    /// File-backed store, always present as the fallback target.
    pub file_store: Arc<FileStore>,
    /// Front-end lookup cache, `None` when `CACHE_ENABLED=false`.
    pub cache: Option<Arc<CredentialCache>>,
    /// Primary/fallback backend selector.
    pub fallback: Arc<FallbackController>,
    /// Rolling-window admission/charge engine.
    pub limiter: Arc<RateLimiter>,
    /// Pooled upstream HTTP connections.
    pub pool: Arc<Pool<UpstreamConnection>>,
    /// Tiered scratch buffers backing the SSE forwarder's read loop.
    pub buffer_pool: Arc<BufferPool>,
    /// Count of `file_store` writes currently in flight. The reconnect
    /// loop's probe consults this before promoting back to `Primary`,
    /// so a promotion never races a write that is still landing on the
    /// fallback backend.
    file_writes_in_flight: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl GatewayState {
    /// Build the full dependency graph: storage backends, cache,
    /// fallback controller, limiter, and the upstream connection pool.
    /// Returns `Unavailable` if both configured storage paths fail to
    /// initialize (maps to exit code 1 in `main`).
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let file_store = Arc::new(FileStore::new(config.data_file.clone()));
        file_store.initialize().await?;

        let sql_conn = if config.use_sql_backend() {
            Some(
                config
                    .sql_connection_string()
                    .ok_or_else(|| Error::internal("use_sql_backend true but no connection string"))?,
            )
        } else {
            None
        };

        let sql_store = if let Some(conn) = &sql_conn {
            match SqlStore::connect(conn).await {
                Ok(store) => {
                    store.initialize().await?;
                    Some(Arc::new(store))
                }
                Err(e) if config.storage_fallback_enabled => {
                    tracing::warn!(error = %e, "sql backend unreachable at startup, starting in fallback");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };
        let sql_store = Arc::new(ArcSwapOption::from(sql_store));

        let fallback = Arc::new(FallbackController::new(FallbackConfig {
            enabled: config.storage_fallback_enabled,
            retry_interval_ms: config.storage_fallback_retry_interval_ms,
            ..FallbackConfig::default()
        }));
        if config.use_sql_backend() && sql_store.load().is_none() {
            fallback.record_sql_failure();
            fallback.record_sql_failure();
            fallback.record_sql_failure();
        }

        let file_writes_in_flight = Arc::new(AtomicU64::new(0));

        let shutdown = CancellationToken::new();
        if let Some(conn) = sql_conn {
            if config.storage_fallback_enabled {
                spawn_reconnect_loop(
                    conn,
                    sql_store.clone(),
                    fallback.clone(),
                    file_store.clone(),
                    file_writes_in_flight.clone(),
                    shutdown.clone(),
                );
            }
        }

        let cache = config
            .cache_enabled
            .then(|| Arc::new(CredentialCache::new(CacheConfig {
                positive_ttl: config.cache_ttl(),
                ..CacheConfig::default()
            })));

        let base_url = Url::parse(&config.upstream_base_url)
            .map_err(|e| Error::internal(format!("invalid UPSTREAM_BASE_URL: {e}")))?;
        let pool = Arc::new(
            Pool::<UpstreamConnection>::new(
                PoolConfig {
                    min_connections: config.pool_min_connections,
                    max_connections: config.pool_max_connections,
                    acquire_timeout: config.pool_acquire_timeout(),
                    ..PoolConfig::default()
                },
                UpstreamConfig {
                    base_url,
                    request_timeout: std::time::Duration::from_secs(300),
                },
            )
            .await?,
        );
        pool.spawn_maintenance();

        Ok(Self {
            config,
            sql_store,
            file_store,
            cache,
            fallback,
            limiter: Arc::new(RateLimiter::new()),
            pool,
            buffer_pool: Arc::new(BufferPool::new()),
            file_writes_in_flight,
            shutdown,
        })
    }

    /// Apply `update_usage` against the file backend, tracked as
    /// in-flight for the duration of the call so a concurrent reconnect
    /// probe never promotes back to `Primary` mid-write.
    async fn write_file_store(
        &self,
        key: &str,
        tokens_used: i64,
        model: Option<&str>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.file_writes_in_flight.fetch_add(1, Ordering::AcqRel);
        let result = self.file_store.update_usage(key, tokens_used, model, now).await;
        self.file_writes_in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Which storage backend is authoritative right now.
    #[must_use]
    pub fn active_backend(&self) -> Backend {
        if self.sql_store.load().is_none() {
            return Backend::Fallback;
        }
        self.fallback.current_backend()
    }

    /// Look up a credential by key, going through the cache first.
    pub async fn find_credential(&self, key: &str) -> Result<Option<Arc<CredentialRecord>>> {
        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(key).await {
                return Ok(entry);
            }
        }

        let found = self.find_credential_uncached(key).await?;

        if let Some(cache) = &self.cache {
            match &found {
                Some(record) => cache.insert_found(key.to_string(), record.clone()).await,
                None => cache.insert_not_found(key.to_string()).await,
            }
        }

        Ok(found)
    }

    async fn find_credential_uncached(&self, key: &str) -> Result<Option<Arc<CredentialRecord>>> {
        match self.active_backend() {
            Backend::Primary => {
                let store = self
                    .sql_store
                    .load_full()
                    .expect("active_backend only returns Primary when sql_store is Some");
                match store.find(key).await {
                    Ok(found) => {
                        self.fallback.record_sql_success();
                        Ok(found.map(Arc::new))
                    }
                    Err(e) => {
                        self.fallback.record_sql_failure();
                        if self.config.storage_fallback_enabled {
                            Ok(self.file_store.find(key).await?.map(Arc::new))
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            Backend::Fallback => Ok(self.file_store.find(key).await?.map(Arc::new)),
        }
    }

    /// Apply a usage delta to `key`'s record and invalidate the cache
    /// entry so the next lookup observes the update.
    pub async fn update_usage(&self, key: &str, tokens_used: i64, model: Option<&str>) -> Result<()> {
        let now = gateway_core::now();
        let result = match self.active_backend() {
            Backend::Primary => {
                let store = self
                    .sql_store
                    .load_full()
                    .expect("active_backend only returns Primary when sql_store is Some");
                match store.update_usage(key, tokens_used, model, now).await {
                    Ok(()) => {
                        self.fallback.record_sql_success();
                        Ok(())
                    }
                    Err(e) => {
                        self.fallback.record_sql_failure();
                        if self.config.storage_fallback_enabled {
                            self.write_file_store(key, tokens_used, model, now).await
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            Backend::Fallback => self.write_file_store(key, tokens_used, model, now).await,
        };

        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }

        result
    }

    /// Derived usage view for `GET /stats`. Reads the active backend
    /// directly, bypassing the credential cache — an infrequent,
    /// tenant-facing call doesn't need that extra layer.
    pub async fn stats(&self, key: &str) -> Result<Option<CredentialStats>> {
        match self.active_backend() {
            Backend::Primary => {
                let store = self
                    .sql_store
                    .load_full()
                    .expect("active_backend only returns Primary when sql_store is Some");
                match store.stats(key).await {
                    Ok(found) => {
                        self.fallback.record_sql_success();
                        Ok(found)
                    }
                    Err(e) => {
                        self.fallback.record_sql_failure();
                        if self.config.storage_fallback_enabled {
                            self.file_store.stats(key).await
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            Backend::Fallback => self.file_store.stats(key).await,
        }
    }

    /// Signal background tasks (pool maintenance, fallback reconnect)
    /// to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown();
    }

    /// Token shared with background tasks spawned alongside this state.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Background task that probes the SQL backend every
/// `storage_fallback_retry_interval_ms` while the controller is on
/// [`Backend::Fallback`]. A probe is a full reconnect-and-initialize
/// attempt against `conn`; on success the freshly connected store is
/// swapped in, but the probe only reports success — and so only lets
/// `run_reconnect_loop` call `record_sql_success` to flip the
/// controller back to `Primary` — once `file_writes_in_flight` reads
/// zero, so the promotion never races a write still landing on the
/// fallback backend. Each probe tick is also used as the opportunity
/// to compact the file backend (drop fully-expired usage windows)
/// since it's the one periodic hook already running while the gateway
/// is in fallback mode, the only time the file backend sees write
/// traffic.
fn spawn_reconnect_loop(
    conn: String,
    sql_store: Arc<ArcSwapOption<SqlStore>>,
    fallback: Arc<FallbackController>,
    file_store: Arc<FileStore>,
    file_writes_in_flight: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        fallback
            .run_reconnect_loop(
                || {
                    let conn = conn.clone();
                    let sql_store = sql_store.clone();
                    let file_store = file_store.clone();
                    let file_writes_in_flight = file_writes_in_flight.clone();
                    async move {
                        if let Err(e) = file_store.compact(gateway_core::now()).await {
                            tracing::warn!(error = %e, "opportunistic file-backend compaction failed");
                        }

                        let reconnected = match SqlStore::connect(&conn).await {
                            Ok(store) => match store.initialize().await {
                                Ok(()) => {
                                    sql_store.store(Some(Arc::new(store)));
                                    true
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "sql reconnect probe: initialize failed");
                                    false
                                }
                            },
                            Err(e) => {
                                tracing::warn!(error = %e, "sql reconnect probe: connect failed");
                                false
                            }
                        };

                        if reconnected && file_writes_in_flight.load(Ordering::Acquire) != 0 {
                            tracing::debug!(
                                "sql reconnect probe succeeded but deferring promotion: file-backend write in flight"
                            );
                            return false;
                        }
                        reconnected
                    }
                },
                shutdown,
            )
            .await;
    });
}
