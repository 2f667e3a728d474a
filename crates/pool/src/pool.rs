//! Generic async resource pool: bounded capacity, idle recycling, and a
//! background health-check sweep. Specialised by [`crate::upstream`] to
//! HTTP connections to the upstream API.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gateway_core::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::guard::Guard;

/// A type that can be pooled: created on demand and periodically
/// health-checked in the background.
#[async_trait]
pub trait Resource: Send + Sync + Sized + 'static {
    /// Construction parameters, shared across every instance the pool
    /// creates.
    type Config: Clone + Send + Sync + 'static;

    /// Build a fresh instance.
    async fn create(config: &Self::Config) -> Result<Self>;

    /// Cheap liveness probe, invoked by the background sweep. Instances
    /// that fail this are dropped rather than recycled.
    async fn health_check(&self) -> bool;
}

/// Pool tuning knobs, mirroring `POOL_*` deployment configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept warm even when idle.
    pub min_connections: usize,
    /// Hard cap on concurrently-held connections.
    pub max_connections: usize,
    /// How long `acquire` waits for a permit before giving up.
    pub acquire_timeout: Duration,
    /// An idle connection older than this is evicted instead of reused,
    /// once above `min_connections`.
    pub idle_timeout: Duration,
    /// Interval between background health-check sweeps.
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

struct Entry<T> {
    resource: T,
    created_at: Instant,
    last_used_at: Instant,
    request_count: u64,
}

/// Point-in-time counters for `/stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Connections currently idle and available for acquisition.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Connections created over the pool's lifetime.
    pub total_created: u64,
    /// Connections destroyed (failed health check or idle eviction).
    pub total_destroyed: u64,
}

struct PoolInner<R: Resource> {
    idle: Mutex<VecDeque<Entry<R>>>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
    resource_config: R::Config,
    in_use: AtomicU64,
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
}

/// A bounded pool of `R` instances.
pub struct Pool<R: Resource> {
    inner: Arc<PoolInner<R>>,
    cancel: CancellationToken,
}

impl<R: Resource> Pool<R> {
    /// Build a pool and pre-warm it to `config.min_connections`.
    pub async fn new(config: PoolConfig, resource_config: R::Config) -> Result<Self> {
        let inner = Arc::new(PoolInner {
            idle: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: config.clone(),
            resource_config,
            in_use: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_destroyed: AtomicU64::new(0),
        });

        for _ in 0..config.min_connections {
            let resource = R::create(&inner.resource_config).await?;
            inner.total_created.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            inner.idle.lock().push_back(Entry {
                resource,
                created_at: now,
                last_used_at: now,
                request_count: 0,
            });
        }

        Ok(Self {
            inner,
            cancel: CancellationToken::new(),
        })
    }

    /// Acquire a connection, creating one if the pool is below capacity
    /// and none are idle. Waits up to `acquire_timeout` for a permit
    /// before returning [`Error::Unavailable`].
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<Guard<R>> {
        let permit = tokio::time::timeout(
            self.inner.config.acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::unavailable("timed out acquiring upstream connection"))?
        .expect("semaphore never closed");
        permit.forget();

        let popped = self.inner.idle.lock().pop_front();
        let mut entry = match popped {
            Some(entry) => entry,
            None => {
                let resource = match R::create(&self.inner.resource_config).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.inner.semaphore.add_permits(1);
                        return Err(e);
                    }
                };
                self.inner.total_created.fetch_add(1, Ordering::Relaxed);
                let now = Instant::now();
                Entry {
                    resource,
                    created_at: now,
                    last_used_at: now,
                    request_count: 0,
                }
            }
        };

        entry.last_used_at = Instant::now();
        entry.request_count += 1;
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.clone();
        let created_at = entry.created_at;
        let request_count = entry.request_count;
        Ok(Guard::new(entry.resource, move |resource| {
            inner.in_use.fetch_sub(1, Ordering::Relaxed);
            inner.idle.lock().push_back(Entry {
                resource,
                created_at,
                last_used_at: Instant::now(),
                request_count,
            });
            inner.semaphore.add_permits(1);
        }))
    }

    /// Discard a checked-out connection instead of returning it to the
    /// idle set — for a resource observed broken in a way
    /// `health_check` would not necessarily catch (a transport error or
    /// timeout mid-request). Still releases the connection's semaphore
    /// permit and `in_use` slot, so pool capacity does not shrink.
    pub fn discard(&self, guard: Guard<R>) {
        let _resource = guard.into_inner();
        self.inner.in_use.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_destroyed.fetch_add(1, Ordering::Relaxed);
        self.inner.semaphore.add_permits(1);
    }

    /// Current pool-wide counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            in_use: self.inner.in_use.load(Ordering::Relaxed) as usize,
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            total_destroyed: self.inner.total_destroyed.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background health-check and idle-eviction sweep. The
    /// returned join handle completes once `shutdown` is called.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.health_check_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                sweep(&inner).await;
            }
        })
    }

    /// Signal the background sweep task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn sweep<R: Resource>(inner: &Arc<PoolInner<R>>) {
    let candidates: Vec<Entry<R>> = {
        let mut idle = inner.idle.lock();
        let len = idle.len();
        if len <= inner.config.min_connections {
            return;
        }
        idle.drain(..).collect()
    };

    let mut survivors = VecDeque::new();
    let now = Instant::now();
    for entry in candidates {
        let too_idle = now.duration_since(entry.last_used_at) > inner.config.idle_timeout
            && survivors.len() + 1 > inner.config.min_connections;
        if too_idle {
            inner.total_destroyed.fetch_add(1, Ordering::Relaxed);
            debug!("evicting idle pooled connection past idle_timeout");
            continue;
        }
        if entry.resource.health_check().await {
            survivors.push_back(entry);
        } else {
            inner.total_destroyed.fetch_add(1, Ordering::Relaxed);
            warn!("evicting pooled connection that failed health check");
        }
    }

    inner.idle.lock().extend(survivors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    struct Counter(u32);

    #[async_trait]
    impl Resource for Counter {
        type Config = Arc<AtomicU64>;

        async fn create(config: &Self::Config) -> Result<Self> {
            Ok(Self(config.fetch_add(1, Ordering::SeqCst) as u32))
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn pre_warms_to_min_connections() {
        let counter = Arc::new(AtomicU64::new(0));
        let pool = Pool::<Counter>::new(
            PoolConfig {
                min_connections: 3,
                max_connections: 5,
                ..Default::default()
            },
            counter,
        )
        .await
        .unwrap();
        assert_eq!(pool.stats().idle, 3);
        assert_eq!(pool.stats().total_created, 3);
    }

    #[tokio::test]
    async fn acquire_recycles_on_guard_drop() {
        let pool = Pool::<Counter>::new(
            PoolConfig {
                min_connections: 1,
                max_connections: 2,
                ..Default::default()
            },
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        assert_eq!(pool.stats().idle, 1);
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 1);
        drop(guard);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn acquire_beyond_max_times_out() {
        let pool = Pool::<Counter>::new(
            PoolConfig {
                min_connections: 1,
                max_connections: 1,
                acquire_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        let guard = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable { .. }));
        drop(guard);
    }

    #[tokio::test]
    async fn discard_releases_permit_without_requeuing() {
        let pool = Pool::<Counter>::new(
            PoolConfig {
                min_connections: 1,
                max_connections: 1,
                acquire_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(AtomicU64::new(0)),
        )
        .await
        .unwrap();

        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
        pool.discard(guard);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().total_destroyed, 1);

        // the released permit must be immediately usable by a new acquire
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 1);
        drop(guard);
    }

    struct Flaky(Arc<AtomicBool>);

    #[async_trait]
    impl Resource for Flaky {
        type Config = Arc<AtomicBool>;

        async fn create(config: &Self::Config) -> Result<Self> {
            Ok(Self(config.clone()))
        }

        async fn health_check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn sweep_evicts_unhealthy_above_min() {
        let healthy = Arc::new(AtomicBool::new(true));
        let pool = Pool::<Flaky>::new(
            PoolConfig {
                min_connections: 1,
                max_connections: 3,
                ..Default::default()
            },
            healthy.clone(),
        )
        .await
        .unwrap();

        {
            let resource = Flaky(Arc::new(AtomicBool::new(false)));
            let now = Instant::now();
            pool.inner.idle.lock().push_back(Entry {
                resource,
                created_at: now,
                last_used_at: now,
                request_count: 0,
            });
        }
        assert_eq!(pool.stats().idle, 2);

        sweep(&pool.inner).await;
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().total_destroyed, 1);
        let _ = healthy;
    }
}
