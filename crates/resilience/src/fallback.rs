//! Primary/fallback storage controller: a circuit-breaker-shaped state
//! machine that trips to the fallback backend after consecutive SQL
//! failures and probes for recovery in the background.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which storage backend should service the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The configured SQL backend.
    Primary,
    /// The file-backed fallback.
    Fallback,
}

const STATE_PRIMARY: u8 = 0;
const STATE_FALLBACK: u8 = 1;

/// Tuning knobs for the fallback controller.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Whether falling back is permitted at all. If `false`, a SQL
    /// failure propagates as an error instead of tripping over.
    pub enabled: bool,
    /// How often the background task re-probes the primary backend.
    pub retry_interval_ms: u64,
    /// Consecutive failures within `failure_window` required to trip.
    pub failure_threshold: u32,
    /// Window over which consecutive failures are counted; a success
    /// resets the counter regardless of window.
    pub failure_window_ms: u64,
    /// Cap on reconnection attempts the background loop will make
    /// before giving up (0 means unbounded).
    pub max_retries: u32,
    /// Emit an info-level log line on every state transition.
    pub verbose_logging: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_interval_ms: 30_000,
            failure_threshold: 3,
            failure_window_ms: 10_000,
            max_retries: 0,
            verbose_logging: true,
        }
    }
}

struct Inner {
    consecutive_failures: u32,
    first_failure_at: Option<std::time::Instant>,
    reconnect_attempts: u32,
}

/// Tracks primary/fallback health and exposes a lock-free read of the
/// current backend for the hot path, with detailed bookkeeping behind
/// a `RwLock` for the cold transition path.
pub struct FallbackController {
    config: FallbackConfig,
    state: AtomicU8,
    inner: RwLock<Inner>,
}

impl FallbackController {
    /// Build a controller starting on the primary backend.
    #[must_use]
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(STATE_PRIMARY),
            inner: RwLock::new(Inner {
                consecutive_failures: 0,
                first_failure_at: None,
                reconnect_attempts: 0,
            }),
        }
    }

    /// Lock-free read of which backend should be used right now.
    #[must_use]
    pub fn current_backend(&self) -> Backend {
        match self.state.load(Ordering::Acquire) {
            STATE_FALLBACK => Backend::Fallback,
            _ => Backend::Primary,
        }
    }

    /// Record a SQL operation failure. Trips to [`Backend::Fallback`]
    /// once `failure_threshold` consecutive failures land within
    /// `failure_window_ms`; a gap longer than the window resets the
    /// streak rather than counting as consecutive.
    pub fn record_sql_failure(&self) {
        if !self.config.enabled {
            return;
        }
        let now = std::time::Instant::now();
        let mut inner = self.inner.write();

        let window = Duration::from_millis(self.config.failure_window_ms);
        let within_window = inner
            .first_failure_at
            .is_some_and(|first| now.duration_since(first) <= window);

        if within_window {
            inner.consecutive_failures += 1;
        } else {
            inner.consecutive_failures = 1;
            inner.first_failure_at = Some(now);
        }

        if inner.consecutive_failures >= self.config.failure_threshold
            && self.state.load(Ordering::Acquire) == STATE_PRIMARY
        {
            self.state.store(STATE_FALLBACK, Ordering::Release);
            if self.config.verbose_logging {
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "tripping to fallback storage backend"
                );
            }
        }
    }

    /// Record a SQL operation success, resetting the failure streak.
    /// If the controller was on the fallback backend, this is the
    /// signal that a reconnection probe succeeded — switch back.
    pub fn record_sql_success(&self) {
        let mut inner = self.inner.write();
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.reconnect_attempts = 0;

        if self.state.load(Ordering::Acquire) == STATE_FALLBACK {
            self.state.store(STATE_PRIMARY, Ordering::Release);
            if self.config.verbose_logging {
                info!("recovered; switching back to primary storage backend");
            }
        }
    }

    /// Run a background loop that periodically invokes `probe` while
    /// on the fallback backend, and calls [`Self::record_sql_success`]
    /// on the first successful probe. Returns once `cancel` fires, the
    /// probe succeeds, or `max_retries` is exhausted.
    pub async fn run_reconnect_loop<F, Fut>(self: &Arc<Self>, probe: F, cancel: CancellationToken)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let interval = Duration::from_millis(self.config.retry_interval_ms);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }

            if self.current_backend() != Backend::Fallback {
                continue;
            }

            {
                let mut inner = self.inner.write();
                inner.reconnect_attempts += 1;
                if self.config.max_retries != 0 && inner.reconnect_attempts > self.config.max_retries {
                    warn!("giving up on primary storage backend reconnection");
                    return;
                }
            }

            if probe().await {
                self.record_sql_success();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_on_primary() {
        let ctrl = FallbackController::new(FallbackConfig::default());
        assert_eq!(ctrl.current_backend(), Backend::Primary);
    }

    #[test]
    fn trips_after_threshold_consecutive_failures() {
        let ctrl = FallbackController::new(FallbackConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        ctrl.record_sql_failure();
        ctrl.record_sql_failure();
        assert_eq!(ctrl.current_backend(), Backend::Primary);
        ctrl.record_sql_failure();
        assert_eq!(ctrl.current_backend(), Backend::Fallback);
    }

    #[test]
    fn success_resets_streak_and_restores_primary() {
        let ctrl = FallbackController::new(FallbackConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        ctrl.record_sql_failure();
        ctrl.record_sql_failure();
        assert_eq!(ctrl.current_backend(), Backend::Fallback);

        ctrl.record_sql_success();
        assert_eq!(ctrl.current_backend(), Backend::Primary);
    }

    #[test]
    fn disabled_controller_never_trips() {
        let ctrl = FallbackController::new(FallbackConfig {
            enabled: false,
            failure_threshold: 1,
            ..Default::default()
        });
        ctrl.record_sql_failure();
        ctrl.record_sql_failure();
        assert_eq!(ctrl.current_backend(), Backend::Primary);
    }

    #[tokio::test]
    async fn reconnect_loop_switches_back_on_successful_probe() {
        let ctrl = Arc::new(FallbackController::new(FallbackConfig {
            failure_threshold: 1,
            retry_interval_ms: 10,
            ..Default::default()
        }));
        ctrl.record_sql_failure();
        assert_eq!(ctrl.current_backend(), Backend::Fallback);

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let ctrl_clone = ctrl.clone();
        let handle = tokio::spawn(async move {
            ctrl_clone
                .run_reconnect_loop(|| async { true }, cancel_clone)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(ctrl.current_backend(), Backend::Primary);
    }

    #[tokio::test]
    async fn reconnect_loop_stops_after_max_retries() {
        let ctrl = Arc::new(FallbackController::new(FallbackConfig {
            failure_threshold: 1,
            retry_interval_ms: 5,
            max_retries: 2,
            ..Default::default()
        }));
        ctrl.record_sql_failure();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let ctrl_clone = ctrl.clone();
        let handle = tokio::spawn(async move {
            ctrl_clone
                .run_reconnect_loop(|| async { false }, cancel_clone)
                .await;
        });

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("loop should stop on its own after max_retries")
            .unwrap();
        cancel.cancel();

        assert_eq!(ctrl.current_backend(), Backend::Fallback);
    }
}
