//! Rolling-window rate limiter: two-phase admit/charge accounting over a
//! 5-hour window, with an optional amortised bucket cache.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_credential::{Bucket, CredentialRecord, RollingWindowCache, UsageWindow};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

const WINDOW: chrono::Duration = chrono::Duration::hours(5);

/// Transient token passed from `admit` to `charge`, pairing an
/// estimated reservation with the credential it was issued against.
#[derive(Debug, Clone)]
pub struct AdmitToken {
    /// The credential this reservation was admitted against.
    pub credential_key: String,
    /// Estimated token cost reserved at admission time.
    pub estimated_tokens: u64,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone)]
pub enum AdmitDecision {
    /// The request may proceed with this reservation.
    Admitted(AdmitToken),
    /// The request was rejected; retry after the given delay.
    RateLimited {
        /// Milliseconds the client should wait before retrying.
        retry_after_ms: u64,
    },
}

/// Per-credential serialisation and the pure admit/charge computation.
///
/// `admit` and `charge` for the same credential must be totally
/// ordered; [`RateLimiter::lock_key`] gives callers an owned guard to
/// hold across the read-check-write round trip against the storage
/// backend. Different credentials proceed independently — the map
/// shards by key, not by a single global lock.
#[derive(Default)]
pub struct RateLimiter {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RateLimiter {
    /// Construct an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the per-credential serialisation lock. Hold this guard
    /// across `admit`, the subsequent storage write, and `charge` (or
    /// the zero-charge cancellation) for the same key.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Sum of `tokens_used` over windows that have not fallen out of the
    /// rolling 5-hour span as of `now`.
    #[must_use]
    pub fn used_tokens(windows: &[UsageWindow], now: DateTime<Utc>) -> u64 {
        windows
            .iter()
            .filter(|w| w.window_start >= now - WINDOW)
            .map(|w| w.tokens_used)
            .sum()
    }

    /// Decide whether to admit a request estimated at `estimate` tokens
    /// against `record`'s current usage.
    #[must_use]
    #[instrument(skip(record, now), fields(credential_key = %record.key, estimate))]
    pub fn admit(record: &CredentialRecord, estimate: u64, now: DateTime<Utc>) -> AdmitDecision {
        let used = Self::used_tokens(&record.usage_windows, now);
        if used + estimate <= record.token_limit_per_5h {
            return AdmitDecision::Admitted(AdmitToken {
                credential_key: record.key.clone(),
                estimated_tokens: estimate,
                issued_at: now,
            });
        }

        let oldest_start = record
            .usage_windows
            .iter()
            .filter(|w| w.window_start >= now - WINDOW)
            .map(|w| w.window_start)
            .min()
            .unwrap_or(now);
        let retry_at = oldest_start + WINDOW;
        let retry_after_ms = (retry_at - now).num_milliseconds().max(0) as u64;

        AdmitDecision::RateLimited { retry_after_ms }
    }

    /// Net token delta to apply at charge time: `actual - estimate`.
    /// Negative means the estimate overshot and the tenant is credited.
    /// Callers post this delta to the storage backend's `update_usage`.
    #[must_use]
    pub fn charge_delta(token: &AdmitToken, actual_tokens: u64) -> i64 {
        actual_tokens as i64 - token.estimated_tokens as i64
    }
}

/// Keep a [`RollingWindowCache`] consistent with a token delta applied
/// at time `now`: increments (or credits) the bucket for `now`'s slot
/// and purges buckets that have fallen out of the window, maintaining
/// `running_total == sum(non-expired buckets)`.
pub fn sync_bucket_cache(cache: &mut RollingWindowCache, tokens_delta: i64, now: DateTime<Utc>) {
    let bucket_size = chrono::Duration::milliseconds(cache.bucket_size_ms as i64);
    let window = chrono::Duration::milliseconds(cache.window_duration_ms as i64);

    let floored_ms = now.timestamp_millis() - now.timestamp_millis().rem_euclid(cache.bucket_size_ms as i64);
    let bucket_start = DateTime::from_timestamp_millis(floored_ms).unwrap_or(now);

    cache.buckets.retain(|b| b.timestamp >= now - window);

    match cache.buckets.iter_mut().find(|b| b.timestamp == bucket_start) {
        Some(bucket) => {
            bucket.tokens = apply_delta(bucket.tokens, tokens_delta);
        }
        None => {
            cache.buckets.push(Bucket {
                timestamp: bucket_start,
                tokens: apply_delta(0, tokens_delta),
            });
        }
    }

    let _ = bucket_size;
    cache.running_total = cache.buckets.iter().map(|b| b.tokens).sum();
    cache.last_updated = now;
}

fn apply_delta(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn record_with_windows(windows: Vec<UsageWindow>, limit: u64, now: DateTime<Utc>) -> CredentialRecord {
        CredentialRecord {
            key: "sk-a".into(),
            name: "tenant".into(),
            model: None,
            token_limit_per_5h: limit,
            expiry: now + chrono::Duration::days(30),
            created_at: now,
            last_used: None,
            total_lifetime_tokens: 0,
            usage_windows: windows,
            rolling_window_cache: None,
            created_by: None,
        }
    }

    #[test]
    fn cold_admit_succeeds_on_empty_windows() {
        let now = Utc::now();
        let record = record_with_windows(Vec::new(), 10_000, now);
        match RateLimiter::admit(&record, 1_053, now) {
            AdmitDecision::Admitted(token) => assert_eq!(token.estimated_tokens, 1_053),
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn admit_rejects_when_estimate_would_exceed_limit() {
        let now = Utc::now();
        let record = record_with_windows(
            vec![UsageWindow {
                window_start: now - chrono::Duration::hours(1),
                tokens_used: 9_500,
            }],
            10_000,
            now,
        );
        match RateLimiter::admit(&record, 800, now) {
            AdmitDecision::RateLimited { retry_after_ms } => {
                // oldest window is 1h old, so retry_after should be ~4h.
                let expected = chrono::Duration::hours(4).num_milliseconds() as u64;
                let delta = expected.abs_diff(retry_after_ms);
                assert!(delta < 2_000, "retry_after_ms={retry_after_ms}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn admit_ignores_expired_windows() {
        let now = Utc::now();
        let record = record_with_windows(
            vec![
                UsageWindow {
                    window_start: now - chrono::Duration::hours(6),
                    tokens_used: 12_000,
                },
                UsageWindow {
                    window_start: now - chrono::Duration::hours(1),
                    tokens_used: 3_000,
                },
            ],
            10_000,
            now,
        );
        match RateLimiter::admit(&record, 1_000, now) {
            AdmitDecision::Admitted(_) => {}
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn charge_delta_can_be_negative() {
        let token = AdmitToken {
            credential_key: "sk-a".into(),
            estimated_tokens: 1_053,
            issued_at: Utc::now(),
        };
        assert_eq!(RateLimiter::charge_delta(&token, 842), -211);
    }

    #[test]
    fn charge_delta_zero_on_upstream_failure() {
        let token = AdmitToken {
            credential_key: "sk-a".into(),
            estimated_tokens: 500,
            issued_at: Utc::now(),
        };
        assert_eq!(RateLimiter::charge_delta(&token, 0), -500);
    }

    #[tokio::test]
    async fn lock_key_serialises_same_key_allows_parallel_other_keys() {
        let limiter = Arc::new(RateLimiter::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let l1 = limiter.clone();
        let o1 = order.clone();
        let h1 = tokio::spawn(async move {
            let _g = l1.lock_key("sk-a").await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            o1.lock().push(1);
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let l2 = limiter.clone();
        let o2 = order.clone();
        let h2 = tokio::spawn(async move {
            let _g = l2.lock_key("sk-a").await;
            o2.lock().push(2);
        });
        h1.await.unwrap();
        h2.await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn sync_bucket_cache_maintains_running_total_invariant() {
        let now = Utc::now();
        let mut cache = RollingWindowCache::empty(now);
        sync_bucket_cache(&mut cache, 500, now);
        sync_bucket_cache(&mut cache, 300, now);

        let expected: u64 = cache.buckets.iter().map(|b| b.tokens).sum();
        assert_eq!(cache.running_total, expected);
        assert_eq!(cache.running_total, 800);
    }

    #[test]
    fn sync_bucket_cache_purges_expired_buckets() {
        let now = Utc::now();
        let mut cache = RollingWindowCache::empty(now);
        cache.buckets.push(Bucket {
            timestamp: now - chrono::Duration::hours(6),
            tokens: 999,
        });
        sync_bucket_cache(&mut cache, 10, now);

        assert!(cache.buckets.iter().all(|b| b.timestamp >= now - chrono::Duration::hours(5)));
        let expected: u64 = cache.buckets.iter().map(|b| b.tokens).sum();
        assert_eq!(cache.running_total, expected);
    }

    /// Table-driven admission scenarios, one row per spec.md §8
    /// end-to-end scenario plus the §8 overshoot-bound edge case.
    #[rstest]
    #[case::cold_admit(0, 1_053, 10_000, true)]
    #[case::exactly_at_limit(9_500, 500, 10_000, true)]
    #[case::one_over_limit(9_500, 501, 10_000, false)]
    #[case::empty_limit_rejects_any_positive_estimate(0, 1, 0, false)]
    fn admit_decision_table(
        #[case] used_tokens: u64,
        #[case] estimate: u64,
        #[case] limit: u64,
        #[case] expect_admitted: bool,
    ) {
        let now = Utc::now();
        let windows = if used_tokens == 0 {
            Vec::new()
        } else {
            vec![UsageWindow { window_start: now - chrono::Duration::hours(1), tokens_used: used_tokens }]
        };
        let record = record_with_windows(windows, limit, now);
        let admitted = matches!(RateLimiter::admit(&record, estimate, now), AdmitDecision::Admitted(_));
        assert_eq!(admitted, expect_admitted, "used={used_tokens} estimate={estimate} limit={limit}");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// spec.md §8's universal invariant, restricted to the
            /// instant immediately after `admit`: admitting never lets
            /// observed usage exceed `limit + estimate` (the permitted
            /// outstanding-reservation overshoot).
            #[test]
            fn admit_never_overshoots_limit_by_more_than_the_estimate(
                used in 0u64..50_000,
                estimate in 0u64..5_000,
                limit in 0u64..50_000,
            ) {
                let now = Utc::now();
                let windows = vec![UsageWindow { window_start: now - chrono::Duration::minutes(1), tokens_used: used }];
                let record = record_with_windows(windows, limit, now);

                if let AdmitDecision::Admitted(_) = RateLimiter::admit(&record, estimate, now) {
                    prop_assert!(used + estimate <= limit + estimate);
                    prop_assert!(used <= limit);
                }
            }

            /// `charge_delta` composed with `apply_delta` never panics
            /// and never produces a result that undercounts below zero
            /// regardless of how estimate and actual relate.
            #[test]
            fn charge_delta_round_trips_without_underflow(
                estimated in 0u64..100_000,
                actual in 0u64..100_000,
                base in 0u64..100_000,
            ) {
                let token = AdmitToken {
                    credential_key: "sk-prop".into(),
                    estimated_tokens: estimated,
                    issued_at: Utc::now(),
                };
                let delta = RateLimiter::charge_delta(&token, actual);
                prop_assert_eq!(delta, actual as i64 - estimated as i64);
                let applied = apply_delta(base, delta);
                prop_assert!(applied <= base.saturating_add(actual));
            }

            /// The bucket cache's `running_total == sum(buckets)`
            /// invariant (spec.md §8) survives an arbitrary sequence of
            /// charges, including negative (credit) deltas.
            #[test]
            fn sync_bucket_cache_invariant_survives_arbitrary_delta_sequence(
                deltas in prop::collection::vec(-2_000i64..5_000, 1..20),
            ) {
                let now = Utc::now();
                let mut cache = RollingWindowCache::empty(now);
                for delta in deltas {
                    sync_bucket_cache(&mut cache, delta, now);
                }
                let expected: u64 = cache.buckets.iter().map(|b| b.tokens).sum();
                prop_assert_eq!(cache.running_total, expected);
            }
        }
    }
}
