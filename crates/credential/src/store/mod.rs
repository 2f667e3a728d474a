//! Uniform storage abstraction over the file and SQL backends.

pub mod file;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_core::Result;

use crate::record::{CredentialRecord, CredentialStats};

/// Capability set exposed uniformly by both storage backends.
///
/// Implementations own persistence; callers (the cache, the fallback
/// controller) hold borrowed snapshots only.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Idempotent: prepares the backend (opens the DB, ensures the file
    /// exists). Returns `Unavailable` if the backend cannot be reached.
    async fn initialize(&self) -> Result<()>;

    /// Snapshot read. `Ok(None)` means the key does not exist.
    async fn find(&self, key: &str) -> Result<Option<CredentialRecord>>;

    /// Atomically fold `tokens_used` into the record's usage windows and
    /// bump `total_lifetime_tokens`. `model` is informational only
    /// (credential records aren't tokenizer-specific).
    ///
    /// Returns `Unavailable` if the backend is unreachable, or
    /// `InternalError` if the key does not exist (the dispatcher only
    /// calls this for keys it already resolved via `find`).
    async fn update_usage(
        &self,
        key: &str,
        tokens_used: i64,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Derived view over a record's current usage.
    async fn stats(&self, key: &str) -> Result<Option<CredentialStats>>;
}

/// Purge windows older than the rolling window and fold in a new usage
/// delta, shared by both backends so window semantics never drift
/// between them.
///
/// `tokens_used` may be negative: the meter calls this with
/// `actual - estimate`, crediting the tenant when the estimate
/// overshot.
pub(crate) fn apply_usage_delta(
    windows: &mut Vec<crate::record::UsageWindow>,
    tokens_used: i64,
    now: DateTime<Utc>,
) {
    let window_span = chrono::Duration::hours(5);
    windows.retain(|w| w.window_start >= now - window_span);

    match windows.last_mut() {
        Some(last) if last.window_start >= now - window_span => {
            last.tokens_used = apply_delta(last.tokens_used, tokens_used);
        }
        _ => {
            windows.push(crate::record::UsageWindow {
                window_start: now,
                tokens_used: apply_delta(0, tokens_used),
            });
        }
    }
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
    use crate::record::UsageWindow;

    #[test]
    fn apply_usage_delta_purges_stale_windows() {
        let now = Utc::now();
        let mut windows = vec![UsageWindow {
            window_start: now - chrono::Duration::hours(6),
            tokens_used: 12_000,
        }];
        apply_usage_delta(&mut windows, 1_000, now);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].tokens_used, 1_000);
    }

    #[test]
    fn apply_usage_delta_folds_into_most_recent_window() {
        let now = Utc::now();
        let mut windows = vec![UsageWindow {
            window_start: now - chrono::Duration::hours(1),
            tokens_used: 3_000,
        }];
        apply_usage_delta(&mut windows, 1_000, now);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].tokens_used, 4_000);
    }

    #[test]
    fn apply_usage_delta_credits_on_negative_delta() {
        let now = Utc::now();
        let mut windows = vec![UsageWindow {
            window_start: now,
            tokens_used: 1_053,
        }];
        apply_usage_delta(&mut windows, -211, now);
        assert_eq!(windows[0].tokens_used, 842);
    }
}
