//! Tenant credential record — pure data plus derived helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored usage window: tokens consumed since `window_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    /// When this window began accumulating usage.
    pub window_start: DateTime<Utc>,
    /// Tokens consumed since `window_start`.
    pub tokens_used: u64,
}

/// Fixed 5-minute bucket used by the optional amortised rolling-window cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start, floored to `bucket_size_ms`.
    pub timestamp: DateTime<Utc>,
    /// Tokens attributed to this bucket.
    pub tokens: u64,
}

/// Optional in-record optimisation: 60 fixed 5-minute buckets spanning the
/// 5-hour rolling window, with a maintained running total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingWindowCache {
    /// Fixed-size bucket slots.
    pub buckets: Vec<Bucket>,
    /// Sum of all non-expired buckets. Kept in sync by the limiter.
    pub running_total: u64,
    /// When `running_total` was last recomputed.
    pub last_updated: DateTime<Utc>,
    /// Rolling window span in milliseconds (5 hours).
    pub window_duration_ms: u64,
    /// Bucket resolution in milliseconds (5 minutes).
    pub bucket_size_ms: u64,
}

pub const WINDOW_DURATION_MS: u64 = 5 * 60 * 60 * 1000;
pub const BUCKET_SIZE_MS: u64 = 5 * 60 * 1000;
pub const BUCKET_COUNT: usize = (WINDOW_DURATION_MS / BUCKET_SIZE_MS) as usize;

impl RollingWindowCache {
    /// A freshly initialised, empty cache.
    #[must_use]
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            buckets: Vec::with_capacity(BUCKET_COUNT),
            running_total: 0,
            last_updated: now,
            window_duration_ms: WINDOW_DURATION_MS,
            bucket_size_ms: BUCKET_SIZE_MS,
        }
    }
}

/// Chars-per-token heuristic used by [`CredentialRecord::estimate_tokens`].
const CHARS_PER_TOKEN: usize = 4;
/// Fixed overhead charged per message in the estimate.
const PER_MESSAGE_OVERHEAD: u64 = 4;
/// Default ceiling added to the estimate when the request has no explicit
/// `max_tokens` hint.
const DEFAULT_MAX_TOKENS_CEILING: u64 = 1024;

/// A chat-completions request, reduced to the fields the estimator needs.
/// Both the OpenAI-compatible and Anthropic-compatible bodies are shaped
/// into this before estimation.
#[derive(Debug, Clone)]
pub struct RequestShape {
    /// Concatenated character count across all message contents.
    pub message_chars: usize,
    /// Number of messages in the request.
    pub message_count: usize,
    /// Explicit `max_tokens` hint, if the client supplied one.
    pub max_tokens: Option<u64>,
}

/// Tenant credential (primary entity). Created once by the admin surface,
/// mutated only by the meter on each successful request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Opaque string id — the bearer key presented by clients.
    pub key: String,
    /// Human-readable name.
    pub name: String,
    /// Optional allow-listed model; `None` permits any model.
    pub model: Option<String>,
    /// Rolling token budget per 5-hour window.
    pub token_limit_per_5h: u64,
    /// Absolute expiry; the record is unusable once `now >= expiry`.
    pub expiry: DateTime<Utc>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-used timestamp, updated on every successful request.
    pub last_used: Option<DateTime<Utc>>,
    /// Monotonically increasing lifetime token count.
    pub total_lifetime_tokens: u64,
    /// Usage windows within (or recently outside) the rolling window.
    pub usage_windows: Vec<UsageWindow>,
    /// Optional amortised bucket cache; absent means the limiter falls
    /// back to scanning `usage_windows` directly.
    pub rolling_window_cache: Option<RollingWindowCache>,
    /// Admin identity that issued this key, if known. Provenance only;
    /// the request path never reads it.
    pub created_by: Option<String>,
}

/// Pluggable admission-time cost estimator. The char/4 heuristic below
/// is the only implementation that ships; the trait exists so a
/// tokeniser-backed estimator could be swapped in at the admission call
/// site without touching callers.
pub trait TokenEstimator {
    /// Estimate the upstream token cost of `request`. Not authoritative
    /// — the meter's observed usage always wins at charge time.
    fn estimate(&self, request: &RequestShape) -> u64;
}

/// The default, and currently only, [`TokenEstimator`]: a character
/// count divided by a fixed chars-per-token ratio, plus a fixed
/// per-message overhead and either the caller's `max_tokens` hint or a
/// conservative ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, request: &RequestShape) -> u64 {
        let chars_cost = (request.message_chars / CHARS_PER_TOKEN) as u64;
        let overhead = PER_MESSAGE_OVERHEAD * request.message_count as u64;
        let ceiling = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS_CEILING);
        chars_cost + overhead + ceiling
    }
}

impl CredentialRecord {
    /// True iff this record is past its absolute expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Estimate the upstream token cost of `request` for admission
    /// purposes, via [`HeuristicEstimator`]. Not authoritative — the
    /// meter's observed usage always wins at charge time.
    #[must_use]
    pub fn estimate_tokens(request: &RequestShape) -> u64 {
        HeuristicEstimator.estimate(request)
    }

    /// Whether `model` is permitted by this credential's allow-list.
    #[must_use]
    pub fn allows_model(&self, model: &str) -> bool {
        match &self.model {
            Some(allowed) => allowed == model,
            None => true,
        }
    }
}

/// Derived, read-only view returned by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialStats {
    /// Tokens already consumed in the current (non-expired) window set.
    pub tokens_used_in_current_window: u64,
    /// Remaining budget before the next admission is rejected.
    pub remaining_tokens: u64,
    /// Whether the credential has passed its absolute expiry.
    pub is_expired: bool,
    /// Lifetime token count, never decreases.
    pub total_lifetime_tokens: u64,
}
