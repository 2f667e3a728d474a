//! Storage fallback control and rolling-window rate limiting.

pub mod fallback;
pub mod limiter;

pub use fallback::{Backend, FallbackConfig, FallbackController};
pub use limiter::{AdmitDecision, AdmitToken, RateLimiter};
