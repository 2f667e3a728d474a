use thiserror::Error;

/// Result type used across the gateway's request path.
pub type Result<T> = std::result::Result<T, Error>;

/// The gateway's error taxonomy (see the error handling design).
///
/// Each variant maps to exactly one client-facing HTTP status via
/// [`Error::status_code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed body, unsupported model, or request too large.
    #[error("bad request: {reason}")]
    BadRequest {
        /// Human-readable reason.
        reason: String,
    },

    /// Missing, invalid, or expired credential.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Human-readable reason.
        reason: String,
    },

    /// Admission was denied by the rate limiter.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds the client should wait before retrying.
        retry_after_ms: u64,
    },

    /// A backend or the connection pool is unreachable.
    #[error("unavailable: {reason}")]
    Unavailable {
        /// Human-readable reason.
        reason: String,
        /// Whether a retry might succeed.
        retryable: bool,
    },

    /// The upstream provider returned a non-2xx response or a transport error.
    #[error("upstream error: {reason}")]
    UpstreamError {
        /// Human-readable reason.
        reason: String,
        /// Upstream HTTP status, when one was received.
        status: Option<u16>,
    },

    /// An invariant was violated; should not happen in correct operation.
    #[error("internal error: {reason}")]
    InternalError {
        /// Human-readable reason.
        reason: String,
    },
}

impl Error {
    /// The HTTP status code this error should be reported to a client as.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            Self::BadRequest { .. } => http::StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => http::StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => http::StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable { .. } => http::StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError { status, .. } => status
                .and_then(|s| http::StatusCode::from_u16(s).ok())
                .unwrap_or(http::StatusCode::BAD_GATEWAY),
            Self::InternalError { .. } => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may safely retry this error locally.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable { retryable, .. } => *retryable,
            Self::RateLimited { .. } => true,
            _ => false,
        }
    }

    /// Milliseconds a client should wait before retrying, if applicable.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Shorthand for an `Unavailable` error marked retryable.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Shorthand for an `InternalError`.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }
}
