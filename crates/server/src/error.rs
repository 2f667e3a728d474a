//! Maps `gateway_core::Error` onto HTTP responses for the axum layer.

use axum::Json;
use axum::response::{IntoResponse, Response};
use gateway_core::Error;
use serde_json::json;

/// Newtype so the crate can implement `IntoResponse` for the shared
/// error type without an orphan-rule violation.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let body = Json(json!({
            "error": {
                "message": self.0.to_string(),
                "type": error_type(&self.0),
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(retry_after_ms) = self.0.retry_after_ms() {
            let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn error_type(err: &Error) -> &'static str {
    match err {
        Error::BadRequest { .. } => "bad_request",
        Error::Unauthorized { .. } => "unauthorized",
        Error::RateLimited { .. } => "rate_limited",
        Error::Unavailable { .. } => "unavailable",
        Error::UpstreamError { .. } => "upstream_error",
        Error::InternalError { .. } => "internal_error",
    }
}
