//! Request dispatcher (C7): the per-request pipeline auth → admit →
//! forward → meter → release.
//!
//! ```text
//! Received → Authenticated → Admitted → Forwarding → Metered → Responded
//!                  │              │             │
//!                  ▼              ▼             ▼
//!              Unauthorized   RateLimited   UpstreamError
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use gateway_core::{Error, Result};
use gateway_credential::{CredentialRecord, RequestShape};
use gateway_resilience::{AdmitDecision, AdmitToken, RateLimiter};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::meter::SseForwarder;
use crate::state::GatewayState;

const NON_STREAMING_DEADLINE: Duration = Duration::from_secs(30);
const STREAMING_DEADLINE: Duration = Duration::from_secs(300);
const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Extract the bearer credential from `Authorization: Bearer <key>`
/// (case-insensitive scheme) or `x-api-key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let mut parts = value.splitn(2, ' ');
        let scheme = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default().trim();
        if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Reduce a parsed OpenAI- or Anthropic-compatible request body to the
/// fields the estimator and the forwarder need.
fn request_shape(body: &Value) -> (RequestShape, bool) {
    let mut message_chars = 0usize;
    let mut message_count = 0usize;

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        message_count = messages.len();
        for message in messages {
            message_chars += content_chars(message.get("content"));
        }
    }
    // Anthropic carries the system prompt outside `messages`; its
    // chars count toward the estimate even though it isn't a discrete
    // message for the per-message overhead.
    if let Some(system) = body.get("system") {
        message_chars += content_chars(Some(system));
    }

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let max_tokens = body.get("max_tokens").and_then(Value::as_u64);

    (
        RequestShape {
            message_chars,
            message_count,
            max_tokens,
        },
        stream,
    )
}

fn content_chars(content: Option<&Value>) -> usize {
    match content {
        Some(Value::String(s)) => s.chars().count(),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| part.get("text").and_then(Value::as_str).map_or(0, |s| s.chars().count()))
            .sum(),
        _ => 0,
    }
}

/// Scan a buffered (non-streaming) JSON response body for the
/// authoritative usage total. OpenAI reports `usage.total_tokens`;
/// Anthropic reports `usage.input_tokens` + `usage.output_tokens`.
fn extract_buffered_usage(body: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
        return Some(total);
    }
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some(input + output)
}

/// Run the full request pipeline for one inbound call to `path`
/// (one of the proxy routes), returning the response to mirror back
/// to the client.
#[tracing::instrument(skip(state, headers, body), fields(path))]
pub async fn dispatch(
    state: Arc<GatewayState>,
    path: &'static str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    // --- Authenticate -----------------------------------------------
    let key = extract_api_key(&headers)
        .ok_or_else(|| Error::Unauthorized { reason: "missing bearer credential".into() })?;

    let credential = state
        .find_credential(&key)
        .await?
        .ok_or_else(|| Error::Unauthorized { reason: "unknown credential".into() })?;

    let now = gateway_core::now();
    if credential.is_expired(now) {
        return Err(Error::Unauthorized { reason: "credential expired".into() });
    }

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest { reason: format!("invalid JSON body: {e}") })?;

    let model = parsed.get("model").and_then(Value::as_str).map(str::to_string);
    if let Some(model) = &model {
        if !credential.allows_model(model) {
            return Err(Error::Unauthorized {
                reason: format!("model '{model}' not permitted for this credential"),
            });
        }
    }

    let (shape, streaming) = request_shape(&parsed);
    let estimate = CredentialRecord::estimate_tokens(&shape);

    // --- Admit --------------------------------------------------------
    let lock = state.limiter.lock_key(&credential.key).await;
    let token = match RateLimiter::admit(&credential, estimate, now) {
        AdmitDecision::Admitted(token) => token,
        AdmitDecision::RateLimited { retry_after_ms } => {
            drop(lock);
            return Err(Error::RateLimited { retry_after_ms });
        }
    };

    // --- Acquire & forward ---------------------------------------------
    let guard = match state.pool.acquire().await {
        Ok(guard) => guard,
        Err(e) => {
            charge_zero(&state, &token).await;
            drop(lock);
            return Err(e);
        }
    };

    let deadline = if streaming { STREAMING_DEADLINE } else { NON_STREAMING_DEADLINE };
    let mut url = guard.base_url().clone();
    url.set_path(path);

    let send = guard
        .client()
        .request(Method::POST, url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body);

    let outcome = tokio::time::timeout(deadline, send.send()).await;
    guard.record_request();

    let response = match outcome {
        Err(_elapsed) => {
            charge_zero(&state, &token).await;
            drop(lock);
            state.pool.discard(guard);
            return Err(Error::UpstreamError { reason: "upstream request timed out".into(), status: None });
        }
        Ok(Err(e)) => {
            charge_zero(&state, &token).await;
            drop(lock);
            state.pool.discard(guard);
            return Err(Error::UpstreamError { reason: format!("transport error: {e}"), status: None });
        }
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    if !status.is_success() {
        charge_zero(&state, &token).await;
        drop(lock);
        let body = read_bounded_body(response).await.unwrap_or_default();
        warn!(%status, "upstream returned a non-success response");
        return Ok(mirror_response(status, content_type, Body::from(body)));
    }

    if streaming && content_type.to_str().unwrap_or_default().contains("event-stream") {
        return Ok(forward_streaming(state, token, lock, guard, status, content_type, response));
    }

    let body_bytes = match read_bounded_body(response).await {
        Ok(bytes) => bytes,
        Err(e) => {
            charge_zero(&state, &token).await;
            drop(lock);
            state.pool.discard(guard);
            return Err(e);
        }
    };

    let actual = extract_buffered_usage(&body_bytes).unwrap_or(token.estimated_tokens);
    let delta = RateLimiter::charge_delta(&token, actual);
    state.update_usage(&credential.key, delta, model.as_deref()).await?;
    drop(lock);

    info!(tokens = actual, "request metered");
    Ok(mirror_response(status, content_type, Body::from(body_bytes)))
}

/// Charge zero against an admitted-but-not-fulfilled reservation,
/// crediting the tenant the full estimate back. Best-effort: a
/// failure here is logged, not propagated, since the caller is
/// already unwinding with its own error.
async fn charge_zero(state: &GatewayState, token: &AdmitToken) {
    let delta = RateLimiter::charge_delta(token, 0);
    if let Err(e) = state.update_usage(&token.credential_key, delta, None).await {
        warn!(error = %e, "failed to release admission reservation after a post-admit failure");
    }
}

async fn read_bounded_body(response: reqwest::Response) -> Result<Vec<u8>> {
    use futures::StreamExt;
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::UpstreamError { reason: format!("reading upstream body: {e}"), status: None })?;
        if buf.len() + chunk.len() > MAX_BUFFERED_BODY {
            return Err(Error::BadRequest { reason: "upstream response exceeded 64 MiB buffer bound".into() });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

fn mirror_response(status: StatusCode, content_type: HeaderValue, body: Body) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .expect("status and content-type are always valid for a response")
}

/// Build the streaming response: an [`SseForwarder`] relays bytes to
/// the client while scanning for usage; a background task awaits its
/// outcome and performs the charge + storage write once the stream
/// ends, holding the per-key lock and the pool guard alive until then.
#[tracing::instrument(skip(state, lock, guard, status, content_type, response), fields(credential_key = %token.credential_key))]
fn forward_streaming(
    state: Arc<GatewayState>,
    token: AdmitToken,
    lock: tokio::sync::OwnedMutexGuard<()>,
    guard: gateway_pool::Guard<gateway_pool::UpstreamConnection>,
    status: StatusCode,
    content_type: HeaderValue,
    response: reqwest::Response,
) -> Response {
    let (tx, rx) = oneshot::channel();
    let forwarder = SseForwarder::new(response.bytes_stream(), token.estimated_tokens, tx, state.buffer_pool.clone());

    tokio::spawn(async move {
        let _guard = guard;
        let _lock = lock;
        let outcome = rx.await.unwrap_or(crate::meter::MeterOutcome { tokens: token.estimated_tokens });
        let delta = RateLimiter::charge_delta(&token, outcome.tokens);
        if let Err(e) = state.update_usage(&token.credential_key, delta, None).await {
            warn!(error = %e, "failed to record streamed usage");
        } else {
            info!(tokens = outcome.tokens, "streaming request metered");
        }
    });

    mirror_response(status, content_type, Body::from_stream(forwarder))
}
