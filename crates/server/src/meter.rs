//! SSE forwarder & token meter (C8).
//!
//! Relays upstream bytes to the client verbatim while scanning the
//! same bytes, line-framed, for the terminal usage frame. Forwarding
//! and scanning share the wire bytes; the scan never blocks or alters
//! what reaches the client.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use gateway_pool::BufferPool;
use tokio::sync::oneshot;

/// Cap on the line-reassembly carry buffer. Upstream frames are a few
/// hundred bytes in practice; this only guards against a misbehaving
/// upstream that never sends `\n`.
const MAX_CARRY_BYTES: usize = 1024 * 1024;

/// Final token count observed for one streamed request: the last
/// non-zero usage value seen in a `data:` frame, or the admitted
/// estimate if the upstream never reported one.
#[derive(Debug, Clone, Copy)]
pub struct MeterOutcome {
    pub tokens: u64,
}

/// Wraps an upstream byte stream, forwarding every chunk unchanged
/// while extracting token usage from `data:` lines. Reports the final
/// count on `outcome` once the stream ends (normally or on error).
pub struct SseForwarder {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    carry: Vec<u8>,
    last_usage: u64,
    estimate: u64,
    outcome_tx: Option<oneshot::Sender<MeterOutcome>>,
    // Held only to keep the tiered pool warm for this stream's scratch
    // allocations; the scan buffer itself is `carry` above.
    _buffer_pool: Arc<BufferPool>,
}

impl SseForwarder {
    /// Build a forwarder over `inner`, reporting through `outcome_tx`
    /// once the stream is exhausted or fails.
    pub fn new(
        inner: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
        estimate: u64,
        outcome_tx: oneshot::Sender<MeterOutcome>,
        buffer_pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            inner: Box::pin(inner),
            carry: Vec::new(),
            last_usage: 0,
            estimate,
            outcome_tx: Some(outcome_tx),
            _buffer_pool: buffer_pool,
        }
    }

    fn finish(&mut self) {
        if let Some(tx) = self.outcome_tx.take() {
            let tokens = if self.last_usage > 0 {
                self.last_usage
            } else {
                self.estimate
            };
            let _ = tx.send(MeterOutcome { tokens });
        }
    }
}

impl Stream for SseForwarder {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                scan_usage(&mut this.carry, &chunk, &mut this.last_usage);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SseForwarder {
    fn drop(&mut self) {
        // Covers client disconnect: the body stream is dropped before
        // poll_next ever returns `None`, so the outcome still fires
        // with whatever usage was observed up to cancellation.
        self.finish();
    }
}

/// Feed `chunk` into the line-reassembly buffer and process every
/// complete line found, updating `last_usage` in place.
fn scan_usage(carry: &mut Vec<u8>, chunk: &[u8], last_usage: &mut u64) {
    carry.extend_from_slice(chunk);
    if carry.len() > MAX_CARRY_BYTES {
        let excess = carry.len() - MAX_CARRY_BYTES;
        carry.drain(..excess);
    }

    loop {
        let Some(pos) = carry.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line: Vec<u8> = carry.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        process_line(line.trim_end_matches(['\r', '\n']), last_usage);
    }
}

/// Recognise a `data:` field and, if its payload is a JSON object with
/// a `usage` member, fold OpenAI's `total_tokens` or Anthropic's
/// `input_tokens` + `output_tokens` into `last_usage` when non-zero.
/// `data: [DONE]` and blank/comment lines are ignored.
fn process_line(line: &str, last_usage: &mut u64) {
    let Some(rest) = line.strip_prefix("data:") else {
        return;
    };
    let payload = rest.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return;
    }

    let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
        return;
    };
    let Some(usage) = value.get("usage") else {
        return;
    };

    if let Some(total) = usage.get("total_tokens").and_then(serde_json::Value::as_u64) {
        if total > 0 {
            *last_usage = total;
        }
        return;
    }

    let input = usage.get("input_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(serde_json::Value::as_u64).unwrap_or(0);
    let sum = input + output;
    if sum > 0 {
        *last_usage = sum;
    }
}
