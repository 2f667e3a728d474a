//! Shared error taxonomy and small cross-crate helpers for the gateway.

mod error;

pub use error::{Error, Result};

/// Current wall-clock time. Centralised so tests can reason about it
/// without reaching for a mockable clock abstraction.
#[must_use]
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
