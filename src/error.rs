//! Gateway error taxonomy.
//!
//! Attempt-level upstream failures never surface to clients while any
//! (credential, model) pair remains untried; they become exclusions
//! inside the fallback loop. Only exhaustion and store outages terminate
//! a request.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The fallback loop ran out of viable (credential, model) pairs.
    /// Surfaced to clients as HTTP 429.
    #[error("all credentials exhausted after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        blocked_models: Vec<String>,
        last_error: Option<String>,
    },

    /// The shared store is unreachable. Fatal for this request,
    /// recoverable on retry. Surfaced as HTTP 503.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A credential failed validation during onboarding.
    #[error("invalid credential for {label}: {reason}")]
    InvalidCredential { label: String, reason: String },
}
