// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public error type for ingestion operations.
//!
//! Store-level failures arrive as [`StorageError`] and are wrapped here.
//! Being rate limited is an expected outcome rather than a fault, so it is
//! its own variant that callers can match on and turn into backpressure.

use std::time::Duration;
use thiserror::Error;

use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Bad limiter or engine parameters. Fatal at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Missing or malformed argument. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No token was available within the configured wait.
    #[error("rate limited (waited {waited:?})")]
    RateLimited { waited: Duration },

    /// A cancellation signal stopped the operation before it started.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine has not been started or has been shut down.
    #[error("engine is not running")]
    NotRunning,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
