// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure policy applied when the rate limiter denies a write.
//!
//! Two modes:
//! - **Reject**: fail immediately with [`IngestError::RateLimited`] (HTTP 429)
//! - **Wait**: poll the limiter until a token frees up or `max_wait` elapses
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use message_ingest::BackpressurePolicy;
//!
//! let policy = BackpressurePolicy::default();
//! assert_eq!(policy.max_wait(), Duration::from_secs(5));
//!
//! let policy: BackpressurePolicy = serde_json::from_str(r#"{"mode":"reject"}"#).unwrap();
//! assert_eq!(policy, BackpressurePolicy::Reject);
//! assert_eq!(policy.max_wait(), Duration::ZERO);
//! ```

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::IngestError;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Deny immediately
    Reject,
    /// Bounded wait-and-retry
    Wait {
        #[serde(default = "default_max_wait_ms")]
        max_wait_ms: u64,
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_max_wait_ms() -> u64 { 5000 }
fn default_poll_interval_ms() -> u64 { 50 }

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::Wait {
            max_wait_ms: default_max_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BackpressurePolicy {
    #[must_use]
    pub fn wait(max_wait: Duration, poll_interval: Duration) -> Self {
        Self::Wait {
            max_wait_ms: max_wait.as_millis() as u64,
            poll_interval_ms: poll_interval.as_millis() as u64,
        }
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        match self {
            Self::Reject => Duration::ZERO,
            Self::Wait { max_wait_ms, .. } => Duration::from_millis(*max_wait_ms),
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if let Self::Wait { poll_interval_ms: 0, .. } = self {
            return Err(IngestError::InvalidConfiguration(
                "backpressure poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Take one token from `limiter`, applying this policy on denial.
    ///
    /// Returns how long the caller was held back. `cancel` aborts a wait
    /// with [`IngestError::Cancelled`].
    pub async fn acquire(
        &self,
        limiter: &RateLimiter,
        cancel: &CancellationToken,
    ) -> Result<Duration, IngestError> {
        if limiter.try_consume() {
            return Ok(Duration::ZERO);
        }

        let (max_wait, poll) = match *self {
            Self::Reject => {
                debug!("Write rejected by rate limiter");
                return Err(IngestError::RateLimited { waited: Duration::ZERO });
            }
            Self::Wait { max_wait_ms, poll_interval_ms } => (
                Duration::from_millis(max_wait_ms),
                Duration::from_millis(poll_interval_ms.max(1)),
            ),
        };

        let started = Instant::now();
        loop {
            let waited = started.elapsed();
            if waited >= max_wait {
                debug!(waited_ms = waited.as_millis() as u64, "Gave up waiting for a rate-limit token");
                return Err(IngestError::RateLimited { waited });
            }

            let nap = poll.min(max_wait - waited);
            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }

            if limiter.try_consume() {
                let waited = started.elapsed();
                crate::metrics::record_backpressure_wait(waited);
                return Ok(waited);
            }
        }
    }
}

/// Suggested HTTP status code for an ingestion error.
#[must_use]
pub fn http_status_code(err: &IngestError) -> u16 {
    match err {
        IngestError::RateLimited { .. } => 429,
        IngestError::Validation(_) => 400,
        IngestError::NotRunning | IngestError::Cancelled => 503,
        IngestError::Storage(e) if e.is_transient() => 503,
        IngestError::InvalidConfiguration(_) | IngestError::Storage(_) => 500,
    }
}

/// Suggested Retry-After header value (seconds): time until the limiter
/// accrues one whole token, rounded up.
#[must_use]
pub fn retry_after_secs(limiter: &RateLimiter) -> u64 {
    let deficit = 1.0 - limiter.available_tokens();
    if deficit <= 0.0 {
        return 0;
    }
    (deficit / limiter.config().refill_rate).ceil().max(1.0) as u64
}
