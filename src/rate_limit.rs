// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Token-bucket rate limiter guarding every store write path.
//!
//! The bucket starts full at `max_tokens`, refills at `refill_rate` tokens per
//! second and may accumulate up to `burst_capacity`. Consume and refill share
//! one mutex, so no refill is ever lost to a concurrent consume.
//!
//! A background task owned by the limiter refills on a fixed period; it is
//! started by [`RateLimiter::new`] and stopped by [`RateLimiter::dispose`] or
//! on drop. Consumption also credits elapsed time before deciding, so a
//! caller never waits on the task's tick.
//!
//! # Example
//!
//! ```
//! use message_ingest::rate_limit::{RateLimiterConfig, TokenBucket};
//!
//! let config = RateLimiterConfig::new(10.0, 1.0, 10.0);
//! let mut bucket = TokenBucket::new(&config);
//!
//! for _ in 0..10 {
//!     assert!(bucket.try_take());
//! }
//! assert!(!bucket.try_take());
//!
//! bucket.refill(1.0); // one second later
//! assert!(bucket.try_take());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::IngestError;

/// Token-bucket parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterConfig {
    /// Steady-state capacity; the bucket starts with this many tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: f64,
    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Hard ceiling on accumulated tokens (must be >= `max_tokens`)
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: f64,
    /// Background refill period
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

fn default_max_tokens() -> f64 { 100.0 }
fn default_refill_rate() -> f64 { 10.0 }
fn default_burst_capacity() -> f64 { 200.0 }
fn default_refill_interval_ms() -> u64 { 1000 }

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate: default_refill_rate(),
            burst_capacity: default_burst_capacity(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

impl RateLimiterConfig {
    #[must_use]
    pub fn new(max_tokens: f64, refill_rate: f64, burst_capacity: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            burst_capacity,
            refill_interval_ms: default_refill_interval_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if !(self.max_tokens > 0.0) || !self.max_tokens.is_finite() {
            return Err(IngestError::InvalidConfiguration(format!(
                "max_tokens must be positive, got {}",
                self.max_tokens
            )));
        }
        if !(self.refill_rate > 0.0) || !self.refill_rate.is_finite() {
            return Err(IngestError::InvalidConfiguration(format!(
                "refill_rate must be positive, got {}",
                self.refill_rate
            )));
        }
        if !(self.burst_capacity >= self.max_tokens) || !self.burst_capacity.is_finite() {
            return Err(IngestError::InvalidConfiguration(format!(
                "burst_capacity ({}) must be >= max_tokens ({})",
                self.burst_capacity, self.max_tokens
            )));
        }
        if self.refill_interval_ms == 0 {
            return Err(IngestError::InvalidConfiguration(
                "refill_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        Duration::from_millis(self.refill_interval_ms)
    }
}

/// Bare bucket arithmetic with no clock or locking.
///
/// Invariant: `0 <= tokens <= burst_capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    refill_rate: f64,
    burst_capacity: f64,
}

impl TokenBucket {
    #[must_use]
    pub fn new(config: &RateLimiterConfig) -> Self {
        Self {
            tokens: config.max_tokens.min(config.burst_capacity),
            refill_rate: config.refill_rate,
            burst_capacity: config.burst_capacity,
        }
    }

    #[must_use]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Credit `elapsed_secs` worth of tokens, clamped to the burst capacity.
    pub fn refill(&mut self, elapsed_secs: f64) {
        if elapsed_secs > 0.0 {
            self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.burst_capacity);
        }
    }

    /// Take one token if a whole one is available.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct BucketState {
    bucket: TokenBucket,
    last_refill: Instant,
}

impl BucketState {
    fn refill_now(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.bucket.refill(elapsed.as_secs_f64());
        self.last_refill = now;
    }
}

/// Process-local, concurrency-safe token bucket.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<BucketState>>,
    cancel: CancellationToken,
    refill_task: Mutex<Option<JoinHandle<()>>>,
    denied: AtomicU64,
}

impl RateLimiter {
    /// Validate `config` and start the periodic refill task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(config: RateLimiterConfig) -> Result<Self, IngestError> {
        let limiter = Self::without_refill_task(config)?;
        let handle = tokio::spawn(refill_loop(
            Arc::clone(&limiter.state),
            limiter.config.refill_interval(),
            limiter.cancel.clone(),
        ));
        *limiter.refill_task.lock() = Some(handle);
        info!(
            max_tokens = limiter.config.max_tokens,
            refill_rate = limiter.config.refill_rate,
            burst_capacity = limiter.config.burst_capacity,
            "Rate limiter started"
        );
        Ok(limiter)
    }

    /// Validate `config` without spawning a refill task. Tokens are still
    /// credited lazily on every consume.
    pub fn without_refill_task(config: RateLimiterConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let state = BucketState {
            bucket: TokenBucket::new(&config),
            last_refill: Instant::now(),
        };
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
            refill_task: Mutex::new(None),
            denied: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Take one token if available. Never blocks on anything but the bucket
    /// mutex.
    pub fn try_consume(&self) -> bool {
        let mut state = self.state.lock();
        state.refill_now();
        let granted = state.bucket.try_take();
        let remaining = state.bucket.tokens();
        drop(state);

        crate::metrics::set_tokens_available(remaining);
        if !granted {
            self.denied.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_rate_limited();
        }
        granted
    }

    /// Whether a consume right now would be denied. Does not take a token.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.available_tokens() < 1.0
    }

    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill_now();
        state.bucket.tokens()
    }

    /// Total denied consumes since construction.
    #[must_use]
    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Apply a refill now, same as one tick of the background task.
    pub fn refill(&self) {
        self.state.lock().refill_now();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the refill task. Idempotent.
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.refill_task.lock().take() {
            handle.abort();
        }
        debug!("Rate limiter disposed");
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn refill_loop(state: Arc<Mutex<BucketState>>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let tokens = {
                    let mut state = state.lock();
                    state.refill_now();
                    state.bucket.tokens()
                };
                crate::metrics::set_tokens_available(tokens);
            }
        }
    }
}
