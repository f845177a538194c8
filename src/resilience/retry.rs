// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use message_ingest::RetryConfig;
//!
//! // Startup: fail fast on a bad connection string
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Commit: a handful of attempts, then mark the staged rows Failed
//! let commit = RetryConfig::batch_write();
//! assert_eq!(commit.max_retries, Some(4));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::time::Duration;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn, info};
use std::future::Future;

use crate::storage::traits::StorageError;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual operations
/// - [`RetryConfig::batch_write()`] - Bounded retry around staged-batch commits
///
/// `max_retries` counts total attempts. `None` retries forever; no preset
/// uses it and the engine config rejects it.
///
/// Deserializes from `{ "max_retries": 3, "initial_delay_ms": 100, ... }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RetrySection")]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::batch_write()
    }
}

/// Config-file shape of [`RetryConfig`]. A missing `max_retries` means the
/// batch-write default, not infinite retry.
#[derive(Debug, Clone, Deserialize)]
struct RetrySection {
    #[serde(default = "default_max_retries")]
    max_retries: usize,
    #[serde(default = "default_initial_delay_ms")]
    initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    max_delay_ms: u64,
    #[serde(default = "default_factor")]
    factor: f64,
}

fn default_max_retries() -> usize { 4 }
fn default_initial_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 2000 }
fn default_factor() -> f64 { 2.0 }

impl From<RetrySection> for RetryConfig {
    fn from(section: RetrySection) -> Self {
        Self {
            max_retries: Some(section.max_retries.max(1)),
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            factor: section.factor.max(1.0),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    /// Use this when opening a store to detect configuration errors quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Bounded retry for transactional batch commits.
    /// Four attempts; after that the caller records the failure on the staged rows.
    #[must_use]
    pub fn batch_write() -> Self {
        Self {
            max_retries: Some(default_max_retries()),
            initial_delay: Duration::from_millis(default_initial_delay_ms()),
            max_delay: Duration::from_millis(default_max_delay_ms()),
            factor: default_factor(),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Retry `operation` on every error until it succeeds or attempts run out.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, operation, |_| true).await
}

/// Retry only [`StorageError::is_transient`] failures; anything else is
/// returned on the first occurrence.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    retry_if(operation_name, config, operation, StorageError::is_transient).await
}

pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    debug!("Operation '{}' failed with non-retryable error: {}", operation_name, err);
                    return Err(err);
                }

                match config.max_retries {
                    Some(max) if attempts >= max => {
                        warn!(
                            "Operation '{}' giving up after {} attempts: {}",
                            operation_name, attempts, err
                        );
                        crate::metrics::record_retry_exhausted(operation_name);
                        return Err(err);
                    }
                    Some(max) => {
                        warn!(
                            "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                            operation_name, attempts, max, err, delay
                        );
                    }
                    None => {
                        warn!(
                            "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                            operation_name, attempts, err, delay
                        );
                    }
                }
                crate::metrics::record_retry(operation_name);

                sleep(delay).await;
                delay = (delay.mul_f64(config.factor)).min(config.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let config = RetryConfig {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        };

        let result: Result<i32, TestError> = retry(
            "test_op",
            &config,
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        ).await;

        assert!(result.is_err());
        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_permanent_error() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), StorageError> = retry_transient(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(StorageError::Backend("no such table".into()))
                }
            },
        ).await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_retries_conflicts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_transient(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StorageError::Conflict("row changed".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_config_from_section() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 2, "initial_delay_ms": 5}"#).unwrap();
        assert_eq!(config.max_retries, Some(2));
        assert_eq!(config.initial_delay, Duration::from_millis(5));
        assert_eq!(config.max_delay, Duration::from_millis(2000));

        let zero: RetryConfig = serde_json::from_str(r#"{"max_retries": 0}"#).unwrap();
        assert_eq!(zero.max_retries, Some(1));
    }

    #[test]
    fn test_retry_config_presets() {
        // Startup config - limited retries, fast-fail
        let startup = RetryConfig::startup();
        assert!(startup.max_retries.is_some());
        assert_eq!(startup.max_retries.unwrap(), 5);

        // Default is bounded
        assert_eq!(RetryConfig::default().max_retries, Some(4));

        // Query config - few retries
        let query = RetryConfig::query();
        assert!(query.max_retries.is_some());
        assert_eq!(query.max_retries.unwrap(), 3);

        // Batch write - bounded
        assert_eq!(RetryConfig::batch_write().max_retries, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_grow_and_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            factor: 2.0,
            max_retries: Some(5),
        };
        let attempts_at = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let start = tokio::time::Instant::now();

        let result: Result<(), TestError> = retry("test_op", &config, || {
            let attempts_at = attempts_at.clone();
            async move {
                attempts_at.lock().push(start.elapsed());
                Err(TestError("down".into()))
            }
        })
        .await;
        assert!(result.is_err());

        let at = attempts_at.lock().clone();
        assert_eq!(at.len(), 5);
        let expected = [100, 200, 300, 300];
        for (gap, want) in at.windows(2).map(|w| w[1] - w[0]).zip(expected) {
            let want = Duration::from_millis(want);
            assert!(gap >= want && gap < want + Duration::from_millis(5), "slept {:?}, want {:?}", gap, want);
        }
    }
}
