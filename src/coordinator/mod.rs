// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion engine coordinator.
//!
//! The [`IngestEngine`] is the composition point that ties together:
//! - the token-bucket [`RateLimiter`] guarding every write path
//! - the [`StagingPipeline`] (dedup, staging, transactional commit)
//! - the [`SyncCoordinator`] (per-scope checkpointed sync)
//! - one [`IngestStore`] backend (SQL or in-memory)
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust
//! use message_ingest::{EngineState, IngestConfig, IngestEngine, Record, ScopeKey};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), message_ingest::IngestError> {
//! let mut engine = IngestEngine::new(IngestConfig::default())?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! let scope = ScopeKey::new(100, 456);
//! engine.stage_batch(&[Record::new(789, scope, 1, "hello")], true).await?;
//! engine.process_staged_batch(None).await?;
//! assert_eq!(engine.sync_scope(100, 456, None).await?, 1);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{DrainOutcome, EngineState, HealthCheck};

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::rate_limit::RateLimiter;
use crate::staging::StagingPipeline;
use crate::storage::traits::IngestStore;
use crate::sync::SyncCoordinator;

/// Everything that exists only while the engine is started.
pub(super) struct Components {
    pub(super) store: Arc<dyn IngestStore>,
    pub(super) limiter: RateLimiter,
    pub(super) staging: StagingPipeline,
    pub(super) sync: SyncCoordinator,
}

/// Main ingestion coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; once started, share it behind an `Arc` and
/// call any operation concurrently.
pub struct IngestEngine {
    pub(super) config: IngestConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Store handed in before start, used instead of connecting
    pub(super) injected_store: Option<Arc<dyn IngestStore>>,

    pub(super) components: Option<Components>,

    /// Cancelled on shutdown; aborts callers waiting for a token
    pub(super) shutdown: CancellationToken,
}

impl IngestEngine {
    /// Create a new engine after validating `config`.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the store and transition to `Running`.
    pub fn new(config: IngestConfig) -> Result<Self, IngestError> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            injected_store: None,
            components: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Create an engine over an existing store. `config.sql_url` is ignored.
    pub fn with_store(config: IngestConfig, store: Arc<dyn IngestStore>) -> Result<Self, IngestError> {
        let mut engine = Self::new(config)?;
        engine.injected_store = Some(store);
        Ok(engine)
    }

    #[must_use]
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is accepting requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// The open store, once started.
    #[must_use]
    pub fn store(&self) -> Option<Arc<dyn IngestStore>> {
        self.components.as_ref().map(|c| c.store.clone())
    }

    pub(super) fn running(&self) -> Result<&Components, IngestError> {
        match (&self.components, self.state()) {
            (Some(components), EngineState::Running) => Ok(components),
            _ => Err(IngestError::NotRunning),
        }
    }

    /// Whether a write right now would be held back. Never takes a token.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.components
            .as_ref()
            .is_some_and(|c| c.limiter.is_rate_limited())
    }

    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        self.components
            .as_ref()
            .map_or(0.0, |c| c.limiter.available_tokens())
    }

    /// Collect engine state and check the store.
    ///
    /// The store check is a staging-stats query, so it exercises a real read
    /// against the backend.
    pub async fn health(&self) -> HealthCheck {
        let state = self.state();
        let ready = state == EngineState::Running;

        let Some(components) = self.components.as_ref() else {
            return HealthCheck {
                state,
                ready,
                tokens_available: 0.0,
                rate_limited: false,
                store_reachable: None,
                pending_records: None,
                healthy: false,
            };
        };

        let stats = components.store.staging_stats().await;
        let store_reachable = stats.is_ok();
        let pending_records = stats
            .ok()
            .map(|stats| stats.records_in(crate::record::StagingStatus::Pending));

        HealthCheck {
            state,
            ready,
            tokens_available: components.limiter.available_tokens(),
            rate_limited: components.limiter.is_rate_limited(),
            store_reachable: Some(store_reachable),
            pending_records,
            healthy: ready && store_reachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryStore;

    #[test]
    fn test_new_engine_is_created() {
        let engine = IngestEngine::new(IngestConfig::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
        assert!(engine.store().is_none());
        assert!(!engine.is_rate_limited());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IngestConfig { sync_page_size: 0, ..Default::default() };
        assert!(matches!(
            IngestEngine::new(config),
            Err(IngestError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_health_before_and_after_start() {
        let store = Arc::new(InMemoryStore::new());
        let mut engine = IngestEngine::with_store(IngestConfig::default(), store).unwrap();

        let health = engine.health().await;
        assert!(!health.healthy);
        assert_eq!(health.store_reachable, None);

        engine.start().await.unwrap();
        let health = engine.health().await;
        assert!(health.healthy);
        assert_eq!(health.store_reachable, Some(true));
        assert_eq!(health.pending_records, Some(0));
        assert!(health.tokens_available >= 100.0);
    }
}
