// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start and shutdown.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::IngestError;
use crate::rate_limit::RateLimiter;
use crate::staging::StagingPipeline;
use crate::storage::memory::InMemoryStore;
use crate::storage::traits::IngestStore;
use crate::sync::SyncCoordinator;

use super::{Components, EngineState, IngestEngine};

impl IngestEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Open the store: the injected one, else SQL when `sql_url` is set,
    ///    else a fresh in-memory store
    /// 2. Start the rate limiter and its refill task
    /// 3. Build the staging pipeline and sync coordinator over the store
    /// 4. Recover staging claims left behind by an earlier run
    /// 5. Ready!
    ///
    /// Starting a running engine is a no-op. A stopped engine cannot be
    /// restarted.
    #[tracing::instrument(skip(self), fields(has_sql))]
    pub async fn start(&mut self) -> Result<(), IngestError> {
        match self.state() {
            EngineState::Running => {
                warn!("Engine already running");
                return Ok(());
            }
            EngineState::ShuttingDown | EngineState::Stopped => return Err(IngestError::NotRunning),
            EngineState::Created | EngineState::Connecting => {}
        }

        let startup_start = std::time::Instant::now();
        info!("Starting ingestion engine...");
        self.set_state(EngineState::Connecting);

        let store: Arc<dyn IngestStore> = if let Some(store) = self.injected_store.take() {
            tracing::Span::current().record("has_sql", false);
            info!("Using injected store");
            store
        } else if let Some(ref sql_url) = self.config.sql_url {
            info!("Connecting to SQL store...");
            match crate::storage::sql::SqlStore::new(sql_url).await {
                Ok(store) => {
                    tracing::Span::current().record("has_sql", true);
                    info!("SQL store connected");
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::Span::current().record("has_sql", false);
                    error!(error = %e, "Failed to connect to SQL");
                    self.set_state(EngineState::Created);
                    return Err(e.into());
                }
            }
        } else {
            warn!("No SQL URL configured - records are kept in memory only");
            tracing::Span::current().record("has_sql", false);
            Arc::new(InMemoryStore::new())
        };

        let limiter = match RateLimiter::new(self.config.rate_limit.clone()) {
            Ok(limiter) => limiter,
            Err(e) => {
                self.set_state(EngineState::Created);
                return Err(e);
            }
        };

        let staging = StagingPipeline::new(store.clone(), self.config.commit_retry.clone())
            .with_claim_lease(self.config.claim_lease());
        match staging.recover_expired_claims().await {
            Ok(recovered) if recovered.total() > 0 => {
                info!(
                    completed = recovered.completed,
                    failed = recovered.failed,
                    "Recovered expired staging claims"
                );
            }
            Ok(_) => {}
            // Retried before every claim anyway
            Err(e) => warn!(error = %e, "Staging claim recovery failed at startup"),
        }

        self.components = Some(Components {
            staging,
            sync: SyncCoordinator::new(store.clone(), self.config.sync_page_size),
            limiter,
            store,
        });

        self.set_state(EngineState::Running);
        info!(
            startup_ms = startup_start.elapsed().as_millis() as u64,
            "Ingestion engine ready"
        );
        Ok(())
    }

    /// Stop accepting requests and stop the limiter.
    ///
    /// Callers waiting for a rate-limit token are released with
    /// [`IngestError::NotRunning`]. Calls already past admission finish
    /// normally. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        info!("Initiating ingestion engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        self.shutdown.cancel();

        if let Some(components) = self.components.as_ref() {
            components.limiter.dispose();
            info!(
                denied = components.limiter.denied_count(),
                active_scopes = components.sync.active_scopes(),
                "Rate limiter stopped"
            );
        }

        self.set_state(EngineState::Stopped);
        info!("Ingestion engine shutdown complete");
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            crate::metrics::set_engine_state(&previous.to_string(), false);
        }
        crate::metrics::set_engine_state(&state.to_string(), true);
    }
}
