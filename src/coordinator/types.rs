// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the ingestion engine.

use serde::Serialize;

/// Engine lifecycle state.
///
/// Use [`super::IngestEngine::state()`] to check current state or
/// [`super::IngestEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening the store
    Connecting,
    /// Accepting requests
    Running,
    /// Shutdown in progress; new requests are refused
    ShuttingDown,
    /// Limiter stopped, nothing more will run
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Result of draining the staging area batch by batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Staged rows moved to Completed
    pub processed: usize,
    /// Non-empty batches committed
    pub batches: usize,
    /// Stopped on the cancellation signal before the staging area was empty
    pub cancelled: bool,
}

/// Snapshot of engine health for `/ready` and `/health` endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and accepting requests
    pub ready: bool,
    pub tokens_available: f64,
    /// A write right now would be held back or rejected
    pub rate_limited: bool,
    /// `None` when no store is open yet
    pub store_reachable: Option<bool>,
    /// Staged rows still waiting for commit
    pub pending_records: Option<u64>,
    pub healthy: bool,
}
