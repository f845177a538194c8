// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Message Ingest
//!
//! Deduplicating, rate-limited ingestion of chat message records with
//! checkpointed incremental sync.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   IngestEngine (facade)                     │
//! │  • Token bucket admission on every store write             │
//! │  • Backpressure: reject, or wait bounded for a token       │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │       StagingPipeline        │ │       SyncCoordinator        │
//! │  • Dedup on stage            │ │  • Per-scope async lock      │
//! │  • Claim → commit → complete │ │  • Keyset pages of 500       │
//! │  • Bounded commit retry      │ │  • Monotonic checkpoints     │
//! └──────────────────────────────┘ └──────────────────────────────┘
//!                │                               │
//!                └───────────────┬───────────────┘
//!                                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          IngestStore: SqlStore (SQLite/MySQL) or            │
//! │          InMemoryStore                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use message_ingest::{IngestConfig, IngestEngine, Record, ScopeKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = IngestConfig {
//!         sql_url: Some("sqlite://ingest.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut engine = IngestEngine::new(config).expect("valid config");
//!     engine.start().await.expect("Failed to start");
//!
//!     let scope = ScopeKey::new(100, 456);
//!     let outcome = engine
//!         .stage_batch(&[Record::new(789, scope, 42, "hello")], true)
//!         .await
//!         .expect("Failed to stage");
//!     println!("staged {} duplicates {}", outcome.staged, outcome.duplicates);
//!
//!     engine.process_staged_batch(None).await.expect("Failed to commit");
//!     let synced = engine.sync_scope(100, 456, None).await.expect("Failed to sync");
//!     println!("synced {}", synced);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The main [`IngestEngine`] composing everything below
//! - [`rate_limit`]: Token bucket and its refill task
//! - [`backpressure`]: What a denied write does
//! - [`staging`]: Staging, dedup and transactional commit
//! - [`sync`]: Checkpointed per-scope sync
//! - [`storage`]: Store traits plus SQL and in-memory backends
//! - [`resilience`]: Retry with backoff

pub mod backpressure;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod record;
pub mod resilience;
pub mod staging;
pub mod storage;
pub mod sync;

pub use backpressure::BackpressurePolicy;
pub use config::IngestConfig;
pub use coordinator::{DrainOutcome, EngineState, HealthCheck, IngestEngine};
pub use error::IngestError;
pub use metrics::LatencyTimer;
pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use record::{
    Attachment, AttachmentId, AttachmentStatus, Record, RecordId, ScopeKey, StagedAttachment,
    StagedRecord, StagingStatus, SyncCheckpoint, MAX_ID,
};
pub use resilience::retry::RetryConfig;
pub use staging::{RecoveredClaims, StageOutcome, StagingPipeline};
pub use storage::memory::InMemoryStore;
pub use storage::sql::SqlStore;
pub use storage::traits::{
    CheckpointStore, IngestStore, RecordQuery, RecordStore, RecordTransaction, StagingStats,
    StagingStore, StorageError,
};
pub use sync::{SyncCoordinator, SyncOutcome};
