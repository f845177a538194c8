// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the ingestion engine.
//!
//! Every scenario runs through the public `IngestEngine` facade, against the
//! in-memory store and against a SQLite file in a temp directory.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only SQLite-backed scenarios
//! cargo test --test integration sqlite
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: stage, commit, sync, checkpoints
//! - `sqlite_*` - Same paths against a real SQL backend
//! - `limits_*` - Rate limiting and backpressure as seen by callers

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use message_ingest::{
    Attachment, BackpressurePolicy, EngineState, IngestConfig, IngestEngine, IngestError,
    InMemoryStore, RateLimiterConfig, Record, ScopeKey, StagingStatus,
};

// =============================================================================
// Helpers
// =============================================================================

async fn memory_engine(config: IngestConfig) -> IngestEngine {
    let mut engine = IngestEngine::with_store(config, Arc::new(InMemoryStore::new()))
        .expect("valid config");
    engine.start().await.expect("start");
    engine
}

async fn sqlite_engine(config: IngestConfig) -> (IngestEngine, TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = IngestConfig {
        sql_url: Some(format!("sqlite://{}/ingest.db?mode=rwc", dir.path().display())),
        ..config
    };
    let mut engine = IngestEngine::new(config).expect("valid config");
    engine.start().await.expect("start");
    (engine, dir)
}

fn records(scope: ScopeKey, ids: impl IntoIterator<Item = u64>) -> Vec<Record> {
    ids.into_iter()
        .map(|id| Record::new(id, scope, 7, format!("message {}", id)))
        .collect()
}

/// Plenty of tokens for scenarios that aren't about rate limiting.
fn roomy() -> IngestConfig {
    IngestConfig {
        rate_limit: RateLimiterConfig::new(10_000.0, 1_000.0, 10_000.0),
        ..Default::default()
    }
}

// =============================================================================
// Happy path (in-memory)
// =============================================================================

#[tokio::test]
async fn happy_first_sync_creates_checkpoint() {
    let engine = memory_engine(roomy()).await;
    let scope = ScopeKey::new(100, 456);

    assert!(engine.get_checkpoint(100, 456).await.unwrap().is_none());
    engine.stage_batch(&records(scope, [789]), true).await.unwrap();
    engine.process_staged_batch(None).await.unwrap();

    assert_eq!(engine.sync_scope(100, 456, None).await.unwrap(), 1);
    let checkpoint = engine.get_checkpoint(100, 456).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_message_id, 789);
    assert_eq!(checkpoint.scope(), scope);
}

#[tokio::test]
async fn happy_second_sync_is_idempotent() {
    let engine = memory_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);
    engine.stage_batch(&records(scope, 1..=5), true).await.unwrap();
    engine.process_staged_batch(None).await.unwrap();

    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 5);
    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 0);
}

#[tokio::test]
async fn happy_duplicate_staging_counts() {
    let engine = memory_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);

    let first = engine.stage_batch(&records(scope, [1]), true).await.unwrap();
    assert_eq!((first.staged, first.duplicates), (1, 0));

    let second = engine.stage_batch(&records(scope, [1, 2]), true).await.unwrap();
    assert_eq!((second.staged, second.duplicates), (1, 1));

    assert_eq!(engine.process_staged_batch(None).await.unwrap(), 2);
    let stats = engine.staging_stats().await.unwrap();
    assert_eq!(stats.records_in(StagingStatus::Completed), 2);
    assert_eq!(stats.records_in(StagingStatus::Duplicate), 0);
}

#[tokio::test]
async fn happy_kept_duplicates_are_audited_not_committed() {
    let engine = memory_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);

    engine.stage_batch(&records(scope, [1]), true).await.unwrap();
    let outcome = engine.stage_batch(&records(scope, [1]), false).await.unwrap();
    assert_eq!((outcome.staged, outcome.duplicates), (0, 1));

    assert_eq!(engine.process_staged_batch(None).await.unwrap(), 1);
    let stats = engine.staging_stats().await.unwrap();
    assert_eq!(stats.records_in(StagingStatus::Duplicate), 1);
    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 1);
}

#[tokio::test]
async fn happy_soft_deleted_records_never_synced() {
    let engine = memory_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);
    engine.stage_batch(&records(scope, 1..=4), true).await.unwrap();
    engine.process_staged_batch(None).await.unwrap();

    assert_eq!(engine.delete_records(&[3, 4]).await.unwrap(), 2);
    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 2);
    assert_eq!(engine.get_checkpoint(1, 2).await.unwrap().unwrap().last_message_id, 2);
}

#[tokio::test]
async fn happy_lifecycle_states() {
    let mut engine = IngestEngine::new(roomy()).unwrap();
    let mut rx = engine.state_receiver();
    assert_eq!(engine.state(), EngineState::Created);

    engine.start().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), EngineState::Running);

    engine.shutdown().await;
    assert_eq!(*rx.borrow_and_update(), EngineState::Stopped);
    assert!(matches!(
        engine.stage_batch(&records(ScopeKey::new(1, 2), [1]), true).await,
        Err(IngestError::NotRunning)
    ));
}

// =============================================================================
// SQLite
// =============================================================================

#[tokio::test]
async fn sqlite_full_round_trip() {
    let (engine, _dir) = sqlite_engine(roomy()).await;
    let scope = ScopeKey::new(100, 456);

    let batch = vec![
        Record::new(787, scope, 1, "first"),
        Record::new(788, scope, 2, "second").with_secondary_content(r#"{"embeds":[]}"#),
        Record::new(789, scope, 1, "reply").with_reply_to(788),
    ];
    engine.stage_batch(&batch, true).await.unwrap();
    assert_eq!(engine.process_staged_batch(None).await.unwrap(), 3);

    let stored = engine.get_record(788).await.unwrap().unwrap();
    assert_eq!(stored, batch[1]);
    let replies = engine.replies_to(788).await.unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, 789);

    assert_eq!(engine.sync_scope(100, 456, None).await.unwrap(), 3);
    assert_eq!(engine.sync_scope(100, 456, None).await.unwrap(), 0);
    assert_eq!(engine.get_checkpoint(100, 456).await.unwrap().unwrap().last_message_id, 789);

    assert!(engine.health().await.healthy);
    engine.shutdown().await;
}

#[tokio::test]
async fn sqlite_large_backlog_paginates() {
    let (engine, _dir) = sqlite_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);

    engine.stage_batch(&records(scope, 1..=1500), true).await.unwrap();
    let drained = engine
        .process_all_staged(Some(500), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(drained.processed, 1500);
    assert_eq!(drained.batches, 3);

    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 1500);
    assert_eq!(engine.get_checkpoint(1, 2).await.unwrap().unwrap().last_message_id, 1500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_syncs_count_once() {
    let (engine, _dir) = sqlite_engine(roomy()).await;
    let engine = Arc::new(engine);
    engine.stage_batch(&records(ScopeKey::new(100, 456), [789]), true).await.unwrap();
    engine.process_staged_batch(None).await.unwrap();

    let mut handles = vec![];
    for _ in 0..12 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.sync_scope(100, 456, None).await }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().unwrap();
    }
    assert_eq!(total, 1);
    assert_eq!(engine.get_checkpoint(100, 456).await.unwrap().unwrap().last_message_id, 789);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_staging_dedups() {
    let (engine, _dir) = sqlite_engine(roomy()).await;
    let engine = Arc::new(engine);
    let scope = ScopeKey::new(1, 2);

    let mut handles = vec![];
    for _ in 0..8 {
        let engine = engine.clone();
        let batch = records(scope, 1..=20);
        handles.push(tokio::spawn(async move { engine.stage_batch(&batch, true).await }));
    }

    let mut staged = 0;
    let mut duplicates = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        staged += outcome.staged;
        duplicates += outcome.duplicates;
    }
    assert_eq!(staged, 20);
    assert_eq!(duplicates, 140);
}

#[tokio::test]
async fn sqlite_attachments_follow_their_record() {
    let (engine, _dir) = sqlite_engine(roomy()).await;
    let scope = ScopeKey::new(1, 2);
    let files = vec![
        Attachment::new(501, 10, "a.png", "https://cdn.example/a.png"),
        Attachment::new(502, 10, "b.png", "https://cdn.example/b.png"),
    ];

    assert_eq!(engine.stage_attachments(10, &files).await.unwrap(), 2);
    // Re-staging the same files is a no-op
    assert_eq!(engine.stage_attachments(10, &files).await.unwrap(), 0);
    assert_eq!(engine.process_staged_attachments(None).await.unwrap(), 0);

    engine.stage_batch(&records(scope, [10]), true).await.unwrap();
    engine.process_staged_batch(None).await.unwrap();
    assert_eq!(engine.process_staged_attachments(None).await.unwrap(), 2);
}

#[tokio::test]
async fn sqlite_checkpoint_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = IngestConfig {
        sql_url: Some(format!("sqlite://{}/ingest.db?mode=rwc", dir.path().display())),
        ..roomy()
    };
    let scope = ScopeKey::new(1, 2);

    {
        let mut engine = IngestEngine::new(config.clone()).unwrap();
        engine.start().await.unwrap();
        engine.stage_batch(&records(scope, 1..=3), true).await.unwrap();
        engine.process_staged_batch(None).await.unwrap();
        assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 3);
        engine.shutdown().await;
    }

    let mut engine = IngestEngine::new(config).unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.get_checkpoint(1, 2).await.unwrap().unwrap().last_message_id, 3);
    assert_eq!(engine.sync_scope(1, 2, None).await.unwrap(), 0);

    // Staged history survives too, so old ids stay duplicates
    let again = engine.stage_batch(&records(scope, [2]), true).await.unwrap();
    assert_eq!(again.duplicates, 1);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn limits_eleventh_token_denied_then_refilled() {
    let config = IngestConfig {
        rate_limit: RateLimiterConfig::new(10.0, 1.0, 10.0),
        backpressure: BackpressurePolicy::Reject,
        ..Default::default()
    };
    let engine = memory_engine(config).await;

    for _ in 0..10 {
        engine.sync_scope(1, 2, None).await.unwrap();
    }
    assert!(engine.is_rate_limited());
    let err = engine.sync_scope(1, 2, None).await.unwrap_err();
    assert!(err.is_rate_limited());
    assert!(err.is_retryable());

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert!(!engine.is_rate_limited());
    engine.sync_scope(1, 2, None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn limits_wait_policy_times_out() {
    let config = IngestConfig {
        rate_limit: RateLimiterConfig::new(1.0, 0.1, 1.0),
        backpressure: BackpressurePolicy::wait(Duration::from_millis(500), Duration::from_millis(50)),
        ..Default::default()
    };
    let engine = memory_engine(config).await;
    engine.sync_scope(1, 2, None).await.unwrap();

    match engine.sync_scope(1, 2, None).await {
        Err(IngestError::RateLimited { waited }) => assert!(waited >= Duration::from_millis(500)),
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn limits_cancel_while_waiting() {
    let config = IngestConfig {
        rate_limit: RateLimiterConfig::new(1.0, 0.1, 1.0),
        backpressure: BackpressurePolicy::wait(Duration::from_secs(60), Duration::from_millis(50)),
        ..Default::default()
    };
    let engine = Arc::new(memory_engine(config).await);
    engine.sync_scope(1, 2, None).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            engine
                .sync_scope_with_cancel(ScopeKey::new(1, 2), None, &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    assert!(matches!(waiter.await.unwrap(), Err(IngestError::Cancelled)));
}
