// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpointed incremental sync per scope pair.
//!
//! For one `(outer, inner)` scope, a sync pass:
//! 1. takes the scope's lock (other scopes are unaffected)
//! 2. starts after `from_id`, else after the stored watermark, else from the start
//! 3. walks non-deleted records in id order, one page at a time
//! 4. upserts the checkpoint at the highest id seen, if anything was seen
//!
//! Checkpoint read, range scan and checkpoint write form one unit under the
//! lock, so concurrent passes over the same scope never count a record twice.
//! The stored watermark never moves backwards.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::IngestError;
use crate::record::{now_millis, RecordId, ScopeKey, SyncCheckpoint, MAX_ID};
use crate::storage::traits::{IngestStore, RecordQuery};

/// Result of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Records counted by this pass
    pub synced: usize,
    /// Highest id observed by this pass
    pub last_message_id: Option<RecordId>,
    /// Stopped early on the cancellation signal; pages already read still count
    pub cancelled: bool,
}

/// A held scope lock. Dropping it, even mid-wait, releases the mutex and
/// removes the map entry once no other pass holds or awaits it.
struct ScopeLock<'a> {
    locks: &'a DashMap<ScopeKey, Arc<Mutex<()>>>,
    scope: ScopeKey,
    entry: Option<Arc<Mutex<()>>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl<'a> ScopeLock<'a> {
    async fn acquire(
        locks: &'a DashMap<ScopeKey, Arc<Mutex<()>>>,
        scope: ScopeKey,
    ) -> ScopeLock<'a> {
        let entry = locks
            .entry(scope)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut guard = ScopeLock {
            locks,
            scope,
            entry: Some(entry.clone()),
            held: None,
        };
        guard.held = Some(entry.lock_owned().await);
        guard
    }
}

impl Drop for ScopeLock<'_> {
    fn drop(&mut self) {
        self.held.take();
        self.entry.take();
        self.locks.remove_if(&self.scope, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct SyncCoordinator {
    store: Arc<dyn IngestStore>,
    page_size: usize,
    locks: DashMap<ScopeKey, Arc<Mutex<()>>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn IngestStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Scopes with a sync pass running or queued.
    #[must_use]
    pub fn active_scopes(&self) -> usize {
        self.locks.len()
    }

    /// Sync `scope` and return how many new records were counted.
    pub async fn sync_scope(
        &self,
        scope: ScopeKey,
        from_id: Option<RecordId>,
    ) -> Result<usize, IngestError> {
        let outcome = self
            .sync_scope_with_cancel(scope, from_id, &CancellationToken::new())
            .await?;
        Ok(outcome.synced)
    }

    /// Like [`sync_scope`](Self::sync_scope), checking `cancel` before each
    /// page. A pass cancelled before its first page fails with
    /// [`IngestError::Cancelled`]; one cancelled later still advances the
    /// checkpoint over the pages it read.
    pub async fn sync_scope_with_cancel(
        &self,
        scope: ScopeKey,
        from_id: Option<RecordId>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, IngestError> {
        if scope.outer_id == 0 || scope.inner_id == 0 {
            return Err(IngestError::Validation(format!("empty scope {}", scope)));
        }
        if !scope.in_range() || from_id.is_some_and(|id| id > MAX_ID) {
            return Err(IngestError::Validation(format!("id out of range in scope {}", scope)));
        }

        let _scope_lock = ScopeLock::acquire(&self.locks, scope).await;
        self.sync_locked(scope, from_id, cancel).await
    }

    async fn sync_locked(
        &self,
        scope: ScopeKey,
        from_id: Option<RecordId>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, IngestError> {
        let existing = self.store.get_checkpoint(&scope).await?;
        let lower = from_id.or_else(|| existing.as_ref().map(|cp| cp.last_message_id));
        debug!(%scope, lower = ?lower, "Sync pass starting");

        let mut outcome = SyncOutcome::default();
        let mut cursor = lower;
        let mut pages = 0usize;

        loop {
            if cancel.is_cancelled() {
                if pages == 0 {
                    return Err(IngestError::Cancelled);
                }
                outcome.cancelled = true;
                break;
            }

            let page = self
                .store
                .query_scope(&RecordQuery::new(scope, cursor, self.page_size))
                .await?;
            pages += 1;

            let Some(last) = page.last() else { break };
            outcome.synced += page.len();
            cursor = Some(last.id);
            outcome.last_message_id = cursor;

            if page.len() < self.page_size {
                break;
            }
        }

        if let Some(observed_max) = outcome.last_message_id {
            let now = now_millis();
            let checkpoint = match existing {
                Some(mut cp) => {
                    cp.advance(observed_max, now);
                    cp
                }
                None => SyncCheckpoint::new(scope, observed_max, now),
            };
            self.store.upsert_checkpoint(&checkpoint).await?;
            crate::metrics::record_checkpoint_advance();
            debug!(%scope, last_message_id = checkpoint.last_message_id, "Checkpoint advanced");
        }

        crate::metrics::record_synced(outcome.synced);
        info!(
            %scope,
            synced = outcome.synced,
            pages,
            cancelled = outcome.cancelled,
            "Sync pass finished"
        );
        Ok(outcome)
    }

    pub async fn get_checkpoint(&self, scope: ScopeKey) -> Result<Option<SyncCheckpoint>, IngestError> {
        Ok(self.store.get_checkpoint(&scope).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::record::Record;
    use crate::storage::memory::InMemoryStore;
    use crate::storage::traits::RecordStore;

    fn coordinator(page_size: usize) -> (Arc<SyncCoordinator>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (Arc::new(SyncCoordinator::new(store.clone(), page_size)), store)
    }

    fn records(scope: ScopeKey, ids: impl IntoIterator<Item = u64>) -> Vec<Record> {
        ids.into_iter().map(|id| Record::new(id, scope, 1, "x")).collect()
    }

    #[tokio::test]
    async fn test_first_sync_creates_checkpoint() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(100, 456);
        store.seed_records(records(scope, [789]));

        assert!(sync.get_checkpoint(scope).await.unwrap().is_none());
        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 1);

        let cp = sync.get_checkpoint(scope).await.unwrap().unwrap();
        assert_eq!(cp.last_message_id, 789);
        assert_eq!(cp.id, "100:456");
    }

    #[tokio::test]
    async fn test_second_sync_without_new_data_counts_nothing() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, 1..=3));

        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 3);
        let before = sync.get_checkpoint(scope).await.unwrap().unwrap();

        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 0);
        let after = sync.get_checkpoint(scope).await.unwrap().unwrap();
        assert_eq!(after, before);

        store.seed_records(records(scope, [10]));
        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 1);
        assert_eq!(sync.get_checkpoint(scope).await.unwrap().unwrap().last_message_id, 10);
    }

    #[tokio::test]
    async fn test_paginates_large_backlog() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, 1..=1500));

        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 1500);
        assert_eq!(sync.get_checkpoint(scope).await.unwrap().unwrap().last_message_id, 1500);
    }

    #[tokio::test]
    async fn test_uneven_last_page() {
        let (sync, store) = coordinator(7);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, (1..=50).map(|i| i * 3)));

        let outcome = sync
            .sync_scope_with_cancel(scope, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.synced, 50);
        assert_eq!(outcome.last_message_id, Some(150));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_deleted_records_never_counted() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, 1..=4));
        store.soft_delete(&[2, 4], 0).await.unwrap();

        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 2);
        assert_eq!(sync.get_checkpoint(scope).await.unwrap().unwrap().last_message_id, 3);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (sync, store) = coordinator(500);
        let a = ScopeKey::new(1, 2);
        let b = ScopeKey::new(1, 3);
        store.seed_records(records(a, 1..=3));
        store.seed_records(records(b, 10..=11));

        assert_eq!(sync.sync_scope(a, None).await.unwrap(), 3);
        assert!(sync.get_checkpoint(b).await.unwrap().is_none());
        assert_eq!(sync.sync_scope(b, None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_explicit_from_id_never_lowers_watermark() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, 1..=10));
        sync.sync_scope(scope, None).await.unwrap();

        // Re-scan an older window
        assert_eq!(sync.sync_scope(scope, Some(5)).await.unwrap(), 5);
        assert_eq!(sync.get_checkpoint(scope).await.unwrap().unwrap().last_message_id, 10);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_checkpoint_alone() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, [1]));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sync.sync_scope_with_cancel(scope, None, &cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
        assert!(sync.get_checkpoint(scope).await.unwrap().is_none());
        assert_eq!(sync.active_scopes(), 0);
    }

    #[tokio::test]
    async fn test_empty_scope_is_validation_error() {
        let (sync, _store) = coordinator(500);
        assert!(matches!(
            sync.sync_scope(ScopeKey::new(0, 2), None).await,
            Err(IngestError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_ids_are_validation_errors() {
        let (sync, _store) = coordinator(500);
        assert!(matches!(
            sync.sync_scope(ScopeKey::new(1, MAX_ID + 1), None).await,
            Err(IngestError::Validation(_))
        ));
        assert!(matches!(
            sync.sync_scope(ScopeKey::new(1, 2), Some(MAX_ID + 1)).await,
            Err(IngestError::Validation(_))
        ));
        assert_eq!(sync.active_scopes(), 0);
    }

    #[tokio::test]
    async fn test_dropped_pass_releases_scope_entry() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(1, 2);
        store.seed_records(records(scope, [5]));

        let holder = ScopeLock::acquire(&sync.locks, scope).await;
        let mut waiting = Box::pin(sync.sync_scope(scope, None));
        assert!(tokio::time::timeout(Duration::from_millis(5), &mut waiting).await.is_err());
        assert_eq!(sync.active_scopes(), 1);

        drop(holder);
        assert_eq!(sync.active_scopes(), 1);
        drop(waiting);
        assert_eq!(sync.active_scopes(), 0);

        // The scope is usable again afterwards
        assert_eq!(sync.sync_scope(scope, None).await.unwrap(), 1);
        assert_eq!(sync.active_scopes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_syncs_count_record_once() {
        let (sync, store) = coordinator(500);
        let scope = ScopeKey::new(100, 456);
        store.seed_records(records(scope, [789]));

        let mut handles = vec![];
        for _ in 0..16 {
            let sync = sync.clone();
            handles.push(tokio::spawn(async move { sync.sync_scope(scope, None).await.unwrap() }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 1);
        assert_eq!(sync.get_checkpoint(scope).await.unwrap().unwrap().last_message_id, 789);
        assert_eq!(sync.active_scopes(), 0);
    }
}
