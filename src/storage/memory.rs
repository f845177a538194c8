// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process store used when no SQL URL is configured, and by tests.
//!
//! Canonical tables sit behind one `RwLock` so a transaction commit can
//! check every key and apply every row under a single write guard.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::traits::{
    CheckpointStore, ClaimedBatch, RecordQuery, RecordStore, RecordTransaction, StagedLookup,
    StagingStats, StagingStore, StorageError,
};
use crate::record::{
    now_millis, Attachment, AttachmentId, AttachmentStatus, Record, RecordId, ScopeKey,
    StagedAttachment, StagedRecord, StagingStatus, SyncCheckpoint,
};

#[derive(Default)]
struct CanonicalTables {
    records: BTreeMap<RecordId, Record>,
    attachments: BTreeMap<AttachmentId, Attachment>,
}

pub struct InMemoryStore {
    canonical: Arc<RwLock<CanonicalTables>>,
    staged_records: RwLock<BTreeMap<u64, StagedRecord>>,
    staged_attachments: RwLock<BTreeMap<u64, StagedAttachment>>,
    checkpoints: DashMap<String, SyncCheckpoint>,
    next_staging_id: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            canonical: Arc::new(RwLock::new(CanonicalTables::default())),
            staged_records: RwLock::new(BTreeMap::new()),
            staged_attachments: RwLock::new(BTreeMap::new()),
            checkpoints: DashMap::new(),
            next_staging_id: AtomicU64::new(1),
        }
    }

    /// Number of canonical records (deleted included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.canonical.read().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.canonical.read().records.is_empty()
    }

    #[must_use]
    pub fn attachment_count(&self) -> usize {
        self.canonical.read().attachments.len()
    }

    /// Insert canonical records directly, bypassing staging. Existing ids are
    /// overwritten.
    pub fn seed_records(&self, records: impl IntoIterator<Item = Record>) {
        let mut tables = self.canonical.write();
        for record in records {
            tables.records.insert(record.id, record);
        }
    }

    pub fn clear(&self) {
        let mut tables = self.canonical.write();
        tables.records.clear();
        tables.attachments.clear();
        self.staged_records.write().clear();
        self.staged_attachments.write().clear();
        self.checkpoints.clear();
    }

    fn next_id(&self) -> u64 {
        self.next_staging_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTransaction {
    canonical: Arc<RwLock<CanonicalTables>>,
    records: Vec<Record>,
    attachments: Vec<Attachment>,
}

fn check_conflicts(
    tables: &CanonicalTables,
    records: &[Record],
    attachments: &[Attachment],
) -> Result<(), StorageError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if tables.records.contains_key(&record.id) || !seen.insert(record.id) {
            return Err(StorageError::Conflict(format!("record {} already exists", record.id)));
        }
    }
    let mut seen = HashSet::with_capacity(attachments.len());
    for attachment in attachments {
        if tables.attachments.contains_key(&attachment.id) || !seen.insert(attachment.id) {
            return Err(StorageError::Conflict(format!(
                "attachment {} already exists",
                attachment.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl RecordTransaction for MemoryTransaction {
    async fn insert_records(&mut self, records: &[Record]) -> Result<usize, StorageError> {
        self.records.extend_from_slice(records);
        check_conflicts(&self.canonical.read(), &self.records, &self.attachments)?;
        Ok(records.len())
    }

    async fn insert_attachments(&mut self, attachments: &[Attachment]) -> Result<usize, StorageError> {
        self.attachments.extend_from_slice(attachments);
        check_conflicts(&self.canonical.read(), &self.records, &self.attachments)?;
        Ok(attachments.len())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction { canonical, records, attachments } = *self;
        let mut tables = canonical.write();
        check_conflicts(&tables, &records, &attachments)?;
        for record in records {
            tables.records.insert(record.id, record);
        }
        for attachment in attachments {
            tables.attachments.insert(attachment.id, attachment);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn find_existing(&self, ids: &[RecordId]) -> Result<HashSet<RecordId>, StorageError> {
        let tables = self.canonical.read();
        Ok(ids.iter().copied().filter(|id| tables.records.contains_key(id)).collect())
    }

    async fn find_existing_attachments(
        &self,
        ids: &[AttachmentId],
    ) -> Result<HashSet<AttachmentId>, StorageError> {
        let tables = self.canonical.read();
        Ok(ids.iter().copied().filter(|id| tables.attachments.contains_key(id)).collect())
    }

    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
        Ok(Box::new(MemoryTransaction {
            canonical: Arc::clone(&self.canonical),
            records: Vec::new(),
            attachments: Vec::new(),
        }))
    }

    async fn query_scope(&self, query: &RecordQuery) -> Result<Vec<Record>, StorageError> {
        let tables = self.canonical.read();
        let start = query.id_greater_than.map_or(0, |lower| lower.saturating_add(1));
        Ok(tables
            .records
            .range(start..)
            .map(|(_, record)| record)
            .filter(|record| query.matches(record))
            .skip(query.offset as usize)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        Ok(self.canonical.read().records.get(&id).cloned())
    }

    async fn replies_to(&self, parent_id: RecordId) -> Result<Vec<Record>, StorageError> {
        let tables = self.canonical.read();
        Ok(tables
            .records
            .values()
            .filter(|r| r.reply_to_id == Some(parent_id) && !r.is_deleted)
            .cloned()
            .collect())
    }

    async fn soft_delete(&self, ids: &[RecordId], deleted_at: i64) -> Result<usize, StorageError> {
        let mut tables = self.canonical.write();
        let mut changed = 0;
        for id in ids {
            if let Some(record) = tables.records.get_mut(id) {
                if !record.is_deleted {
                    record.is_deleted = true;
                    record.deleted_at = Some(deleted_at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}

/// Move eligible Pending rows to Processing, oldest first.
fn claim_rows<T: Clone>(
    rows: &mut BTreeMap<u64, T>,
    limit: usize,
    batch_id: &str,
    is_claimable: impl Fn(&T) -> bool,
    staged_at: impl Fn(&T) -> i64,
    mark: impl Fn(&mut T, &str),
) -> Vec<T> {
    let mut candidates: Vec<(i64, u64)> = rows
        .iter()
        .filter(|(_, row)| is_claimable(row))
        .map(|(id, row)| (staged_at(row), *id))
        .collect();
    candidates.sort_unstable();
    candidates.truncate(limit);

    let mut claimed = Vec::with_capacity(candidates.len());
    for (_, id) in candidates {
        if let Some(row) = rows.get_mut(&id) {
            mark(row, batch_id);
            claimed.push(row.clone());
        }
    }
    claimed
}

#[async_trait]
impl StagingStore for InMemoryStore {
    async fn insert_staged_record(
        &self,
        record: &Record,
        status: StagingStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedRecord, StorageError> {
        let mut rows = self.staged_records.write();
        if status == StagingStatus::Pending
            && rows
                .values()
                .any(|row| row.record.id == record.id && row.status.blocks_restaging())
        {
            return Err(StorageError::Conflict(format!("record {} is already staged", record.id)));
        }
        let staged = StagedRecord {
            staging_id: self.next_id(),
            record: record.clone(),
            status,
            staged_at,
            processed_at: None,
            error: None,
            retry_count,
            batch_id: None,
            claimed_at: None,
        };
        rows.insert(staged.staging_id, staged.clone());
        Ok(staged)
    }

    async fn staged_record_lookup(&self, ids: &[RecordId]) -> Result<StagedLookup, StorageError> {
        let wanted: HashSet<RecordId> = ids.iter().copied().collect();
        let mut lookup = StagedLookup::default();
        for row in self.staged_records.read().values() {
            if !wanted.contains(&row.record.id) {
                continue;
            }
            if row.status.blocks_restaging() {
                lookup.blocking.insert(row.record.id);
            } else if row.status == StagingStatus::Failed {
                let entry = lookup.failed_attempts.entry(row.record.id).or_insert(row.retry_count);
                *entry = (*entry).max(row.retry_count);
            }
        }
        Ok(lookup)
    }

    async fn claim_pending_records(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedRecord>, StorageError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let claimed_at = now_millis();
        let rows = claim_rows(
            &mut self.staged_records.write(),
            limit,
            &batch_id,
            |row| row.status == StagingStatus::Pending,
            |row| row.staged_at,
            |row, batch| {
                row.status = StagingStatus::Processing;
                row.batch_id = Some(batch.to_string());
                row.claimed_at = Some(claimed_at);
            },
        );
        Ok(ClaimedBatch { batch_id, rows })
    }

    async fn stale_record_claims(&self, claimed_before: i64) -> Result<Vec<StagedRecord>, StorageError> {
        Ok(self
            .staged_records
            .read()
            .values()
            .filter(|row| {
                row.status == StagingStatus::Processing
                    && row.claimed_at.map_or(true, |at| at <= claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn complete_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError> {
        let mut rows = self.staged_records.write();
        let mut changed = 0;
        for id in staging_ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status.can_transition_to(StagingStatus::Completed) {
                    row.status = StagingStatus::Completed;
                    row.processed_at = Some(processed_at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn fail_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError> {
        let mut rows = self.staged_records.write();
        let mut changed = 0;
        for id in staging_ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status.can_transition_to(StagingStatus::Failed) {
                    row.status = StagingStatus::Failed;
                    row.processed_at = Some(processed_at);
                    row.error = Some(error.to_string());
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn get_staged_record(&self, staging_id: u64) -> Result<Option<StagedRecord>, StorageError> {
        Ok(self.staged_records.read().get(&staging_id).cloned())
    }

    async fn insert_staged_attachment(
        &self,
        attachment: &Attachment,
        status: AttachmentStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedAttachment, StorageError> {
        let mut rows = self.staged_attachments.write();
        if status == AttachmentStatus::Pending
            && rows
                .values()
                .any(|row| row.attachment.id == attachment.id && row.status.blocks_restaging())
        {
            return Err(StorageError::Conflict(format!(
                "attachment {} is already staged",
                attachment.id
            )));
        }
        let staged = StagedAttachment {
            staging_id: self.next_id(),
            attachment: attachment.clone(),
            status,
            staged_at,
            processed_at: None,
            error: None,
            retry_count,
            batch_id: None,
            claimed_at: None,
        };
        rows.insert(staged.staging_id, staged.clone());
        Ok(staged)
    }

    async fn staged_attachment_lookup(
        &self,
        ids: &[AttachmentId],
    ) -> Result<StagedLookup, StorageError> {
        let wanted: HashSet<AttachmentId> = ids.iter().copied().collect();
        let mut lookup = StagedLookup::default();
        for row in self.staged_attachments.read().values() {
            if !wanted.contains(&row.attachment.id) {
                continue;
            }
            if row.status.blocks_restaging() {
                lookup.blocking.insert(row.attachment.id);
            } else if row.status == AttachmentStatus::Failed {
                let entry = lookup.failed_attempts.entry(row.attachment.id).or_insert(row.retry_count);
                *entry = (*entry).max(row.retry_count);
            }
        }
        Ok(lookup)
    }

    async fn claim_ready_attachments(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedAttachment>, StorageError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let claimed_at = now_millis();
        let tables = self.canonical.read();
        let rows = claim_rows(
            &mut self.staged_attachments.write(),
            limit,
            &batch_id,
            |row| {
                row.status == AttachmentStatus::Pending
                    && tables.records.contains_key(&row.attachment.record_id)
            },
            |row| row.staged_at,
            |row, batch| {
                row.status = AttachmentStatus::Processing;
                row.batch_id = Some(batch.to_string());
                row.claimed_at = Some(claimed_at);
            },
        );
        Ok(ClaimedBatch { batch_id, rows })
    }

    async fn stale_attachment_claims(
        &self,
        claimed_before: i64,
    ) -> Result<Vec<StagedAttachment>, StorageError> {
        Ok(self
            .staged_attachments
            .read()
            .values()
            .filter(|row| {
                row.status == AttachmentStatus::Processing
                    && row.claimed_at.map_or(true, |at| at <= claimed_before)
            })
            .cloned()
            .collect())
    }

    async fn complete_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError> {
        let mut rows = self.staged_attachments.write();
        let mut changed = 0;
        for id in staging_ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == AttachmentStatus::Processing {
                    row.status = AttachmentStatus::Completed;
                    row.processed_at = Some(processed_at);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn fail_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError> {
        let mut rows = self.staged_attachments.write();
        let mut changed = 0;
        for id in staging_ids {
            if let Some(row) = rows.get_mut(id) {
                if row.status == AttachmentStatus::Processing {
                    row.status = AttachmentStatus::Failed;
                    row.processed_at = Some(processed_at);
                    row.error = Some(error.to_string());
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn staging_stats(&self) -> Result<StagingStats, StorageError> {
        let mut stats = StagingStats::default();
        for row in self.staged_records.read().values() {
            *stats.records.entry(row.status).or_insert(0) += 1;
        }
        for row in self.staged_attachments.read().values() {
            *stats.attachments.entry(row.status).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn get_checkpoint(&self, scope: &ScopeKey) -> Result<Option<SyncCheckpoint>, StorageError> {
        Ok(self.checkpoints.get(&scope.checkpoint_id()).map(|r| r.value().clone()))
    }

    async fn upsert_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StorageError> {
        self.checkpoints
            .entry(checkpoint.id.clone())
            .and_modify(|existing| {
                existing.advance(checkpoint.last_message_id, checkpoint.last_synced_at)
            })
            .or_insert_with(|| checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCOPE: ScopeKey = ScopeKey { outer_id: 100, inner_id: 456 };

    fn record(id: u64) -> Record {
        Record::new(id, SCOPE, 1, format!("message {}", id))
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_bulk_insert_and_find_existing() {
        let store = InMemoryStore::new();
        let written = store.bulk_insert(&[record(1), record(2), record(3)]).await.unwrap();
        assert_eq!(written, 3);

        let found = store.find_existing(&[1, 3, 99]).await.unwrap();
        assert_eq!(found, HashSet::from([1, 3]));
    }

    #[tokio::test]
    async fn test_transaction_is_all_or_nothing() {
        let store = InMemoryStore::new();
        store.seed_records([record(2)]);

        let result = store.bulk_insert(&[record(1), record(2), record(3)]).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        // Neither 1 nor 3 landed
        assert_eq!(store.len(), 1);
        assert!(store.get_record(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncommitted_transaction_is_invisible() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_records(&[record(1)]).await.unwrap();
        assert!(store.get_record(1).await.unwrap().is_none());

        tx.rollback().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_query_scope_pages_and_excludes_deleted() {
        let store = InMemoryStore::new();
        store.seed_records((1..=10).map(record));
        store.seed_records([Record::new(11, ScopeKey::new(100, 999), 1, "other scope")]);
        store.soft_delete(&[4], 1).await.unwrap();

        let page = store.query_scope(&RecordQuery::new(SCOPE, Some(2), 3)).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5, 6]);

        let mut query = RecordQuery::new(SCOPE, None, 100);
        query.offset = 8;
        let tail = store.query_scope(&query).await.unwrap();
        assert_eq!(tail.iter().map(|r| r.id).collect::<Vec<_>>(), vec![10]);
    }

    #[tokio::test]
    async fn test_soft_delete_counts_only_changes() {
        let store = InMemoryStore::new();
        store.seed_records([record(1), record(2)]);

        assert_eq!(store.soft_delete(&[1, 2, 77], 5).await.unwrap(), 2);
        assert_eq!(store.soft_delete(&[1], 6).await.unwrap(), 0);

        let deleted = store.get_record(1).await.unwrap().unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.deleted_at, Some(5));
    }

    #[tokio::test]
    async fn test_replies_to() {
        let store = InMemoryStore::new();
        store.seed_records([record(1), record(2).with_reply_to(1), record(3).with_reply_to(1)]);
        store.soft_delete(&[3], 1).await.unwrap();

        let replies = store.replies_to(1).await.unwrap();
        assert_eq!(replies.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn test_claim_oldest_first_and_never_twice() {
        let store = InMemoryStore::new();
        store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 30).await.unwrap();
        store.insert_staged_record(&record(2), StagingStatus::Pending, 0, 10).await.unwrap();
        store.insert_staged_record(&record(3), StagingStatus::Duplicate, 0, 5).await.unwrap();
        store.insert_staged_record(&record(4), StagingStatus::Pending, 0, 20).await.unwrap();

        let first = store.claim_pending_records(2).await.unwrap();
        let ids: Vec<u64> = first.rows.iter().map(|r| r.record.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(first.rows.iter().all(|r| r.status == StagingStatus::Processing));
        assert!(first.rows.iter().all(|r| r.batch_id.as_deref() == Some(first.batch_id.as_str())));

        let second = store.claim_pending_records(10).await.unwrap();
        assert_eq!(second.rows.iter().map(|r| r.record.id).collect::<Vec<_>>(), vec![1]);
        assert!(store.claim_pending_records(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_insert_conflicts_with_blocking_row() {
        let store = InMemoryStore::new();
        store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 1).await.unwrap();

        let again = store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 2).await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
        // Audit rows are always accepted
        store.insert_staged_record(&record(1), StagingStatus::Duplicate, 0, 3).await.unwrap();

        let attachment = Attachment::new(5, 1, "a.png", "https://cdn/a.png");
        store.insert_staged_attachment(&attachment, AttachmentStatus::Pending, 0, 1).await.unwrap();
        let again = store.insert_staged_attachment(&attachment, AttachmentStatus::Pending, 0, 2).await;
        assert!(matches!(again, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_stale_claims_by_claim_time() {
        let store = InMemoryStore::new();
        store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 1).await.unwrap();
        store.insert_staged_record(&record(2), StagingStatus::Pending, 0, 2).await.unwrap();

        let claimed = store.claim_pending_records(1).await.unwrap();
        let claimed_at = claimed.rows[0].claimed_at.unwrap();

        assert!(store.stale_record_claims(claimed_at - 1).await.unwrap().is_empty());
        let stale = store.stale_record_claims(claimed_at).await.unwrap();
        assert_eq!(stale.iter().map(|r| r.record.id).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn test_status_updates_respect_lifecycle() {
        let store = InMemoryStore::new();
        let staged = store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 1).await.unwrap();

        // Not claimed yet, cannot complete
        assert_eq!(store.complete_staged_records(&[staged.staging_id], 2).await.unwrap(), 0);

        store.claim_pending_records(1).await.unwrap();
        assert_eq!(store.fail_staged_records(&[staged.staging_id], 3, "boom").await.unwrap(), 1);
        // Failed is terminal
        assert_eq!(store.complete_staged_records(&[staged.staging_id], 4).await.unwrap(), 0);

        let row = store.get_staged_record(staged.staging_id).await.unwrap().unwrap();
        assert_eq!(row.status, StagingStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("boom"));
        assert_eq!(row.processed_at, Some(3));
    }

    #[tokio::test]
    async fn test_staged_lookup() {
        let store = InMemoryStore::new();
        store.insert_staged_record(&record(1), StagingStatus::Pending, 0, 1).await.unwrap();
        let failing = store.insert_staged_record(&record(2), StagingStatus::Pending, 2, 2).await.unwrap();
        store.insert_staged_record(&record(3), StagingStatus::Duplicate, 0, 3).await.unwrap();

        // Claim both, fail record 2 only
        store.claim_pending_records(10).await.unwrap();
        store.fail_staged_records(&[failing.staging_id], 4, "x").await.unwrap();

        let lookup = store.staged_record_lookup(&[1, 2, 3]).await.unwrap();
        assert_eq!(lookup.blocking, HashSet::from([1]));
        assert_eq!(lookup.next_retry_count(2), 3);
        assert_eq!(lookup.next_retry_count(3), 0);
    }

    #[tokio::test]
    async fn test_attachment_claim_waits_for_parent() {
        let store = InMemoryStore::new();
        let orphan = Attachment::new(1, 50, "a.png", "https://cdn/a.png");
        let ready = Attachment::new(2, 60, "b.png", "https://cdn/b.png");
        store.insert_staged_attachment(&orphan, AttachmentStatus::Pending, 0, 1).await.unwrap();
        store.insert_staged_attachment(&ready, AttachmentStatus::Pending, 0, 2).await.unwrap();
        store.seed_records([record(60)]);

        let claimed = store.claim_ready_attachments(10).await.unwrap();
        assert_eq!(claimed.rows.len(), 1);
        assert_eq!(claimed.rows[0].attachment.id, 2);

        let stats = store.staging_stats().await.unwrap();
        assert_eq!(stats.attachments_in(AttachmentStatus::Pending), 1);
        assert_eq!(stats.attachments_in(AttachmentStatus::Processing), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_never_lowers_watermark() {
        let store = InMemoryStore::new();
        assert!(store.get_checkpoint(&SCOPE).await.unwrap().is_none());

        store.upsert_checkpoint(&SyncCheckpoint::new(SCOPE, 500, 1)).await.unwrap();
        store.upsert_checkpoint(&SyncCheckpoint::new(SCOPE, 300, 2)).await.unwrap();

        let cp = store.get_checkpoint(&SCOPE).await.unwrap().unwrap();
        assert_eq!(cp.last_message_id, 500);
        assert_eq!(cp.last_synced_at, 2);
    }

    #[tokio::test]
    async fn test_concurrent_transactions_commit_each_id_once() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.bulk_insert(&[record(7)]).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(store.len(), 1);
    }
}
