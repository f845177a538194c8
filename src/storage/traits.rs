// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage contracts.
//!
//! Three traits split the backing store by table family:
//! - [`RecordStore`]: canonical records and attachments, transactional bulk insert
//! - [`StagingStore`]: staged rows and their status lifecycle
//! - [`CheckpointStore`]: per-scope sync watermarks
//!
//! [`IngestStore`] is implemented for anything providing all three.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{
    Attachment, AttachmentId, AttachmentStatus, Record, RecordId, ScopeKey, StagedAttachment,
    StagedRecord, StagingStatus, SyncCheckpoint,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    /// Non-retryable backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Timeout, lock wait, pool exhaustion
    #[error("transient storage failure: {0}")]
    Transient(String),
    /// Unique-key or optimistic-concurrency conflict
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("invalid stored data: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Errors worth retrying at the call site that issued the write.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }
}

/// One page of a scope scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub scope: ScopeKey,
    /// Exclusive lower bound on record id; `None` scans from the start
    pub id_greater_than: Option<RecordId>,
    pub offset: u64,
    pub limit: usize,
    pub exclude_deleted: bool,
}

impl RecordQuery {
    #[must_use]
    pub fn new(scope: ScopeKey, id_greater_than: Option<RecordId>, limit: usize) -> Self {
        Self {
            scope,
            id_greater_than,
            offset: 0,
            limit,
            exclude_deleted: true,
        }
    }

    /// Whether `record` falls inside this query's filter (ignoring paging).
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        record.scope() == self.scope
            && self.id_greater_than.map_or(true, |lower| record.id > lower)
            && !(self.exclude_deleted && record.is_deleted)
    }
}

/// Canonical-store transaction. Inserts are invisible until
/// [`commit`](Self::commit); dropping without commit discards them.
#[async_trait]
pub trait RecordTransaction: Send {
    /// Insert new canonical records. A key that already exists fails the
    /// call with [`StorageError::Conflict`].
    async fn insert_records(&mut self, records: &[Record]) -> Result<usize, StorageError>;

    async fn insert_attachments(&mut self, attachments: &[Attachment]) -> Result<usize, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Subset of `ids` with a canonical row (deleted rows included).
    async fn find_existing(&self, ids: &[RecordId]) -> Result<HashSet<RecordId>, StorageError>;

    async fn find_existing_attachments(
        &self,
        ids: &[AttachmentId],
    ) -> Result<HashSet<AttachmentId>, StorageError>;

    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError>;

    /// Page of records in scope ordered by id ascending.
    async fn query_scope(&self, query: &RecordQuery) -> Result<Vec<Record>, StorageError>;

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, StorageError>;

    /// Non-deleted records whose `reply_to_id` is `parent_id`, ordered by id.
    async fn replies_to(&self, parent_id: RecordId) -> Result<Vec<Record>, StorageError>;

    /// Mark records deleted. Returns how many rows changed; already-deleted
    /// and unknown ids are not counted.
    async fn soft_delete(&self, ids: &[RecordId], deleted_at: i64) -> Result<usize, StorageError>;

    /// Insert in a single transaction: all rows land or none do.
    async fn bulk_insert(&self, records: &[Record]) -> Result<usize, StorageError> {
        let mut tx = self.begin().await?;
        match tx.insert_records(records).await {
            Ok(written) => {
                tx.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed bulk insert also failed");
                }
                Err(e)
            }
        }
    }

    /// Attachment counterpart of [`bulk_insert`](Self::bulk_insert).
    async fn bulk_insert_attachments(&self, attachments: &[Attachment]) -> Result<usize, StorageError> {
        let mut tx = self.begin().await?;
        match tx.insert_attachments(attachments).await {
            Ok(written) => {
                tx.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback after failed attachment insert also failed");
                }
                Err(e)
            }
        }
    }
}

/// What the staging area already knows about a set of record ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StagedLookup {
    /// Ids with a Pending, Processing or Completed row
    pub blocking: HashSet<u64>,
    /// Highest `retry_count` among Failed rows, per id
    pub failed_attempts: HashMap<u64, u32>,
}

impl StagedLookup {
    /// Retry count for a fresh staging of `id`.
    #[must_use]
    pub fn next_retry_count(&self, id: u64) -> u32 {
        self.failed_attempts.get(&id).map_or(0, |n| n + 1)
    }
}

/// Rows moved from Pending to Processing by one claim.
#[derive(Debug, Clone)]
pub struct ClaimedBatch<T> {
    pub batch_id: String,
    pub rows: Vec<T>,
}

impl<T> ClaimedBatch<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Row counts per status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StagingStats {
    pub records: HashMap<StagingStatus, u64>,
    pub attachments: HashMap<AttachmentStatus, u64>,
}

impl StagingStats {
    #[must_use]
    pub fn records_in(&self, status: StagingStatus) -> u64 {
        self.records.get(&status).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn attachments_in(&self, status: AttachmentStatus) -> u64 {
        self.attachments.get(&status).copied().unwrap_or(0)
    }
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Persist one staged row, returning it with its store-generated id.
    ///
    /// A `Pending` row for an id that already has a Pending, Processing or
    /// Completed row fails with [`StorageError::Conflict`]. Not retried by
    /// implementations: a lost reply must not stage the record twice.
    async fn insert_staged_record(
        &self,
        record: &Record,
        status: StagingStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedRecord, StorageError>;

    async fn staged_record_lookup(&self, ids: &[RecordId]) -> Result<StagedLookup, StorageError>;

    /// Atomically move up to `limit` Pending rows, oldest first, to
    /// Processing and stamp `claimed_at`. Concurrent claims never return the
    /// same row.
    async fn claim_pending_records(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedRecord>, StorageError>;

    /// Processing rows claimed at or before `claimed_before` (epoch millis).
    async fn stale_record_claims(&self, claimed_before: i64) -> Result<Vec<StagedRecord>, StorageError>;

    /// Processing → Completed. Returns rows changed.
    async fn complete_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError>;

    /// Processing → Failed with the captured message. Returns rows changed.
    async fn fail_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError>;

    async fn get_staged_record(&self, staging_id: u64) -> Result<Option<StagedRecord>, StorageError>;

    /// Same conflict rule as [`insert_staged_record`](Self::insert_staged_record).
    async fn insert_staged_attachment(
        &self,
        attachment: &Attachment,
        status: AttachmentStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedAttachment, StorageError>;

    async fn staged_attachment_lookup(
        &self,
        ids: &[AttachmentId],
    ) -> Result<StagedLookup, StorageError>;

    /// Like [`claim_pending_records`](Self::claim_pending_records), but only
    /// rows whose parent record already has a canonical row are eligible.
    async fn claim_ready_attachments(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedAttachment>, StorageError>;

    async fn stale_attachment_claims(
        &self,
        claimed_before: i64,
    ) -> Result<Vec<StagedAttachment>, StorageError>;

    async fn complete_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError>;

    async fn fail_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError>;

    async fn staging_stats(&self) -> Result<StagingStats, StorageError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, scope: &ScopeKey) -> Result<Option<SyncCheckpoint>, StorageError>;

    /// Create or update. The stored `last_message_id` never decreases.
    async fn upsert_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StorageError>;
}

/// Everything the ingestion engine needs from one backend.
pub trait IngestStore: RecordStore + StagingStore + CheckpointStore {}

impl<T: RecordStore + StagingStore + CheckpointStore + ?Sized> IngestStore for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Transient("pool timed out".into()).is_transient());
        assert!(StorageError::Conflict("duplicate key".into()).is_transient());
        assert!(!StorageError::Backend("no such table".into()).is_transient());
        assert!(!StorageError::NotFound.is_transient());
    }

    #[test]
    fn test_query_matches() {
        let scope = ScopeKey::new(1, 2);
        let query = RecordQuery::new(scope, Some(10), 100);

        assert!(query.matches(&Record::new(11, scope, 1, "a")));
        assert!(!query.matches(&Record::new(10, scope, 1, "a")));
        assert!(!query.matches(&Record::new(11, ScopeKey::new(1, 3), 1, "a")));

        let mut deleted = Record::new(12, scope, 1, "a");
        deleted.is_deleted = true;
        assert!(!query.matches(&deleted));

        let unbounded = RecordQuery { exclude_deleted: false, ..RecordQuery::new(scope, None, 10) };
        assert!(unbounded.matches(&deleted));
    }

    #[test]
    fn test_next_retry_count() {
        let mut lookup = StagedLookup::default();
        assert_eq!(lookup.next_retry_count(5), 0);
        lookup.failed_attempts.insert(5, 0);
        assert_eq!(lookup.next_retry_count(5), 1);
        lookup.failed_attempts.insert(5, 3);
        assert_eq!(lookup.next_retry_count(5), 4);
    }
}
