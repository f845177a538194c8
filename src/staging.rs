// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Staging and deduplication pipeline.
//!
//! Inbound records land in the staging area first:
//!
//! ```text
//! stage_batch ──► dedup (canonical + staged + in-batch) ──► Pending rows
//!                                                              │
//! process_staged_batch ──► claim (Pending → Processing) ◄─────┘
//!                              │
//!                              ▼
//!                  one bulk-insert transaction (bounded retry)
//!                        │                    │
//!                    Completed             Failed (+ error)
//! ```
//!
//! Attachments follow the same path with their own status enum and are only
//! claimable once their parent record has a canonical row.
//!
//! A claim is a lease. Rows left in Processing longer than the lease (the
//! claimer was dropped mid-commit, or could not record the outcome) are
//! recovered before the next claim: rows whose canonical row exists become
//! Completed, the rest Failed so they can be staged again.
//!
//! Dedup check and insert run under one gate, so two concurrent stagings of
//! the same id cannot both see it as new.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::record::{now_millis, Attachment, AttachmentStatus, Record, RecordId, StagingStatus};
use crate::resilience::retry::{retry_transient, RetryConfig};
use crate::storage::traits::{IngestStore, StorageError};

/// How long a claim may stay in Processing before it is recovered.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Result of a staging call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Rows persisted as Pending
    pub staged: usize,
    /// Inputs recognised as duplicates, whether skipped or kept as Duplicate rows
    pub duplicates: usize,
}

/// Rows moved out of an expired claim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveredClaims {
    /// Canonical row was already written; marked Completed
    pub completed: usize,
    /// Marked Failed, eligible for re-staging
    pub failed: usize,
}

impl RecoveredClaims {
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

pub struct StagingPipeline {
    store: Arc<dyn IngestStore>,
    commit_retry: RetryConfig,
    claim_lease: Duration,
    gate: Mutex<()>,
}

impl StagingPipeline {
    pub fn new(store: Arc<dyn IngestStore>, commit_retry: RetryConfig) -> Self {
        Self {
            store,
            commit_retry,
            claim_lease: DEFAULT_CLAIM_LEASE,
            gate: Mutex::new(()),
        }
    }

    /// Must exceed the longest commit, retries included, or live claims
    /// get recovered under their owner.
    #[must_use]
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn lease_cutoff(&self) -> i64 {
        now_millis().saturating_sub(self.claim_lease.as_millis() as i64)
    }

    /// Stage `records`, deduplicating against the canonical store, against
    /// Pending/Processing/Completed staged rows and within the batch itself.
    ///
    /// With `skip_duplicates` false, duplicates are kept as `Duplicate` rows
    /// for the audit trail; they are never committed either way. The call is
    /// not atomic across the batch: a store failure part-way leaves the rows
    /// already staged in place.
    pub async fn stage_batch(
        &self,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<StageOutcome, IngestError> {
        if records.is_empty() {
            return Ok(StageOutcome::default());
        }
        for record in records {
            record.validate().map_err(IngestError::Validation)?;
        }

        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let _gate = self.gate.lock().await;

        let existing = self.store.find_existing(&ids).await?;
        let lookup = self.store.staged_record_lookup(&ids).await?;

        let staged_at = now_millis();
        let mut seen = HashSet::with_capacity(records.len());
        let mut outcome = StageOutcome::default();

        for record in records {
            let duplicate = existing.contains(&record.id)
                || lookup.blocking.contains(&record.id)
                || !seen.insert(record.id);

            if duplicate {
                outcome.duplicates += 1;
                if !skip_duplicates {
                    self.store
                        .insert_staged_record(record, StagingStatus::Duplicate, 0, staged_at)
                        .await?;
                }
                continue;
            }

            let retry_count = lookup.next_retry_count(record.id);
            if retry_count > 0 {
                debug!(record_id = record.id, retry_count, "Re-staging previously failed record");
            }
            match self
                .store
                .insert_staged_record(record, StagingStatus::Pending, retry_count, staged_at)
                .await
            {
                Ok(_) => outcome.staged += 1,
                // Staged by another writer since the lookup
                Err(StorageError::Conflict(_)) => outcome.duplicates += 1,
                Err(e) => return Err(e.into()),
            }
        }

        crate::metrics::record_staged("record", outcome.staged);
        crate::metrics::record_duplicates("record", outcome.duplicates);
        info!(
            received = records.len(),
            staged = outcome.staged,
            duplicates = outcome.duplicates,
            "Staged record batch"
        );
        Ok(outcome)
    }

    /// Commit up to `batch_size` Pending rows, oldest first, in one
    /// transaction. Returns how many staged rows reached `Completed`.
    ///
    /// Transient store failures are retried under the commit retry policy.
    /// Once retries run out every claimed row is marked `Failed` with the
    /// final error, and that error is returned. Expired claims are recovered
    /// first.
    pub async fn process_staged_batch(&self, batch_size: usize) -> Result<usize, IngestError> {
        if batch_size == 0 {
            return Err(IngestError::Validation("batch_size must be positive".into()));
        }
        self.recover_record_claims().await?;

        let claim = self.store.claim_pending_records(batch_size).await?;
        if claim.is_empty() {
            return Ok(0);
        }
        crate::metrics::record_batch_size("record", claim.len());
        debug!(batch_id = %claim.batch_id, rows = claim.len(), "Claimed staged records");

        let staging_ids: Vec<u64> = claim.rows.iter().map(|r| r.staging_id).collect();
        let records: Vec<Record> = claim.rows.iter().map(|r| r.record.clone()).collect();

        let result = retry_transient("commit_staged_records", &self.commit_retry, || async {
            // A previous attempt may have committed before its reply was lost
            let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
            let existing = self.store.find_existing(&ids).await?;
            let mut picked = HashSet::with_capacity(records.len());
            let fresh: Vec<Record> = records
                .iter()
                .filter(|r| !existing.contains(&r.id) && picked.insert(r.id))
                .cloned()
                .collect();
            if fresh.is_empty() {
                return Ok(0);
            }
            self.store.bulk_insert(&fresh).await
        })
        .await;

        let processed_at = now_millis();
        match result {
            Ok(inserted) => {
                let completed = self
                    .store
                    .complete_staged_records(&staging_ids, processed_at)
                    .await?;
                crate::metrics::record_committed("record", completed);
                info!(
                    batch_id = %claim.batch_id,
                    inserted,
                    completed,
                    "Committed staged record batch"
                );
                Ok(completed)
            }
            Err(e) => {
                let message = e.to_string();
                match self
                    .store
                    .fail_staged_records(&staging_ids, processed_at, &message)
                    .await
                {
                    Ok(failed) => crate::metrics::record_commit_failed("record", failed),
                    Err(mark_err) => warn!(
                        batch_id = %claim.batch_id,
                        error = %mark_err,
                        "Could not mark staged records Failed; left for claim recovery"
                    ),
                }
                warn!(
                    batch_id = %claim.batch_id,
                    rows = staging_ids.len(),
                    error = %message,
                    "Staged record batch failed"
                );
                Err(e.into())
            }
        }
    }

    /// Stage files for `record_id`. Every attachment must reference that
    /// record. Duplicates are always skipped.
    pub async fn stage_attachments(
        &self,
        record_id: RecordId,
        attachments: &[Attachment],
    ) -> Result<StageOutcome, IngestError> {
        if record_id == 0 {
            return Err(IngestError::Validation("record id must be non-zero".into()));
        }
        if attachments.is_empty() {
            return Ok(StageOutcome::default());
        }
        for attachment in attachments {
            attachment.validate().map_err(IngestError::Validation)?;
            if attachment.record_id != record_id {
                return Err(IngestError::Validation(format!(
                    "attachment {} belongs to record {}, not {}",
                    attachment.id, attachment.record_id, record_id
                )));
            }
        }

        let ids: Vec<u64> = attachments.iter().map(|a| a.id).collect();
        let _gate = self.gate.lock().await;

        let existing = self.store.find_existing_attachments(&ids).await?;
        let lookup = self.store.staged_attachment_lookup(&ids).await?;

        let staged_at = now_millis();
        let mut seen = HashSet::with_capacity(attachments.len());
        let mut outcome = StageOutcome::default();

        for attachment in attachments {
            if existing.contains(&attachment.id)
                || lookup.blocking.contains(&attachment.id)
                || !seen.insert(attachment.id)
            {
                outcome.duplicates += 1;
                continue;
            }
            match self
                .store
                .insert_staged_attachment(
                    attachment,
                    AttachmentStatus::Pending,
                    lookup.next_retry_count(attachment.id),
                    staged_at,
                )
                .await
            {
                Ok(_) => outcome.staged += 1,
                Err(StorageError::Conflict(_)) => outcome.duplicates += 1,
                Err(e) => return Err(e.into()),
            }
        }

        crate::metrics::record_staged("attachment", outcome.staged);
        crate::metrics::record_duplicates("attachment", outcome.duplicates);
        info!(
            record_id,
            staged = outcome.staged,
            duplicates = outcome.duplicates,
            "Staged attachments"
        );
        Ok(outcome)
    }

    /// Commit up to `batch_size` Pending attachments whose parent record is
    /// already canonical. Attachments for missing parents stay Pending.
    pub async fn process_staged_attachments(&self, batch_size: usize) -> Result<usize, IngestError> {
        if batch_size == 0 {
            return Err(IngestError::Validation("batch_size must be positive".into()));
        }
        self.recover_attachment_claims().await?;

        let claim = self.store.claim_ready_attachments(batch_size).await?;
        if claim.is_empty() {
            return Ok(0);
        }
        crate::metrics::record_batch_size("attachment", claim.len());

        let staging_ids: Vec<u64> = claim.rows.iter().map(|r| r.staging_id).collect();
        let attachments: Vec<Attachment> = claim.rows.iter().map(|r| r.attachment.clone()).collect();

        let result = retry_transient("commit_staged_attachments", &self.commit_retry, || async {
            let ids: Vec<u64> = attachments.iter().map(|a| a.id).collect();
            let existing = self.store.find_existing_attachments(&ids).await?;
            let mut picked = HashSet::with_capacity(attachments.len());
            let fresh: Vec<Attachment> = attachments
                .iter()
                .filter(|a| !existing.contains(&a.id) && picked.insert(a.id))
                .cloned()
                .collect();
            if fresh.is_empty() {
                return Ok(0);
            }
            self.store.bulk_insert_attachments(&fresh).await
        })
        .await;

        let processed_at = now_millis();
        match result {
            Ok(inserted) => {
                let completed = self
                    .store
                    .complete_staged_attachments(&staging_ids, processed_at)
                    .await?;
                crate::metrics::record_committed("attachment", completed);
                info!(batch_id = %claim.batch_id, inserted, completed, "Committed staged attachments");
                Ok(completed)
            }
            Err(e) => {
                let message = e.to_string();
                match self
                    .store
                    .fail_staged_attachments(&staging_ids, processed_at, &message)
                    .await
                {
                    Ok(failed) => crate::metrics::record_commit_failed("attachment", failed),
                    Err(mark_err) => warn!(
                        batch_id = %claim.batch_id,
                        error = %mark_err,
                        "Could not mark staged attachments Failed; left for claim recovery"
                    ),
                }
                warn!(batch_id = %claim.batch_id, error = %message, "Staged attachment batch failed");
                Err(e.into())
            }
        }
    }
}

impl StagingPipeline {
    /// Recover record and attachment claims older than the lease.
    pub async fn recover_expired_claims(&self) -> Result<RecoveredClaims, IngestError> {
        let records = self.recover_record_claims().await?;
        let attachments = self.recover_attachment_claims().await?;
        Ok(RecoveredClaims {
            completed: records.completed + attachments.completed,
            failed: records.failed + attachments.failed,
        })
    }

    async fn recover_record_claims(&self) -> Result<RecoveredClaims, IngestError> {
        let stale = self.store.stale_record_claims(self.lease_cutoff()).await?;
        if stale.is_empty() {
            return Ok(RecoveredClaims::default());
        }

        let ids: Vec<RecordId> = stale.iter().map(|r| r.record.id).collect();
        let existing = self.store.find_existing(&ids).await?;
        let (done, lost): (Vec<_>, Vec<_>) =
            stale.iter().partition(|r| existing.contains(&r.record.id));

        let now = now_millis();
        let done: Vec<u64> = done.iter().map(|r| r.staging_id).collect();
        let lost: Vec<u64> = lost.iter().map(|r| r.staging_id).collect();
        let recovered = RecoveredClaims {
            completed: self.store.complete_staged_records(&done, now).await?,
            failed: self
                .store
                .fail_staged_records(&lost, now, "claim expired before commit finished")
                .await?,
        };

        crate::metrics::record_claims_recovered("record", recovered.total());
        warn!(
            completed = recovered.completed,
            failed = recovered.failed,
            "Recovered expired staged record claims"
        );
        Ok(recovered)
    }

    async fn recover_attachment_claims(&self) -> Result<RecoveredClaims, IngestError> {
        let stale = self.store.stale_attachment_claims(self.lease_cutoff()).await?;
        if stale.is_empty() {
            return Ok(RecoveredClaims::default());
        }

        let ids: Vec<u64> = stale.iter().map(|a| a.attachment.id).collect();
        let existing = self.store.find_existing_attachments(&ids).await?;
        let (done, lost): (Vec<_>, Vec<_>) =
            stale.iter().partition(|a| existing.contains(&a.attachment.id));

        let now = now_millis();
        let done: Vec<u64> = done.iter().map(|a| a.staging_id).collect();
        let lost: Vec<u64> = lost.iter().map(|a| a.staging_id).collect();
        let recovered = RecoveredClaims {
            completed: self.store.complete_staged_attachments(&done, now).await?,
            failed: self
                .store
                .fail_staged_attachments(&lost, now, "claim expired before commit finished")
                .await?,
        };

        crate::metrics::record_claims_recovered("attachment", recovered.total());
        warn!(
            completed = recovered.completed,
            failed = recovered.failed,
            "Recovered expired staged attachment claims"
        );
        Ok(recovered)
    }
}
