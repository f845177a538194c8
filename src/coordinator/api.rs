// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public API methods for IngestEngine.
//!
//! Every operation that writes to the store first takes a rate-limit token
//! under the configured [`BackpressurePolicy`](crate::BackpressurePolicy).
//! Token waits happen before any scope lock is taken.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::metrics::LatencyTimer;
use crate::record::{now_millis, Attachment, Record, RecordId, ScopeKey, SyncCheckpoint, MAX_ID};
use crate::staging::StageOutcome;
use crate::storage::traits::StagingStats;
use crate::sync::SyncOutcome;

use super::{Components, DrainOutcome, IngestEngine};

impl IngestEngine {
    /// Take one token for `operation`, waiting per the backpressure policy.
    ///
    /// Shutdown releases waiters with [`IngestError::NotRunning`].
    async fn admit(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> Result<&Components, IngestError> {
        let components = self.running()?;
        let acquired = tokio::select! {
            acquired = self.config.backpressure.acquire(&components.limiter, cancel) => acquired,
            _ = self.shutdown.cancelled() => Err(IngestError::NotRunning),
        };
        match acquired {
            Ok(waited) => {
                if waited > Duration::ZERO {
                    debug!(operation, waited_ms = waited.as_millis() as u64, "Admitted after backpressure wait");
                }
                // Shutdown may have started while we waited
                self.running()
            }
            Err(e) => {
                let e = if self.shutdown.is_cancelled() { IngestError::NotRunning } else { e };
                if e.is_rate_limited() {
                    warn!(operation, "Write refused by rate limiter");
                }
                crate::metrics::record_operation(operation, outcome_label(&e));
                Err(e)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Staging
    // ═══════════════════════════════════════════════════════════════════════════

    /// Stage inbound records for a later commit.
    ///
    /// Returns how many rows became Pending and how many inputs were
    /// duplicates. With `skip_duplicates` false, duplicates are kept as
    /// `Duplicate` staged rows.
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    pub async fn stage_batch(
        &self,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<StageOutcome, IngestError> {
        let _timer = LatencyTimer::new("stage_batch");
        let components = self.admit("stage_batch", &self.shutdown).await?;
        observe(
            "stage_batch",
            components.staging.stage_batch(records, skip_duplicates).await,
        )
    }

    /// Commit one batch of Pending staged records.
    ///
    /// `None` uses `staging_batch_size` from the config. Returns how many
    /// staged rows reached `Completed`.
    #[tracing::instrument(skip(self))]
    pub async fn process_staged_batch(&self, batch_size: Option<usize>) -> Result<usize, IngestError> {
        self.process_staged_batch_with_cancel(batch_size, &CancellationToken::new())
            .await
    }

    /// Like [`process_staged_batch`](Self::process_staged_batch), refusing
    /// to claim a batch once `cancel` fires.
    pub async fn process_staged_batch_with_cancel(
        &self,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<usize, IngestError> {
        let _timer = LatencyTimer::new("process_staged_batch");
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let batch_size = batch_size.unwrap_or(self.config.staging_batch_size);
        let components = self.admit("process_staged_batch", cancel).await?;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        observe(
            "process_staged_batch",
            components.staging.process_staged_batch(batch_size).await,
        )
    }

    /// Commit batches until the staging area has no claimable rows or
    /// `cancel` fires. Committed batches stay committed on cancellation.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn process_all_staged(
        &self,
        batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<DrainOutcome, IngestError> {
        let mut outcome = DrainOutcome::default();
        loop {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            match self.process_staged_batch_with_cancel(batch_size, cancel).await {
                Ok(0) => break,
                Ok(processed) => {
                    outcome.processed += processed;
                    outcome.batches += 1;
                }
                Err(IngestError::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            processed = outcome.processed,
            batches = outcome.batches,
            cancelled = outcome.cancelled,
            "Drained staging area"
        );
        Ok(outcome)
    }

    /// Stage files for `record_id`. Returns how many were staged; duplicates
    /// are skipped.
    #[tracing::instrument(skip(self, attachments), fields(count = attachments.len()))]
    pub async fn stage_attachments(
        &self,
        record_id: RecordId,
        attachments: &[Attachment],
    ) -> Result<usize, IngestError> {
        let _timer = LatencyTimer::new("stage_attachments");
        let components = self.admit("stage_attachments", &self.shutdown).await?;
        observe(
            "stage_attachments",
            components
                .staging
                .stage_attachments(record_id, attachments)
                .await
                .map(|outcome| outcome.staged),
        )
    }

    /// Commit one batch of staged attachments whose parent record exists.
    #[tracing::instrument(skip(self))]
    pub async fn process_staged_attachments(&self, batch_size: Option<usize>) -> Result<usize, IngestError> {
        let _timer = LatencyTimer::new("process_staged_attachments");
        let batch_size = batch_size.unwrap_or(self.config.staging_batch_size);
        let components = self.admit("process_staged_attachments", &self.shutdown).await?;
        observe(
            "process_staged_attachments",
            components.staging.process_staged_attachments(batch_size).await,
        )
    }

    /// Per-status counts of staged records and attachments.
    pub async fn staging_stats(&self) -> Result<StagingStats, IngestError> {
        let components = self.running()?;
        Ok(components.store.staging_stats().await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════════

    /// Count records new to the `(outer_id, inner_id)` scope since its
    /// checkpoint (or since `from_id`) and advance the checkpoint.
    #[tracing::instrument(skip(self))]
    pub async fn sync_scope(
        &self,
        outer_id: u64,
        inner_id: u64,
        from_id: Option<RecordId>,
    ) -> Result<usize, IngestError> {
        let outcome = self
            .sync_scope_with_cancel(ScopeKey::new(outer_id, inner_id), from_id, &CancellationToken::new())
            .await?;
        Ok(outcome.synced)
    }

    /// Sync one scope, stopping before the next page once `cancel` fires.
    pub async fn sync_scope_with_cancel(
        &self,
        scope: ScopeKey,
        from_id: Option<RecordId>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, IngestError> {
        let _timer = LatencyTimer::new("sync_scope");
        let components = self.admit("sync_scope", cancel).await?;
        observe(
            "sync_scope",
            components.sync.sync_scope_with_cancel(scope, from_id, cancel).await,
        )
    }

    /// Current watermark for a scope; `None` if it was never synced.
    pub async fn get_checkpoint(
        &self,
        outer_id: u64,
        inner_id: u64,
    ) -> Result<Option<SyncCheckpoint>, IngestError> {
        let components = self.running()?;
        components.sync.get_checkpoint(ScopeKey::new(outer_id, inner_id)).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Canonical records
    // ═══════════════════════════════════════════════════════════════════════════

    /// Soft-delete canonical records. Returns how many rows changed;
    /// rows already deleted are not counted.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn delete_records(&self, ids: &[RecordId]) -> Result<usize, IngestError> {
        let _timer = LatencyTimer::new("delete_records");
        if ids.is_empty() {
            return Ok(0);
        }
        if ids.contains(&0) {
            return Err(IngestError::Validation("record id must be non-zero".into()));
        }
        if ids.iter().any(|&id| id > MAX_ID) {
            return Err(IngestError::Validation(format!("record id above {}", MAX_ID)));
        }
        let components = self.admit("delete_records", &self.shutdown).await?;
        let deleted = observe(
            "delete_records",
            components
                .store
                .soft_delete(ids, now_millis())
                .await
                .map_err(IngestError::from),
        )?;
        crate::metrics::record_deleted(deleted);
        info!(requested = ids.len(), deleted, "Soft-deleted records");
        Ok(deleted)
    }

    /// Look up a canonical record, deleted or not.
    pub async fn get_record(&self, id: RecordId) -> Result<Option<Record>, IngestError> {
        let components = self.running()?;
        Ok(components.store.get_record(id).await?)
    }

    /// Non-deleted records replying to `parent_id`.
    pub async fn replies_to(&self, parent_id: RecordId) -> Result<Vec<Record>, IngestError> {
        let components = self.running()?;
        Ok(components.store.replies_to(parent_id).await?)
    }
}

fn outcome_label(err: &IngestError) -> &'static str {
    match err {
        IngestError::RateLimited { .. } => "rate_limited",
        IngestError::Cancelled => "cancelled",
        IngestError::Validation(_) => "invalid",
        _ => "error",
    }
}

fn observe<T>(operation: &'static str, result: Result<T, IngestError>) -> Result<T, IngestError> {
    let status = match &result {
        Ok(_) => "success",
        Err(e) => outcome_label(e),
    };
    crate::metrics::record_operation(operation, status);
    result
}
