// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Schema:
//! ```sql
//! CREATE TABLE records (
//!   id BIGINT PRIMARY KEY,
//!   outer_id BIGINT, inner_id BIGINT, author_id BIGINT,
//!   content TEXT, secondary_content TEXT,
//!   created_at BIGINT, edited_at BIGINT, deleted_at BIGINT,
//!   is_deleted INTEGER, reply_to_id BIGINT
//! )
//! CREATE TABLE staged_records (
//!   staging_id  AUTOINCREMENT,
//!   record_id   BIGINT,
//!   payload     TEXT,        -- record as JSON
//!   status      TEXT,        -- pending | processing | completed | failed | duplicate
//!   staged_at, processed_at, error, retry_count,
//!   batch_id    TEXT,        -- claim token
//!   claimed_at  BIGINT       -- when the claim was taken, for lease recovery
//! )
//! CREATE TABLE attachments (...)
//! CREATE TABLE staged_attachments (... attachment_id, record_id ...)
//! CREATE TABLE sync_checkpoints (
//!   id TEXT PRIMARY KEY,     -- "outer:inner"
//!   outer_id, inner_id, last_message_id, last_synced_at
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver has no unsigned integers, so ids are bound as `i64`.
//! MySQL TEXT columns may come back as bytes; [`text_col`] reads either.

use std::collections::{HashMap, HashSet};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};

use super::traits::{
    CheckpointStore, ClaimedBatch, RecordQuery, RecordStore, RecordTransaction, StagedLookup,
    StagingStats, StagingStore, StorageError,
};
use crate::record::{
    now_millis, Attachment, AttachmentId, AttachmentStatus, Record, RecordId, ScopeKey,
    StagedAttachment, StagedRecord, StagingStatus, SyncCheckpoint,
};
use crate::resilience::retry::{retry, retry_transient, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Keeps multi-row statements well under MySQL's `max_allowed_packet` and
/// SQLite's bound-variable limit.
const CHUNK_SIZE: usize = 500;

const RECORD_COLUMNS: &str = "id, outer_id, inner_id, author_id, content, secondary_content, \
     created_at, edited_at, deleted_at, is_deleted, reply_to_id";

const STAGED_RECORD_COLUMNS: &str =
    "staging_id, payload, status, staged_at, processed_at, error, retry_count, batch_id, claimed_at";

const STAGED_ATTACHMENT_COLUMNS: &str =
    "staging_id, payload, status, staged_at, processed_at, error, retry_count, batch_id, claimed_at";

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id INTEGER PRIMARY KEY,
        outer_id INTEGER NOT NULL,
        inner_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        secondary_content TEXT,
        created_at INTEGER NOT NULL,
        edited_at INTEGER,
        deleted_at INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        reply_to_id INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_scope ON records (outer_id, inner_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_records_reply ON records (reply_to_id)",
    r#"
    CREATE TABLE IF NOT EXISTS staged_records (
        staging_id INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id INTEGER NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        staged_at INTEGER NOT NULL,
        processed_at INTEGER,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        batch_id TEXT,
        claimed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staged_records_status ON staged_records (status, staged_at)",
    "CREATE INDEX IF NOT EXISTS idx_staged_records_record ON staged_records (record_id)",
    "CREATE INDEX IF NOT EXISTS idx_staged_records_batch ON staged_records (batch_id)",
    r#"
    CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY,
        record_id INTEGER NOT NULL,
        file_name TEXT NOT NULL,
        url TEXT NOT NULL,
        content_type TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staged_attachments (
        staging_id INTEGER PRIMARY KEY AUTOINCREMENT,
        attachment_id INTEGER NOT NULL,
        record_id INTEGER NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        staged_at INTEGER NOT NULL,
        processed_at INTEGER,
        error TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        batch_id TEXT,
        claimed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_staged_attachments_status ON staged_attachments (status, staged_at)",
    "CREATE INDEX IF NOT EXISTS idx_staged_attachments_attachment ON staged_attachments (attachment_id)",
    "CREATE INDEX IF NOT EXISTS idx_staged_attachments_batch ON staged_attachments (batch_id)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoints (
        id TEXT PRIMARY KEY,
        outer_id INTEGER NOT NULL,
        inner_id INTEGER NOT NULL,
        last_message_id INTEGER NOT NULL,
        last_synced_at INTEGER NOT NULL
    )
    "#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id BIGINT PRIMARY KEY,
        outer_id BIGINT NOT NULL,
        inner_id BIGINT NOT NULL,
        author_id BIGINT NOT NULL,
        content LONGTEXT NOT NULL,
        secondary_content LONGTEXT,
        created_at BIGINT NOT NULL,
        edited_at BIGINT,
        deleted_at BIGINT,
        is_deleted BIGINT NOT NULL DEFAULT 0,
        reply_to_id BIGINT,
        INDEX idx_records_scope (outer_id, inner_id, id),
        INDEX idx_records_reply (reply_to_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staged_records (
        staging_id BIGINT AUTO_INCREMENT PRIMARY KEY,
        record_id BIGINT NOT NULL,
        payload LONGTEXT NOT NULL,
        status VARCHAR(16) NOT NULL,
        staged_at BIGINT NOT NULL,
        processed_at BIGINT,
        error TEXT,
        retry_count BIGINT NOT NULL DEFAULT 0,
        batch_id VARCHAR(36),
        claimed_at BIGINT,
        INDEX idx_staged_records_status (status, staged_at),
        INDEX idx_staged_records_record (record_id),
        INDEX idx_staged_records_batch (batch_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS attachments (
        id BIGINT PRIMARY KEY,
        record_id BIGINT NOT NULL,
        file_name TEXT NOT NULL,
        url TEXT NOT NULL,
        content_type VARCHAR(255),
        size_bytes BIGINT NOT NULL DEFAULT 0,
        INDEX idx_attachments_record (record_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staged_attachments (
        staging_id BIGINT AUTO_INCREMENT PRIMARY KEY,
        attachment_id BIGINT NOT NULL,
        record_id BIGINT NOT NULL,
        payload LONGTEXT NOT NULL,
        status VARCHAR(16) NOT NULL,
        staged_at BIGINT NOT NULL,
        processed_at BIGINT,
        error TEXT,
        retry_count BIGINT NOT NULL DEFAULT 0,
        batch_id VARCHAR(36),
        claimed_at BIGINT,
        INDEX idx_staged_attachments_status (status, staged_at),
        INDEX idx_staged_attachments_attachment (attachment_id),
        INDEX idx_staged_attachments_batch (batch_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_checkpoints (
        id VARCHAR(64) PRIMARY KEY,
        outer_id BIGINT NOT NULL,
        inner_id BIGINT NOT NULL,
        last_message_id BIGINT NOT NULL,
        last_synced_at BIGINT NOT NULL
    )
    "#,
];

/// Classify a driver error. Lock waits and pool exhaustion are transient;
/// unique-key violations are conflicts.
fn map_sqlx_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StorageError::Transient(e.to_string()),
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return StorageError::Conflict(db.message().to_string());
            }
            let msg = db.message();
            if msg.contains("locked") || msg.contains("busy") || msg.contains("Deadlock")
                || msg.contains("Lock wait timeout")
            {
                StorageError::Transient(msg.to_string())
            } else {
                StorageError::Backend(msg.to_string())
            }
        }
        _ => StorageError::Backend(e.to_string()),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Read a text column as String first (SQLite TEXT), then as bytes (MySQL LONGTEXT).
fn text_col(row: &AnyRow, col: &str) -> Option<String> {
    row.try_get::<String, _>(col).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(col)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn int_col(row: &AnyRow, col: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(col)
        .map_err(|e| StorageError::Corrupt(format!("column {}: {}", col, e)))
}

fn opt_int_col(row: &AnyRow, col: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(col).ok().flatten()
}

fn record_from_row(row: &AnyRow) -> Result<Record, StorageError> {
    Ok(Record {
        id: int_col(row, "id")? as u64,
        outer_id: int_col(row, "outer_id")? as u64,
        inner_id: int_col(row, "inner_id")? as u64,
        author_id: int_col(row, "author_id")? as u64,
        content: text_col(row, "content").unwrap_or_default(),
        secondary_content: text_col(row, "secondary_content"),
        created_at: int_col(row, "created_at")?,
        edited_at: opt_int_col(row, "edited_at"),
        deleted_at: opt_int_col(row, "deleted_at"),
        is_deleted: int_col(row, "is_deleted")? != 0,
        reply_to_id: opt_int_col(row, "reply_to_id").map(|id| id as u64),
    })
}

/// Columns shared by both staged tables.
struct StagedColumns {
    staging_id: u64,
    payload: String,
    status: String,
    staged_at: i64,
    processed_at: Option<i64>,
    error: Option<String>,
    retry_count: u32,
    batch_id: Option<String>,
    claimed_at: Option<i64>,
}

impl StagedColumns {
    fn from_row(row: &AnyRow) -> Result<Self, StorageError> {
        Ok(Self {
            staging_id: int_col(row, "staging_id")? as u64,
            payload: text_col(row, "payload")
                .ok_or_else(|| StorageError::Corrupt("staged row without payload".into()))?,
            status: text_col(row, "status")
                .ok_or_else(|| StorageError::Corrupt("staged row without status".into()))?,
            staged_at: int_col(row, "staged_at")?,
            processed_at: opt_int_col(row, "processed_at"),
            error: text_col(row, "error"),
            retry_count: int_col(row, "retry_count")? as u32,
            batch_id: text_col(row, "batch_id"),
            claimed_at: opt_int_col(row, "claimed_at"),
        })
    }
}

fn staged_record_from_row(row: &AnyRow) -> Result<StagedRecord, StorageError> {
    let cols = StagedColumns::from_row(row)?;
    let record: Record = serde_json::from_str(&cols.payload)
        .map_err(|e| StorageError::Corrupt(format!("staged record {}: {}", cols.staging_id, e)))?;
    let status = StagingStatus::parse(&cols.status)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown staging status '{}'", cols.status)))?;
    Ok(StagedRecord {
        staging_id: cols.staging_id,
        record,
        status,
        staged_at: cols.staged_at,
        processed_at: cols.processed_at,
        error: cols.error,
        retry_count: cols.retry_count,
        batch_id: cols.batch_id,
        claimed_at: cols.claimed_at,
    })
}

fn staged_attachment_from_row(row: &AnyRow) -> Result<StagedAttachment, StorageError> {
    let cols = StagedColumns::from_row(row)?;
    let attachment: Attachment = serde_json::from_str(&cols.payload).map_err(|e| {
        StorageError::Corrupt(format!("staged attachment {}: {}", cols.staging_id, e))
    })?;
    let status = AttachmentStatus::parse(&cols.status).ok_or_else(|| {
        StorageError::Corrupt(format!("unknown attachment status '{}'", cols.status))
    })?;
    Ok(StagedAttachment {
        staging_id: cols.staging_id,
        attachment,
        status,
        staged_at: cols.staged_at,
        processed_at: cols.processed_at,
        error: cols.error,
        retry_count: cols.retry_count,
        batch_id: cols.batch_id,
        claimed_at: cols.claimed_at,
    })
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 8 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        tracing::info!(sqlite = is_sqlite, "SQL store ready");
        Ok(store)
    }

    /// Concurrent readers during writes, single fsync per commit.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    /// Ids of `table` present in `ids`, queried in chunks.
    async fn existing_ids(
        &self,
        table: &str,
        ids: &[u64],
    ) -> Result<HashSet<u64>, StorageError> {
        let mut found = HashSet::new();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!("SELECT id FROM {} WHERE id IN ({})", table, placeholders(chunk.len()));
            let rows = retry_transient("sql_find_existing", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(*id as i64);
                }
                query.fetch_all(&self.pool).await.map_err(map_sqlx_err)
            })
            .await?;

            for row in rows {
                found.insert(int_col(&row, "id")? as u64);
            }
        }
        Ok(found)
    }

    /// Fold staged-row statuses for `id_column IN ids` into a lookup.
    async fn lookup_staged(
        &self,
        table: &str,
        id_column: &str,
        ids: &[u64],
    ) -> Result<StagedLookup, StorageError> {
        let mut lookup = StagedLookup::default();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "SELECT {col} AS lookup_id, status, retry_count FROM {table} WHERE {col} IN ({})",
                placeholders(chunk.len()),
                col = id_column,
                table = table,
            );
            let rows = retry_transient("sql_staged_lookup", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(*id as i64);
                }
                query.fetch_all(&self.pool).await.map_err(map_sqlx_err)
            })
            .await?;

            for row in rows {
                let id = int_col(&row, "lookup_id")? as u64;
                let status = text_col(&row, "status").unwrap_or_default();
                let retry_count = int_col(&row, "retry_count")? as u32;
                match StagingStatus::parse(&status) {
                    Some(s) if s.blocks_restaging() => {
                        lookup.blocking.insert(id);
                    }
                    Some(StagingStatus::Failed) => {
                        let entry = lookup.failed_attempts.entry(id).or_insert(retry_count);
                        *entry = (*entry).max(retry_count);
                    }
                    Some(_) => {}
                    None => {
                        return Err(StorageError::Corrupt(format!(
                            "unknown staging status '{}'",
                            status
                        )))
                    }
                }
            }
        }
        Ok(lookup)
    }

    /// Move up to `limit` claimable rows to Processing under a fresh batch id
    /// and return them. The conditional UPDATE guarantees a row is won by
    /// exactly one claimer even when candidate SELECTs overlap.
    async fn claim(
        &self,
        table: &str,
        candidates_sql: &str,
        columns: &str,
        limit: usize,
    ) -> Result<(String, Vec<AnyRow>), StorageError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        if limit == 0 {
            return Ok((batch_id, Vec::new()));
        }
        let claimed_at = now_millis();
        let batch = batch_id.as_str();

        let rows = retry_transient("sql_claim", &RetryConfig::query(), move || {
            self.claim_attempt(table, candidates_sql, columns, batch, claimed_at, limit)
        })
        .await?;

        Ok((batch_id, rows))
    }

    /// One claim attempt under `batch_id`. Rows already held by the batch
    /// count against `limit`, so repeating the attempt after a lost reply
    /// tops the batch up instead of growing it.
    async fn claim_attempt(
        &self,
        table: &str,
        candidates_sql: &str,
        columns: &str,
        batch_id: &str,
        claimed_at: i64,
        limit: usize,
    ) -> Result<Vec<AnyRow>, StorageError> {
        let held_sql = format!("SELECT COUNT(*) AS cnt FROM {} WHERE batch_id = ?", table);
        let held = sqlx::query(&held_sql)
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        let wanted = limit.saturating_sub(int_col(&held, "cnt")? as usize);

        if wanted > 0 {
            let candidates = sqlx::query(candidates_sql)
                .bind(wanted as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

            let mut ids = Vec::with_capacity(candidates.len());
            for row in &candidates {
                ids.push(int_col(row, "staging_id")?);
            }

            if !ids.is_empty() {
                let sql = format!(
                    "UPDATE {} SET status = 'processing', batch_id = ?, claimed_at = ? \
                     WHERE status = 'pending' AND staging_id IN ({})",
                    table,
                    placeholders(ids.len())
                );
                let mut query = sqlx::query(&sql).bind(batch_id).bind(claimed_at);
                for id in &ids {
                    query = query.bind(*id);
                }
                query.execute(&self.pool).await.map_err(map_sqlx_err)?;
            }
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE batch_id = ? ORDER BY staged_at ASC, staging_id ASC",
            columns, table
        );
        sqlx::query(&sql)
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    /// Processing rows of `table` claimed at or before `claimed_before`.
    async fn stale_claims(
        &self,
        table: &str,
        columns: &str,
        claimed_before: i64,
    ) -> Result<Vec<AnyRow>, StorageError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE status = 'processing' \
             AND (claimed_at IS NULL OR claimed_at <= ?) ORDER BY staging_id ASC",
            columns, table
        );
        retry_transient("sql_stale_claims", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(claimed_before)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await
    }

    /// `INSERT ... SELECT` that only lands when no Pending, Processing or
    /// Completed row exists for the key bound last, matched on `key_column`.
    fn conditional_insert_sql(
        &self,
        table: &str,
        columns: &str,
        values: usize,
        key_column: &str,
    ) -> String {
        let from_dual = if self.is_sqlite { "" } else { " FROM DUAL" };
        format!(
            "INSERT INTO {table} ({columns}) SELECT {values}{from_dual} \
             WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {key_column} = ? \
             AND status IN ('pending', 'processing', 'completed'))",
            table = table,
            columns = columns,
            values = placeholders(values),
            from_dual = from_dual,
            key_column = key_column,
        )
    }

    /// Processing → `status` for the given staging ids. Returns rows changed.
    async fn finish_staged(
        &self,
        table: &str,
        staging_ids: &[u64],
        status: &str,
        processed_at: i64,
        error: Option<&str>,
    ) -> Result<usize, StorageError> {
        let error = error.map(str::to_string);
        let mut changed = 0usize;
        for chunk in staging_ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "UPDATE {} SET status = ?, processed_at = ?, error = ? \
                 WHERE status = 'processing' AND staging_id IN ({})",
                table,
                placeholders(chunk.len())
            );
            let result = retry_transient("sql_finish_staged", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql)
                    .bind(status)
                    .bind(processed_at)
                    .bind(&error);
                for id in chunk {
                    query = query.bind(*id as i64);
                }
                query.execute(&self.pool).await.map_err(map_sqlx_err)
            })
            .await?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn status_counts(&self, table: &str) -> Result<Vec<(String, u64)>, StorageError> {
        let sql = format!("SELECT status, COUNT(*) AS cnt FROM {} GROUP BY status", table);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status = text_col(&row, "status").unwrap_or_default();
            counts.push((status, int_col(&row, "cnt")? as u64));
        }
        Ok(counts)
    }
}

/// An open `sqlx` transaction on the canonical tables.
pub struct SqlTransaction {
    tx: Transaction<'static, Any>,
}

#[async_trait]
impl RecordTransaction for SqlTransaction {
    async fn insert_records(&mut self, records: &[Record]) -> Result<usize, StorageError> {
        let mut written = 0usize;
        for chunk in records.chunks(CHUNK_SIZE) {
            let sql = format!(
                "INSERT INTO records ({}) VALUES {}",
                RECORD_COLUMNS,
                vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for r in chunk {
                query = query
                    .bind(r.id as i64)
                    .bind(r.outer_id as i64)
                    .bind(r.inner_id as i64)
                    .bind(r.author_id as i64)
                    .bind(&r.content)
                    .bind(&r.secondary_content)
                    .bind(r.created_at)
                    .bind(r.edited_at)
                    .bind(r.deleted_at)
                    .bind(i64::from(r.is_deleted))
                    .bind(r.reply_to_id.map(|id| id as i64));
            }
            let result = query.execute(&mut *self.tx).await.map_err(map_sqlx_err)?;
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn insert_attachments(&mut self, attachments: &[Attachment]) -> Result<usize, StorageError> {
        let mut written = 0usize;
        for chunk in attachments.chunks(CHUNK_SIZE) {
            let sql = format!(
                "INSERT INTO attachments (id, record_id, file_name, url, content_type, size_bytes) VALUES {}",
                vec!["(?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ")
            );
            let mut query = sqlx::query(&sql);
            for a in chunk {
                query = query
                    .bind(a.id as i64)
                    .bind(a.record_id as i64)
                    .bind(&a.file_name)
                    .bind(&a.url)
                    .bind(&a.content_type)
                    .bind(a.size_bytes as i64);
            }
            let result = query.execute(&mut *self.tx).await.map_err(map_sqlx_err)?;
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(map_sqlx_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(map_sqlx_err)
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn find_existing(&self, ids: &[RecordId]) -> Result<HashSet<RecordId>, StorageError> {
        self.existing_ids("records", ids).await
    }

    async fn find_existing_attachments(
        &self,
        ids: &[AttachmentId],
    ) -> Result<HashSet<AttachmentId>, StorageError> {
        self.existing_ids("attachments", ids).await
    }

    async fn begin(&self) -> Result<Box<dyn RecordTransaction>, StorageError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        Ok(Box::new(SqlTransaction { tx }))
    }

    async fn query_scope(&self, query: &RecordQuery) -> Result<Vec<Record>, StorageError> {
        let mut sql = format!(
            "SELECT {} FROM records WHERE outer_id = ? AND inner_id = ?",
            RECORD_COLUMNS
        );
        if query.id_greater_than.is_some() {
            sql.push_str(" AND id > ?");
        }
        if query.exclude_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        sql.push_str(" ORDER BY id ASC LIMIT ? OFFSET ?");

        let rows = retry_transient("sql_query_scope", &RetryConfig::query(), || async {
            let mut q = sqlx::query(&sql)
                .bind(query.scope.outer_id as i64)
                .bind(query.scope.inner_id as i64);
            if let Some(lower) = query.id_greater_than {
                q = q.bind(lower as i64);
            }
            q.bind(query.limit as i64)
                .bind(query.offset as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let sql = format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS);
        let row = retry_transient("sql_get_record", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn replies_to(&self, parent_id: RecordId) -> Result<Vec<Record>, StorageError> {
        let sql = format!(
            "SELECT {} FROM records WHERE reply_to_id = ? AND is_deleted = 0 ORDER BY id ASC",
            RECORD_COLUMNS
        );
        let rows = retry_transient("sql_replies_to", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(parent_id as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)
        })
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn soft_delete(&self, ids: &[RecordId], deleted_at: i64) -> Result<usize, StorageError> {
        let mut changed = 0usize;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "UPDATE records SET is_deleted = 1, deleted_at = ? WHERE is_deleted = 0 AND id IN ({})",
                placeholders(chunk.len())
            );
            let result = retry_transient("sql_soft_delete", &RetryConfig::query(), || async {
                let mut query = sqlx::query(&sql).bind(deleted_at);
                for id in chunk {
                    query = query.bind(*id as i64);
                }
                query.execute(&self.pool).await.map_err(map_sqlx_err)
            })
            .await?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }
}

#[async_trait]
impl StagingStore for SqlStore {
    async fn insert_staged_record(
        &self,
        record: &Record,
        status: StagingStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedRecord, StorageError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        const COLUMNS: &str = "record_id, payload, status, staged_at, retry_count";
        let pending = status == StagingStatus::Pending;
        let sql = if pending {
            self.conditional_insert_sql("staged_records", COLUMNS, 5, "record_id")
        } else {
            format!("INSERT INTO staged_records ({}) VALUES ({})", COLUMNS, placeholders(5))
        };

        let mut query = sqlx::query(&sql)
            .bind(record.id as i64)
            .bind(&payload)
            .bind(status.as_str())
            .bind(staged_at)
            .bind(i64::from(retry_count));
        if pending {
            query = query.bind(record.id as i64);
        }
        let result = query.execute(&self.pool).await.map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!("record {} is already staged", record.id)));
        }

        let staging_id = result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend("driver returned no staging id".into()))?;

        Ok(StagedRecord {
            staging_id: staging_id as u64,
            record: record.clone(),
            status,
            staged_at,
            processed_at: None,
            error: None,
            retry_count,
            batch_id: None,
            claimed_at: None,
        })
    }

    async fn staged_record_lookup(&self, ids: &[RecordId]) -> Result<StagedLookup, StorageError> {
        self.lookup_staged("staged_records", "record_id", ids).await
    }

    async fn claim_pending_records(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedRecord>, StorageError> {
        let (batch_id, rows) = self
            .claim(
                "staged_records",
                "SELECT staging_id FROM staged_records WHERE status = 'pending' \
                 ORDER BY staged_at ASC, staging_id ASC LIMIT ?",
                STAGED_RECORD_COLUMNS,
                limit,
            )
            .await?;

        let rows = rows.iter().map(staged_record_from_row).collect::<Result<_, _>>()?;
        Ok(ClaimedBatch { batch_id, rows })
    }

    async fn stale_record_claims(&self, claimed_before: i64) -> Result<Vec<StagedRecord>, StorageError> {
        self.stale_claims("staged_records", STAGED_RECORD_COLUMNS, claimed_before)
            .await?
            .iter()
            .map(staged_record_from_row)
            .collect()
    }

    async fn complete_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError> {
        self.finish_staged(
            "staged_records",
            staging_ids,
            StagingStatus::Completed.as_str(),
            processed_at,
            None,
        )
        .await
    }

    async fn fail_staged_records(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError> {
        self.finish_staged(
            "staged_records",
            staging_ids,
            StagingStatus::Failed.as_str(),
            processed_at,
            Some(error),
        )
        .await
    }

    async fn get_staged_record(&self, staging_id: u64) -> Result<Option<StagedRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM staged_records WHERE staging_id = ?",
            STAGED_RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(staging_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(staged_record_from_row).transpose()
    }

    async fn insert_staged_attachment(
        &self,
        attachment: &Attachment,
        status: AttachmentStatus,
        retry_count: u32,
        staged_at: i64,
    ) -> Result<StagedAttachment, StorageError> {
        let payload = serde_json::to_string(attachment)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        const COLUMNS: &str = "attachment_id, record_id, payload, status, staged_at, retry_count";
        let pending = status == AttachmentStatus::Pending;
        let sql = if pending {
            self.conditional_insert_sql("staged_attachments", COLUMNS, 6, "attachment_id")
        } else {
            format!("INSERT INTO staged_attachments ({}) VALUES ({})", COLUMNS, placeholders(6))
        };

        let mut query = sqlx::query(&sql)
            .bind(attachment.id as i64)
            .bind(attachment.record_id as i64)
            .bind(&payload)
            .bind(status.as_str())
            .bind(staged_at)
            .bind(i64::from(retry_count));
        if pending {
            query = query.bind(attachment.id as i64);
        }
        let result = query.execute(&self.pool).await.map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "attachment {} is already staged",
                attachment.id
            )));
        }

        let staging_id = result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend("driver returned no staging id".into()))?;

        Ok(StagedAttachment {
            staging_id: staging_id as u64,
            attachment: attachment.clone(),
            status,
            staged_at,
            processed_at: None,
            error: None,
            retry_count,
            batch_id: None,
            claimed_at: None,
        })
    }

    async fn staged_attachment_lookup(
        &self,
        ids: &[AttachmentId],
    ) -> Result<StagedLookup, StorageError> {
        self.lookup_staged("staged_attachments", "attachment_id", ids).await
    }

    async fn claim_ready_attachments(
        &self,
        limit: usize,
    ) -> Result<ClaimedBatch<StagedAttachment>, StorageError> {
        let (batch_id, rows) = self
            .claim(
                "staged_attachments",
                "SELECT sa.staging_id FROM staged_attachments sa \
                 WHERE sa.status = 'pending' \
                 AND EXISTS (SELECT 1 FROM records r WHERE r.id = sa.record_id) \
                 ORDER BY sa.staged_at ASC, sa.staging_id ASC LIMIT ?",
                STAGED_ATTACHMENT_COLUMNS,
                limit,
            )
            .await?;

        let rows = rows.iter().map(staged_attachment_from_row).collect::<Result<_, _>>()?;
        Ok(ClaimedBatch { batch_id, rows })
    }

    async fn stale_attachment_claims(
        &self,
        claimed_before: i64,
    ) -> Result<Vec<StagedAttachment>, StorageError> {
        self.stale_claims("staged_attachments", STAGED_ATTACHMENT_COLUMNS, claimed_before)
            .await?
            .iter()
            .map(staged_attachment_from_row)
            .collect()
    }

    async fn complete_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
    ) -> Result<usize, StorageError> {
        self.finish_staged(
            "staged_attachments",
            staging_ids,
            AttachmentStatus::Completed.as_str(),
            processed_at,
            None,
        )
        .await
    }

    async fn fail_staged_attachments(
        &self,
        staging_ids: &[u64],
        processed_at: i64,
        error: &str,
    ) -> Result<usize, StorageError> {
        self.finish_staged(
            "staged_attachments",
            staging_ids,
            AttachmentStatus::Failed.as_str(),
            processed_at,
            Some(error),
        )
        .await
    }

    async fn staging_stats(&self) -> Result<StagingStats, StorageError> {
        let mut records = HashMap::new();
        for (status, count) in self.status_counts("staged_records").await? {
            if let Some(status) = StagingStatus::parse(&status) {
                records.insert(status, count);
            }
        }

        let mut attachments = HashMap::new();
        for (status, count) in self.status_counts("staged_attachments").await? {
            if let Some(status) = AttachmentStatus::parse(&status) {
                attachments.insert(status, count);
            }
        }

        Ok(StagingStats { records, attachments })
    }
}

#[async_trait]
impl CheckpointStore for SqlStore {
    async fn get_checkpoint(&self, scope: &ScopeKey) -> Result<Option<SyncCheckpoint>, StorageError> {
        let id = scope.checkpoint_id();
        let row = retry_transient("sql_get_checkpoint", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT id, outer_id, inner_id, last_message_id, last_synced_at \
                 FROM sync_checkpoints WHERE id = ?",
            )
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)
        })
        .await?;

        match row {
            Some(row) => Ok(Some(SyncCheckpoint {
                id: text_col(&row, "id").unwrap_or_else(|| id.clone()),
                outer_id: int_col(&row, "outer_id")? as u64,
                inner_id: int_col(&row, "inner_id")? as u64,
                last_message_id: int_col(&row, "last_message_id")? as u64,
                last_synced_at: int_col(&row, "last_synced_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_checkpoints (id, outer_id, inner_id, last_message_id, last_synced_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                last_message_id = MAX(sync_checkpoints.last_message_id, excluded.last_message_id), \
                last_synced_at = excluded.last_synced_at"
        } else {
            "INSERT INTO sync_checkpoints (id, outer_id, inner_id, last_message_id, last_synced_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                last_message_id = GREATEST(last_message_id, VALUES(last_message_id)), \
                last_synced_at = VALUES(last_synced_at)"
        };

        retry_transient("sql_upsert_checkpoint", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&checkpoint.id)
                .bind(checkpoint.outer_id as i64)
                .bind(checkpoint.inner_id as i64)
                .bind(checkpoint.last_message_id as i64)
                .bind(checkpoint.last_synced_at)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
            Ok(())
        })
        .await
    }
}
