// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structures.
//!
//! A [`Record`] is the canonical ingested message. Before it reaches the
//! canonical store it sits in the staging area as a [`StagedRecord`];
//! attachments follow the same path as [`StagedAttachment`]. Incremental
//! sync progress per scope pair is kept as a [`SyncCheckpoint`].
//!
//! # Example
//!
//! ```
//! use message_ingest::{Record, ScopeKey};
//!
//! let scope = ScopeKey::new(100, 456);
//! let record = Record::new(789, scope, 42, "hello")
//!     .with_reply_to(700);
//!
//! assert_eq!(record.scope(), scope);
//! assert_eq!(record.reply_to_id, Some(700));
//! assert!(record.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

/// Source-assigned record id (snowflake-like, increasing within a scope).
pub type RecordId = u64;

/// Source-assigned attachment id.
pub type AttachmentId = u64;

/// Largest id the SQL store can hold; ids are bound as signed 64-bit.
pub const MAX_ID: u64 = i64::MAX as u64;

/// Current wall-clock time as epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The (outer, inner) pair a checkpoint is keyed by, e.g. guild/channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub outer_id: u64,
    pub inner_id: u64,
}

impl ScopeKey {
    #[must_use]
    pub fn new(outer_id: u64, inner_id: u64) -> Self {
        Self { outer_id, inner_id }
    }

    /// Both ids fit the SQL store.
    #[must_use]
    pub fn in_range(&self) -> bool {
        self.outer_id <= MAX_ID && self.inner_id <= MAX_ID
    }

    /// Derived checkpoint identity, `"{outer}:{inner}"`.
    #[must_use]
    pub fn checkpoint_id(&self) -> String {
        format!("{}:{}", self.outer_id, self.inner_id)
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.outer_id, self.inner_id)
    }
}

/// Canonical ingested message.
///
/// Reply and thread relationships are plain foreign-key ids; resolve them
/// through [`crate::storage::traits::RecordStore::get_record`] or
/// [`crate::storage::traits::RecordStore::replies_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// Outer scope (guild)
    pub outer_id: u64,
    /// Inner scope (channel)
    pub inner_id: u64,
    pub author_id: u64,
    pub content: String,
    /// Embeds or other secondary payload, stored opaque
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_content: Option<String>,
    /// Creation timestamp (epoch millis)
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<RecordId>,
}

impl Record {
    /// Create a record with the current time as its creation timestamp.
    pub fn new(id: RecordId, scope: ScopeKey, author_id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            outer_id: scope.outer_id,
            inner_id: scope.inner_id,
            author_id,
            content: content.into(),
            secondary_content: None,
            created_at: now_millis(),
            edited_at: None,
            deleted_at: None,
            is_deleted: false,
            reply_to_id: None,
        }
    }

    #[must_use]
    pub fn with_reply_to(mut self, parent: RecordId) -> Self {
        self.reply_to_id = Some(parent);
        self
    }

    #[must_use]
    pub fn with_secondary_content(mut self, secondary: impl Into<String>) -> Self {
        self.secondary_content = Some(secondary.into());
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    #[must_use]
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(self.outer_id, self.inner_id)
    }

    /// Reject records missing required identifiers or carrying ids above
    /// [`MAX_ID`].
    pub fn validate(&self) -> Result<(), String> {
        if self.id == 0 {
            return Err("record id must be non-zero".into());
        }
        if self.id > MAX_ID {
            return Err(format!("record id {} is out of range", self.id));
        }
        if self.outer_id == 0 || self.inner_id == 0 {
            return Err(format!("record {} has an empty scope ({})", self.id, self.scope()));
        }
        if !self.scope().in_range() {
            return Err(format!("record {} has an out-of-range scope ({})", self.id, self.scope()));
        }
        if self.author_id > MAX_ID || self.reply_to_id.is_some_and(|id| id > MAX_ID) {
            return Err(format!("record {} references an out-of-range id", self.id));
        }
        if self.reply_to_id == Some(self.id) {
            return Err(format!("record {} replies to itself", self.id));
        }
        Ok(())
    }
}

/// File attached to a record. Only committed once its parent record has a
/// canonical row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub record_id: RecordId,
    pub file_name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

impl Attachment {
    pub fn new(
        id: AttachmentId,
        record_id: RecordId,
        file_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            record_id,
            file_name: file_name.into(),
            url: url.into(),
            content_type: None,
            size_bytes: 0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id == 0 {
            return Err("attachment id must be non-zero".into());
        }
        if self.id > MAX_ID || self.record_id > MAX_ID {
            return Err(format!("attachment {} has an out-of-range id", self.id));
        }
        if self.file_name.trim().is_empty() {
            return Err(format!("attachment {} has no file name", self.id));
        }
        if self.url.trim().is_empty() {
            return Err(format!("attachment {} has no url", self.id));
        }
        Ok(())
    }
}

/// Lifecycle of a staged message row.
///
/// ```text
/// Pending → Processing → Completed
///                      → Failed
/// Pending → Duplicate
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Duplicate,
}

impl StagingStatus {
    pub const ALL: [StagingStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Duplicate,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Duplicate => "duplicate",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// No further transitions out of this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Duplicate)
    }

    /// A row in this status blocks re-staging the same record id.
    #[must_use]
    pub fn blocks_restaging(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Completed)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Duplicate)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl std::fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a staged attachment row. Duplicate attachments are skipped
/// at staging time, so there is no audit status for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AttachmentStatus {
    pub const ALL: [AttachmentStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn blocks_restaging(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing | Self::Completed)
    }
}

impl std::fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record waiting in the staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedRecord {
    /// Store-generated
    pub staging_id: u64,
    pub record: Record,
    pub status: StagingStatus,
    pub staged_at: i64,
    pub processed_at: Option<i64>,
    pub error: Option<String>,
    /// Number of earlier failed attempts for the same record id
    pub retry_count: u32,
    /// Claim/commit batch that moved this row out of `Pending`
    pub batch_id: Option<String>,
    /// When the row was claimed into `Processing` (epoch millis)
    #[serde(default)]
    pub claimed_at: Option<i64>,
}

/// An attachment waiting in the staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedAttachment {
    pub staging_id: u64,
    pub attachment: Attachment,
    pub status: AttachmentStatus,
    pub staged_at: i64,
    pub processed_at: Option<i64>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub batch_id: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<i64>,
}

/// Watermark of the last synced record for one scope pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Derived from the scope, see [`ScopeKey::checkpoint_id`]
    pub id: String,
    pub outer_id: u64,
    pub inner_id: u64,
    pub last_message_id: RecordId,
    pub last_synced_at: i64,
}

impl SyncCheckpoint {
    pub fn new(scope: ScopeKey, last_message_id: RecordId, last_synced_at: i64) -> Self {
        Self {
            id: scope.checkpoint_id(),
            outer_id: scope.outer_id,
            inner_id: scope.inner_id,
            last_message_id,
            last_synced_at,
        }
    }

    #[must_use]
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(self.outer_id, self.inner_id)
    }

    /// Advance the watermark. Never moves it backwards.
    pub fn advance(&mut self, observed_max: RecordId, at: i64) {
        self.last_message_id = self.last_message_id.max(observed_max);
        self.last_synced_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_checkpoint_id() {
        let scope = ScopeKey::new(100, 456);
        assert_eq!(scope.checkpoint_id(), "100:456");
        assert_eq!(format!("{}", scope), "100:456");
    }

    #[test]
    fn test_record_validate() {
        let scope = ScopeKey::new(1, 2);
        assert!(Record::new(10, scope, 3, "hi").validate().is_ok());
        assert!(Record::new(0, scope, 3, "hi").validate().is_err());
        assert!(Record::new(10, ScopeKey::new(0, 2), 3, "hi").validate().is_err());
        assert!(Record::new(10, scope, 3, "hi").with_reply_to(10).validate().is_err());
    }

    #[test]
    fn test_ids_above_signed_range_rejected() {
        let scope = ScopeKey::new(1, 2);
        assert!(Record::new(MAX_ID, scope, 3, "hi").validate().is_ok());
        assert!(Record::new(MAX_ID + 1, scope, 3, "hi").validate().is_err());
        assert!(Record::new(10, ScopeKey::new(u64::MAX, 2), 3, "hi").validate().is_err());
        assert!(Record::new(10, ScopeKey::new(1, MAX_ID + 1), 3, "hi").validate().is_err());
        assert!(Record::new(10, scope, u64::MAX, "hi").validate().is_err());
        assert!(Record::new(10, scope, 3, "hi").with_reply_to(u64::MAX).validate().is_err());
        assert!(Attachment::new(u64::MAX, 10, "a.png", "https://cdn/a.png").validate().is_err());
        assert!(Attachment::new(1, MAX_ID + 1, "a.png", "https://cdn/a.png").validate().is_err());
    }

    #[test]
    fn test_attachment_validate() {
        assert!(Attachment::new(1, 10, "a.png", "https://cdn/a.png").validate().is_ok());
        assert!(Attachment::new(0, 10, "a.png", "https://cdn/a.png").validate().is_err());
        assert!(Attachment::new(1, 10, " ", "https://cdn/a.png").validate().is_err());
        assert!(Attachment::new(1, 10, "a.png", "").validate().is_err());
    }

    #[test]
    fn test_status_transitions_only_move_forward() {
        use StagingStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Duplicate));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Duplicate.can_transition_to(Pending));

        for status in StagingStatus::ALL {
            if status.is_terminal() {
                for next in StagingStatus::ALL {
                    assert!(!status.can_transition_to(next));
                }
            }
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in StagingStatus::ALL {
            assert_eq!(StagingStatus::parse(status.as_str()), Some(status));
        }
        for status in AttachmentStatus::ALL {
            assert_eq!(AttachmentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StagingStatus::parse("bogus"), None);
        // Attachments are never staged as audit duplicates
        assert_eq!(AttachmentStatus::parse("duplicate"), None);
        assert_eq!(AttachmentStatus::ALL.len(), 4);
    }

    #[test]
    fn test_restaging_blockers() {
        assert!(StagingStatus::Pending.blocks_restaging());
        assert!(StagingStatus::Completed.blocks_restaging());
        assert!(!StagingStatus::Failed.blocks_restaging());
        assert!(!StagingStatus::Duplicate.blocks_restaging());
    }

    #[test]
    fn test_checkpoint_advance_is_monotonic() {
        let mut cp = SyncCheckpoint::new(ScopeKey::new(1, 2), 500, 0);
        cp.advance(400, 10);
        assert_eq!(cp.last_message_id, 500);
        assert_eq!(cp.last_synced_at, 10);
        cp.advance(900, 20);
        assert_eq!(cp.last_message_id, 900);
    }

    #[test]
    fn test_record_serde_skips_empty_optionals() {
        let record = Record::new(5, ScopeKey::new(1, 2), 3, "x").with_created_at(1_000);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("reply_to_id").is_none());
        assert!(json.get("edited_at").is_none());

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
