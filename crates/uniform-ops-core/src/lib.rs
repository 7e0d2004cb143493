//! Status and reference repair logic for the uniform-ordering document store.
//!
//! The crate is deliberately free of any database driver. Everything that
//! touches persisted documents goes through [`RecordStore`], so the same
//! engine runs against the `SQLite` snapshot store and against in-memory
//! fixtures in tests.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

pub mod audit;
pub mod duplicate;
pub mod engine;
pub mod mapping;
pub mod path;
pub mod plan;
pub mod reference;
pub mod status;

#[cfg(test)]
mod testing;

pub use audit::{
    audit_requisition_rollups, audit_status_consistency, backfill_unified_status,
    classify_status, BackfillReport, EntityStatusAudit, RollupAuditReport, RollupMismatch,
    StatusAuditReport, StatusBucket, StatusSample, ROLLUP_AUDIT_CONTRACT_VERSION,
    SAMPLE_PREVIEW_LIMIT, STATUS_AUDIT_CONTRACT_VERSION, STATUS_BACKFILL_CONTRACT_VERSION,
};
pub use duplicate::{creation_time, detect_duplicates, DuplicateGroup};
pub use engine::{
    assign_missing_codes, delete_orphaned, run_migration, scan_collection, CodeAssignment,
    DocumentFailure, DuplicateReport, FieldChange, FieldOutcome, LookupCache, MigrationMode,
    MigrationOptions, MigrationRunReport, OrphanDeletion, OrphanRef, RunStatus, RunTotals,
    ScanReport, MIGRATION_RUN_CONTRACT_VERSION,
};
pub use mapping::{status_mappings, EntityKind, StatusMapping};
pub use path::FieldPath;
pub use plan::{CollectionPlan, DuplicateKeySpec, MigrationPlan, ReferenceField, TargetSpec};
pub use reference::{classify_reference, LegacyRef, ReferenceKind};
pub use status::{
    aggregate_split_status, AggregateStatus, CompositeStatus, SplitOrder, SplitRecord, SplitStatus,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("document shape error: {0}")]
    Shape(String),
    #[error("record store error: {0}")]
    Store(String),
}

/// One persisted document of a named collection.
///
/// `id` is the store's primary key for the document: the lowercase hex
/// rendering of its internal reference when it has one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Map<String, Value>,
}

impl Document {
    #[must_use]
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

/// Boundary to the document database.
///
/// Implementations make no schema promises: fields may be absent, of an
/// unexpected type, or legacy-shaped. Each `update_fields` call must be
/// atomic for the one document it touches.
pub trait RecordStore {
    /// Returns every document of `collection`, ordered by document id.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the store cannot be read.
    fn list_documents(&self, collection: &str) -> Result<Vec<Document>, LedgerError>;

    /// Overwrites the given top-level fields of one document.
    ///
    /// Returns `false` when no document with `doc_id` exists.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the write fails.
    fn update_fields(
        &mut self,
        collection: &str,
        doc_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, LedgerError>;

    /// Deletes the listed documents and returns how many were removed.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when the delete fails.
    fn delete_documents(&mut self, collection: &str, doc_ids: &[String])
        -> Result<usize, LedgerError>;
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
