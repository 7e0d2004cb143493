//! Read-side checks over persisted status fields, plus the unified-status
//! backfill that repairs the `null` bucket.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::{MigrationMode, RunStatus};
use crate::mapping::{EntityKind, StatusMapping};
use crate::reference::{classify_reference, ReferenceKind};
use crate::status::{aggregate_split_status, SplitOrder};
use crate::{format_rfc3339, now_utc, Document, LedgerError, RecordStore};

pub const STATUS_AUDIT_CONTRACT_VERSION: &str = "status_audit.v1";
pub const STATUS_BACKFILL_CONTRACT_VERSION: &str = "status_backfill.v1";
pub const ROLLUP_AUDIT_CONTRACT_VERSION: &str = "rollup_audit.v1";

/// Offending records kept per bucket in a report.
pub const SAMPLE_PREVIEW_LIMIT: usize = 5;

const REQUISITION_COLLECTION: &str = "purchase_requisitions";
const ORDER_COLLECTION: &str = "orders";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StatusBucket {
    Consistent,
    Null,
    Inconsistent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusSample {
    pub doc_id: String,
    pub legacy: Option<String>,
    pub unified: Option<String>,
    pub expected: Option<String>,
}

fn render(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Buckets one record by comparing its unified status with the value its
/// legacy status maps to. A present unified status next to an unmapped
/// legacy status is inconsistent.
#[must_use]
pub fn classify_status(mapping: &StatusMapping, doc: &Document) -> (StatusBucket, StatusSample) {
    let legacy = doc.body.get(mapping.legacy_field).filter(|value| !value.is_null());
    let unified = doc.body.get(mapping.unified_field).filter(|value| !value.is_null());
    let expected = legacy
        .and_then(Value::as_str)
        .and_then(|label| mapping.expected_unified(label));

    let bucket = match unified {
        None => StatusBucket::Null,
        Some(value) if expected.is_some() && value.as_str() == expected => StatusBucket::Consistent,
        Some(_) => StatusBucket::Inconsistent,
    };
    let sample = StatusSample {
        doc_id: doc.id.clone(),
        legacy: legacy.map(render),
        unified: unified.map(render),
        expected: expected.map(str::to_string),
    };
    (bucket, sample)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntityStatusAudit {
    pub entity: EntityKind,
    pub collection: String,
    pub legacy_field: String,
    pub unified_field: String,
    pub scanned: usize,
    pub consistent: usize,
    pub null: usize,
    pub inconsistent: usize,
    pub null_samples: Vec<StatusSample>,
    pub inconsistent_samples: Vec<StatusSample>,
}

impl EntityStatusAudit {
    fn new(mapping: &StatusMapping) -> Self {
        Self {
            entity: mapping.entity,
            collection: mapping.collection.to_string(),
            legacy_field: mapping.legacy_field.to_string(),
            unified_field: mapping.unified_field.to_string(),
            scanned: 0,
            consistent: 0,
            null: 0,
            inconsistent: 0,
            null_samples: Vec::new(),
            inconsistent_samples: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.null == 0 && self.inconsistent == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusAuditReport {
    pub contract_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub entities: Vec<EntityStatusAudit>,
}

impl StatusAuditReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entities.iter().all(EntityStatusAudit::is_clean)
    }
}

fn push_sample(samples: &mut Vec<StatusSample>, sample: StatusSample) {
    if samples.len() < SAMPLE_PREVIEW_LIMIT {
        samples.push(sample);
    }
}

/// Counts consistent, null and inconsistent records per entity kind.
/// Never writes.
///
/// # Errors
/// Returns [`LedgerError::Store`] when a collection cannot be read.
pub fn audit_status_consistency<S: RecordStore + ?Sized>(
    store: &S,
    mappings: &[&StatusMapping],
) -> Result<StatusAuditReport, LedgerError> {
    let mut entities = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let mut audit = EntityStatusAudit::new(mapping);
        for doc in store.list_documents(mapping.collection)? {
            audit.scanned += 1;
            let (bucket, sample) = classify_status(mapping, &doc);
            match bucket {
                StatusBucket::Consistent => audit.consistent += 1,
                StatusBucket::Null => {
                    audit.null += 1;
                    push_sample(&mut audit.null_samples, sample);
                }
                StatusBucket::Inconsistent => {
                    audit.inconsistent += 1;
                    push_sample(&mut audit.inconsistent_samples, sample);
                }
            }
        }
        info!(
            entity = mapping.entity.as_str(),
            scanned = audit.scanned,
            consistent = audit.consistent,
            null = audit.null,
            inconsistent = audit.inconsistent,
            "status audit"
        );
        entities.push(audit);
    }

    Ok(StatusAuditReport {
        contract_version: STATUS_AUDIT_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new().to_string(),
        generated_at: format_rfc3339(now_utc())?,
        entities,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BackfillReport {
    pub contract_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub entity: EntityKind,
    pub collection: String,
    pub mode: MigrationMode,
    pub status: RunStatus,
    pub scanned: usize,
    pub already_set: usize,
    pub backfilled: usize,
    pub unmapped: usize,
    pub errors: usize,
    pub backfilled_samples: Vec<StatusSample>,
    pub unmapped_samples: Vec<StatusSample>,
}

/// Writes the mapped unified status into every record that lacks one.
///
/// Records whose legacy status has no mapping are reported as unmapped and
/// left alone; records that already carry a unified status are never
/// touched, so a second apply run backfills nothing.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the collection cannot be read or a
/// write is rejected; the run stops at the first rejected write.
pub fn backfill_unified_status<S: RecordStore + ?Sized>(
    store: &mut S,
    mapping: &StatusMapping,
    mode: MigrationMode,
) -> Result<BackfillReport, LedgerError> {
    let mut report = BackfillReport {
        contract_version: STATUS_BACKFILL_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new().to_string(),
        generated_at: format_rfc3339(now_utc())?,
        entity: mapping.entity,
        collection: mapping.collection.to_string(),
        mode,
        status: mode.terminal_status(),
        scanned: 0,
        already_set: 0,
        backfilled: 0,
        unmapped: 0,
        errors: 0,
        backfilled_samples: Vec::new(),
        unmapped_samples: Vec::new(),
    };

    for doc in store.list_documents(mapping.collection)? {
        report.scanned += 1;
        let (bucket, sample) = classify_status(mapping, &doc);
        if bucket != StatusBucket::Null {
            report.already_set += 1;
            continue;
        }
        let Some(expected) = sample.expected.clone() else {
            report.unmapped += 1;
            push_sample(&mut report.unmapped_samples, sample);
            continue;
        };

        if mode.is_apply() {
            let mut fields = Map::new();
            fields.insert(mapping.unified_field.to_string(), Value::String(expected));
            match store.update_fields(mapping.collection, &doc.id, &fields) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(collection = mapping.collection, doc_id = %doc.id, "document vanished during backfill");
                    report.errors += 1;
                    continue;
                }
                Err(err) => {
                    warn!(collection = mapping.collection, doc_id = %doc.id, error = %err, "backfill write failed");
                    return Err(err);
                }
            }
        }
        report.backfilled += 1;
        push_sample(&mut report.backfilled_samples, sample);
    }

    info!(
        entity = mapping.entity.as_str(),
        status = report.status.as_str(),
        scanned = report.scanned,
        backfilled = report.backfilled,
        unmapped = report.unmapped,
        "unified status backfill"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RollupMismatch {
    pub requisition_id: String,
    pub code: Option<String>,
    pub persisted: Option<String>,
    pub computed: String,
    pub splits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RollupAuditReport {
    pub contract_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub requisitions: usize,
    pub without_splits: usize,
    pub matching: usize,
    pub mismatched: usize,
    pub samples: Vec<RollupMismatch>,
}

/// Key under which a split order points at its requisition: the canonical
/// code, or the lowercase hex of a legacy reference.
fn requisition_key(value: &Value) -> Option<String> {
    match classify_reference(value) {
        ReferenceKind::Canonical(code) => Some(code.to_string()),
        ReferenceKind::Legacy(reference) => Some(reference.to_string()),
        ReferenceKind::NotAReference => value.as_str().map(str::to_string),
    }
}

/// Recomputes every requisition's status from its split orders and reports
/// the ones whose persisted `status` disagrees. Never writes.
///
/// # Errors
/// Returns [`LedgerError::Store`] when either collection cannot be read.
pub fn audit_requisition_rollups<S: RecordStore + ?Sized>(
    store: &S,
) -> Result<RollupAuditReport, LedgerError> {
    let mut splits: BTreeMap<String, Vec<SplitOrder>> = BTreeMap::new();
    for order in store.list_documents(ORDER_COLLECTION)? {
        let Some(key) = order.body.get("requisitionId").and_then(requisition_key) else {
            continue;
        };
        splits.entry(key.clone()).or_default().push(SplitOrder {
            requisition_id: key,
            status: order.body.get("status").and_then(Value::as_str).map(str::to_string),
        });
    }

    let mut report = RollupAuditReport {
        contract_version: ROLLUP_AUDIT_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new().to_string(),
        generated_at: format_rfc3339(now_utc())?,
        requisitions: 0,
        without_splits: 0,
        matching: 0,
        mismatched: 0,
        samples: Vec::new(),
    };

    for requisition in store.list_documents(REQUISITION_COLLECTION)? {
        report.requisitions += 1;
        let code = requisition.body.get("id").and_then(Value::as_str);
        // Mid-migration, children may point at the code or the legacy id.
        let mut keys: Vec<&str> = code.into_iter().collect();
        if code != Some(requisition.id.as_str()) {
            keys.push(&requisition.id);
        }
        let children: Vec<SplitOrder> = keys
            .into_iter()
            .filter_map(|key| splits.get(key))
            .flatten()
            .cloned()
            .collect();
        if children.is_empty() {
            report.without_splits += 1;
            continue;
        }

        let computed = aggregate_split_status(&children).as_str().to_string();
        let persisted = requisition.body.get("status").and_then(Value::as_str);
        if persisted == Some(computed.as_str()) {
            report.matching += 1;
            continue;
        }
        report.mismatched += 1;
        if report.samples.len() < SAMPLE_PREVIEW_LIMIT {
            report.samples.push(RollupMismatch {
                requisition_id: requisition.id.clone(),
                code: code.map(str::to_string),
                persisted: persisted.map(str::to_string),
                computed,
                splits: children.len(),
            });
        }
    }

    info!(
        requisitions = report.requisitions,
        matching = report.matching,
        mismatched = report.mismatched,
        without_splits = report.without_splits,
        "requisition roll-up audit"
    );
    Ok(report)
}
