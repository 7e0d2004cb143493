//! Reference migration engine.
//!
//! A run moves through three phases: optional code assignment on target
//! collections, `building_lookup` (one read of every target collection into
//! a [`LookupCache`]) and `scanning` (one pass over each source collection).
//! Every phase is idempotent, so an interrupted apply run is resumed by
//! running it again.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::duplicate::{detect_duplicates, DuplicateGroup};
use crate::plan::{CollectionPlan, DuplicateKeySpec, MigrationPlan, TargetSpec};
use crate::reference::{classify_reference, is_canonical_code, LegacyRef, ReferenceKind};
use crate::{format_rfc3339, now_utc, Document, LedgerError, RecordStore};

pub const MIGRATION_RUN_CONTRACT_VERSION: &str = "migration_run.v1";

const FIRST_ASSIGNED_CODE: u32 = 100_001;
const LAST_ASSIGNABLE_CODE: u32 = 999_999;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    #[default]
    DryRun,
    Apply,
}

impl MigrationMode {
    #[must_use]
    pub fn is_apply(self) -> bool {
        matches!(self, Self::Apply)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Apply => "apply",
        }
    }

    #[must_use]
    pub fn terminal_status(self) -> RunStatus {
        match self {
            Self::DryRun => RunStatus::DryRunComplete,
            Self::Apply => RunStatus::Applied,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    DryRunComplete,
    Applied,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRunComplete => "DRY_RUN_COMPLETE",
            Self::Applied => "APPLIED",
        }
    }
}

/// What happened to one reference value during a scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldOutcome {
    AlreadyValid,
    Resolved,
    Orphaned,
    Skipped,
}

/// Legacy reference → canonical code, per target collection.
///
/// Scoped to one engine run; build a fresh cache for every run.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct LookupCache {
    targets: BTreeMap<String, BTreeMap<String, String>>,
}

impl LookupCache {
    /// Reads every target collection once.
    ///
    /// A target document's code is the first of its candidate fields that
    /// already holds a canonical code. Documents with no such field cannot
    /// be resolved to and are logged.
    ///
    /// # Errors
    /// Returns [`LedgerError::Store`] when a target collection cannot be read.
    pub fn build<S: RecordStore + ?Sized>(
        store: &S,
        targets: &[TargetSpec],
    ) -> Result<Self, LedgerError> {
        let mut cache = Self::default();
        for target in targets {
            let documents = store.list_documents(&target.collection)?;
            cache.targets.entry(target.collection.clone()).or_default();
            let mut indexed = 0_usize;
            for doc in &documents {
                let Some(reference) = document_ref(doc) else {
                    continue;
                };
                match candidate_code(target, &doc.body) {
                    Some(code) => {
                        cache.insert(&target.collection, &reference, code.to_string());
                        indexed += 1;
                    }
                    None => warn!(
                        collection = %target.collection,
                        doc_id = %doc.id,
                        "target document has no canonical code"
                    ),
                }
            }
            info!(
                collection = %target.collection,
                documents = documents.len(),
                indexed,
                "lookup built"
            );
        }
        Ok(cache)
    }

    pub fn insert(&mut self, target: &str, reference: &LegacyRef, code: String) {
        self.targets
            .entry(target.to_string())
            .or_default()
            .insert(reference.as_str().to_string(), code);
    }

    #[must_use]
    pub fn resolve(&self, target: &str, reference: &LegacyRef) -> Option<&str> {
        self.targets
            .get(target)
            .and_then(|entries| entries.get(reference.as_str()))
            .map(String::as_str)
    }

    /// Makes codes assigned during this run resolvable, including in dry
    /// runs where they were never written.
    pub fn record_assignments(&mut self, assignments: &[CodeAssignment]) {
        for assignment in assignments {
            if let Some(reference) = LegacyRef::parse(&assignment.doc_id) {
                self.insert(&assignment.collection, &reference, assignment.code.clone());
            }
        }
    }

    /// Comparable form of a reference value: its canonical code when known,
    /// `legacy:<hex>` when it cannot be resolved, `None` when the value is
    /// not a reference at all.
    #[must_use]
    pub fn normalize(&self, target: &str, value: &Value) -> Option<String> {
        match classify_reference(value) {
            ReferenceKind::Canonical(code) => Some(code.to_string()),
            ReferenceKind::Legacy(reference) => Some(
                self.resolve(target, &reference)
                    .map_or_else(|| format!("legacy:{reference}"), str::to_string),
            ),
            ReferenceKind::NotAReference => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn document_ref(doc: &Document) -> Option<LegacyRef> {
    match doc.body.get("_id").map(classify_reference) {
        Some(ReferenceKind::Legacy(reference)) => Some(reference),
        _ => LegacyRef::parse(&doc.id),
    }
}

fn candidate_code<'a>(target: &TargetSpec, body: &'a Map<String, Value>) -> Option<&'a str> {
    target.code_fields.iter().find_map(|field| {
        body.get(field)
            .and_then(Value::as_str)
            .filter(|raw| is_canonical_code(raw))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CodeAssignment {
    pub collection: String,
    pub doc_id: String,
    pub code: String,
}

/// Gives every document of `target` without a canonical code the next free
/// code, written to the target's primary code field.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when the code space is exhausted
/// and [`LedgerError::Store`] when a read or write fails.
pub fn assign_missing_codes<S: RecordStore + ?Sized>(
    store: &mut S,
    target: &TargetSpec,
    mode: MigrationMode,
) -> Result<Vec<CodeAssignment>, LedgerError> {
    let documents = store.list_documents(&target.collection)?;
    let highest = documents
        .iter()
        .filter_map(|doc| candidate_code(target, &doc.body))
        .filter_map(|code| code.parse::<u32>().ok())
        .max();
    let mut next = highest.map_or(FIRST_ASSIGNED_CODE, |code| code + 1);

    let mut assignments = Vec::new();
    for doc in &documents {
        if candidate_code(target, &doc.body).is_some() {
            continue;
        }
        if next > LAST_ASSIGNABLE_CODE {
            return Err(LedgerError::Configuration(format!(
                "{}: canonical code space exhausted",
                target.collection
            )));
        }
        let code = format!("{next:06}");
        next += 1;

        if mode.is_apply() {
            let mut fields = Map::new();
            fields.insert(
                target.primary_code_field().to_string(),
                Value::String(code.clone()),
            );
            if !store.update_fields(&target.collection, &doc.id, &fields)? {
                warn!(collection = %target.collection, doc_id = %doc.id, "document vanished before code assignment");
                continue;
            }
        }
        debug!(collection = %target.collection, doc_id = %doc.id, code = %code, "code assigned");
        assignments.push(CodeAssignment {
            collection: target.collection.clone(),
            doc_id: doc.id.clone(),
            code,
        });
    }
    Ok(assignments)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldChange {
    pub doc_id: String,
    pub path: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrphanRef {
    pub doc_id: String,
    pub path: String,
    pub target: String,
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentFailure {
    pub doc_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScanReport {
    pub collection: String,
    pub mode: MigrationMode,
    pub status: RunStatus,
    pub scanned: usize,
    pub already_valid: usize,
    pub resolved: usize,
    pub orphaned: usize,
    pub skipped: usize,
    pub errors: usize,
    pub documents_changed: usize,
    pub changes: Vec<FieldChange>,
    pub orphans: Vec<OrphanRef>,
    pub failures: Vec<DocumentFailure>,
}

impl ScanReport {
    fn new(collection: &str, mode: MigrationMode) -> Self {
        Self {
            collection: collection.to_string(),
            mode,
            status: mode.terminal_status(),
            scanned: 0,
            already_valid: 0,
            resolved: 0,
            orphaned: 0,
            skipped: 0,
            errors: 0,
            documents_changed: 0,
            changes: Vec::new(),
            orphans: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, doc_id: &str, err: &LedgerError) {
        warn!(collection = %self.collection, doc_id = %doc_id, error = %err, "document failed");
        self.errors += 1;
        self.failures.push(DocumentFailure {
            doc_id: doc_id.to_string(),
            message: err.to_string(),
        });
    }

    fn absorb(&mut self, scan: DocumentScan) {
        self.already_valid += scan.already_valid;
        self.resolved += scan.resolved;
        self.orphaned += scan.orphaned;
        self.skipped += scan.skipped;
        self.changes.extend(scan.changes);
        self.orphans.extend(scan.orphans);
    }
}

#[derive(Default)]
struct DocumentScan {
    already_valid: usize,
    resolved: usize,
    orphaned: usize,
    skipped: usize,
    changes: Vec<FieldChange>,
    orphans: Vec<OrphanRef>,
    updates: Map<String, Value>,
}

impl DocumentScan {
    fn count(&mut self, outcome: FieldOutcome) {
        match outcome {
            FieldOutcome::AlreadyValid => self.already_valid += 1,
            FieldOutcome::Resolved => self.resolved += 1,
            FieldOutcome::Orphaned => self.orphaned += 1,
            FieldOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Classifies and resolves every planned reference of one document against
/// a working copy of its body. Nothing is written here.
fn scan_document(
    cache: &LookupCache,
    plan: &CollectionPlan,
    doc: &Document,
) -> Result<DocumentScan, LedgerError> {
    let mut body = doc.body.clone();
    let mut scan = DocumentScan::default();
    let mut dirty_roots = BTreeSet::new();

    for field in &plan.fields {
        let path = field.path.to_string();
        for leaf in field.path.leaves_mut(&mut body)? {
            let reference = match classify_reference(leaf) {
                ReferenceKind::Canonical(_) => {
                    scan.count(FieldOutcome::AlreadyValid);
                    continue;
                }
                ReferenceKind::NotAReference => {
                    scan.count(FieldOutcome::Skipped);
                    continue;
                }
                ReferenceKind::Legacy(reference) => reference,
            };

            if let Some(code) = cache.resolve(&field.target, &reference) {
                debug!(doc_id = %doc.id, path = %path, from = %reference, to = %code, "reference resolved");
                scan.count(FieldOutcome::Resolved);
                scan.changes.push(FieldChange {
                    doc_id: doc.id.clone(),
                    path: path.clone(),
                    from: reference.to_string(),
                    to: code.to_string(),
                });
                *leaf = Value::String(code.to_string());
                dirty_roots.insert(field.path.root().to_string());
            } else {
                debug!(doc_id = %doc.id, path = %path, reference = %reference, "reference orphaned");
                scan.count(FieldOutcome::Orphaned);
                scan.orphans.push(OrphanRef {
                    doc_id: doc.id.clone(),
                    path: path.clone(),
                    target: field.target.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    for root in dirty_roots {
        if let Some(value) = body.get(&root) {
            scan.updates.insert(root, value.clone());
        }
    }
    Ok(scan)
}

/// Scans one source collection.
///
/// A document whose shape defeats a field path is counted in `errors` and
/// left untouched, as is a document deleted mid-scan; the scan moves on to
/// the next document.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the collection cannot be read or the
/// store rejects a write. A rejected write ends the scan.
pub fn scan_collection<S: RecordStore + ?Sized>(
    store: &mut S,
    cache: &LookupCache,
    plan: &CollectionPlan,
    mode: MigrationMode,
) -> Result<ScanReport, LedgerError> {
    let documents = store.list_documents(&plan.collection)?;
    let mut report = ScanReport::new(&plan.collection, mode);

    for doc in &documents {
        report.scanned += 1;
        let scan = match scan_document(cache, plan, doc) {
            Ok(scan) => scan,
            Err(err) => {
                report.fail(&doc.id, &err);
                continue;
            }
        };

        if scan.updates.is_empty() {
            report.absorb(scan);
            continue;
        }

        if mode.is_apply() {
            match store.update_fields(&plan.collection, &doc.id, &scan.updates) {
                Ok(true) => {}
                Ok(false) => {
                    report.fail(
                        &doc.id,
                        &LedgerError::Store("document vanished during scan".to_string()),
                    );
                    continue;
                }
                Err(err) => {
                    warn!(collection = %plan.collection, doc_id = %doc.id, error = %err, "write rejected, aborting scan");
                    return Err(err);
                }
            }
        }
        report.documents_changed += 1;
        report.absorb(scan);
    }

    info!(
        collection = %report.collection,
        status = report.status.as_str(),
        scanned = report.scanned,
        already_valid = report.already_valid,
        resolved = report.resolved,
        orphaned = report.orphaned,
        skipped = report.skipped,
        errors = report.errors,
        "collection scanned"
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrphanDeletion {
    pub collection: String,
    pub candidates: Vec<String>,
    pub deleted: usize,
    pub executed: bool,
}

/// Deletes the distinct documents carrying `orphans`, but only when
/// `confirm` is set. Without it the candidates are reported and kept.
///
/// # Errors
/// Returns [`LedgerError::Store`] when the delete fails.
pub fn delete_orphaned<S: RecordStore + ?Sized>(
    store: &mut S,
    collection: &str,
    orphans: &[OrphanRef],
    confirm: bool,
) -> Result<OrphanDeletion, LedgerError> {
    let candidates: Vec<String> = orphans
        .iter()
        .map(|orphan| orphan.doc_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let deleted = if confirm && !candidates.is_empty() {
        let deleted = store.delete_documents(collection, &candidates)?;
        warn!(collection = %collection, deleted, "orphaned documents deleted");
        deleted
    } else {
        0
    };

    Ok(OrphanDeletion {
        collection: collection.to_string(),
        candidates,
        deleted,
        executed: confirm,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateReport {
    pub collection: String,
    pub key_fields: Vec<String>,
    pub groups: Vec<DuplicateGroup>,
    pub deleted: usize,
}

fn natural_key(cache: &LookupCache, spec: &DuplicateKeySpec, doc: &Document) -> Option<String> {
    let mut parts = Vec::with_capacity(spec.fields.len());
    for field in &spec.fields {
        let leaves = field.path.leaves(&doc.body).ok()?;
        let [value] = leaves.as_slice() else {
            return None;
        };
        parts.push(cache.normalize(&field.target, value)?);
    }
    Some(parts.join("|"))
}

fn resolve_duplicates<S: RecordStore + ?Sized>(
    store: &mut S,
    cache: &LookupCache,
    spec: &DuplicateKeySpec,
    mode: MigrationMode,
) -> Result<DuplicateReport, LedgerError> {
    let records = store.list_documents(&spec.collection)?;
    let groups = detect_duplicates(
        &records,
        |doc| natural_key(cache, spec, doc),
        &spec.created_field,
    );

    let mut deleted = 0;
    if mode.is_apply() {
        let doomed: Vec<String> = groups
            .iter()
            .flat_map(|group| group.delete.iter().cloned())
            .collect();
        if !doomed.is_empty() {
            deleted = store.delete_documents(&spec.collection, &doomed)?;
        }
    }
    info!(
        collection = %spec.collection,
        groups = groups.len(),
        deleted,
        "duplicates resolved"
    );

    Ok(DuplicateReport {
        collection: spec.collection.clone(),
        key_fields: spec.fields.iter().map(|field| field.path.to_string()).collect(),
        groups,
        deleted,
    })
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MigrationOptions {
    pub mode: MigrationMode,
    pub delete_orphaned: bool,
    /// Restricts the run to these source collections when non-empty.
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunTotals {
    pub scanned: usize,
    pub already_valid: usize,
    pub resolved: usize,
    pub orphaned: usize,
    pub skipped: usize,
    pub errors: usize,
    pub documents_changed: usize,
    pub duplicates_deleted: usize,
    pub orphans_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationRunReport {
    pub contract_version: String,
    pub run_id: String,
    pub generated_at: String,
    pub plan_version: u32,
    pub mode: MigrationMode,
    pub status: RunStatus,
    pub assignments: Vec<CodeAssignment>,
    pub collections: Vec<ScanReport>,
    pub duplicates: Vec<DuplicateReport>,
    pub orphan_deletions: Vec<OrphanDeletion>,
    pub totals: RunTotals,
}

/// Runs a whole plan: code assignment, lookup, scans, duplicate resolution
/// and, when requested, orphan deletion.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] for an invalid plan or filter and
/// [`LedgerError::Store`] when the store cannot be read.
pub fn run_migration<S: RecordStore + ?Sized>(
    store: &mut S,
    plan: &MigrationPlan,
    options: &MigrationOptions,
) -> Result<MigrationRunReport, LedgerError> {
    plan.validate()?;
    let selected = plan.selected_collections(&options.collections)?;
    let mode = options.mode;
    info!(mode = mode.as_str(), collections = selected.len(), "migration started");

    let mut assignments = Vec::new();
    for target in plan.targets.iter().filter(|target| target.assign_missing) {
        assignments.extend(assign_missing_codes(store, target, mode)?);
    }

    info!(phase = "building_lookup", targets = plan.targets.len());
    let mut cache = LookupCache::build(store, &plan.targets)?;
    cache.record_assignments(&assignments);

    info!(phase = "scanning", entries = cache.len());
    let mut collections = Vec::with_capacity(selected.len());
    for collection in &selected {
        collections.push(scan_collection(store, &cache, collection, mode)?);
    }

    let mut duplicates = Vec::new();
    for spec in &plan.duplicate_keys {
        if options.collections.is_empty() || options.collections.contains(&spec.collection) {
            duplicates.push(resolve_duplicates(store, &cache, spec, mode)?);
        }
    }

    let mut orphan_deletions = Vec::new();
    if options.delete_orphaned {
        for scan in collections.iter().filter(|scan| !scan.orphans.is_empty()) {
            orphan_deletions.push(delete_orphaned(
                store,
                &scan.collection,
                &scan.orphans,
                mode.is_apply(),
            )?);
        }
    }

    let totals = RunTotals {
        scanned: collections.iter().map(|scan| scan.scanned).sum(),
        already_valid: collections.iter().map(|scan| scan.already_valid).sum(),
        resolved: collections.iter().map(|scan| scan.resolved).sum(),
        orphaned: collections.iter().map(|scan| scan.orphaned).sum(),
        skipped: collections.iter().map(|scan| scan.skipped).sum(),
        errors: collections.iter().map(|scan| scan.errors).sum(),
        documents_changed: collections.iter().map(|scan| scan.documents_changed).sum(),
        duplicates_deleted: duplicates.iter().map(|report| report.deleted).sum(),
        orphans_deleted: orphan_deletions.iter().map(|report| report.deleted).sum(),
    };
    let status = mode.terminal_status();
    info!(
        status = status.as_str(),
        scanned = totals.scanned,
        changed = totals.documents_changed,
        errors = totals.errors,
        "migration finished"
    );

    Ok(MigrationRunReport {
        contract_version: MIGRATION_RUN_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new().to_string(),
        generated_at: format_rfc3339(now_utc())?,
        plan_version: plan.plan_version,
        mode,
        status,
        assignments,
        collections,
        duplicates,
        orphan_deletions,
        totals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::FieldPath;
    use crate::plan::ReferenceField;
    use crate::testing::VecStore;
    use proptest::prelude::*;
    use serde_json::json;

    const ACME_REF: &str = "507f1f77bcf86cd799439011";
    const GHOST_REF: &str = "65a1b2c3d4e5f60718293a4b";

    fn must<T>(result: Result<T, LedgerError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn field(path: &str, target: &str) -> ReferenceField {
        ReferenceField {
            path: must(FieldPath::parse(path)),
            target: target.to_string(),
        }
    }

    fn companies_target() -> TargetSpec {
        TargetSpec {
            collection: "companies".to_string(),
            code_fields: vec!["id".to_string(), "companyId".to_string()],
            assign_missing: false,
        }
    }

    fn small_plan() -> MigrationPlan {
        MigrationPlan {
            plan_version: 1,
            targets: vec![
                companies_target(),
                TargetSpec {
                    collection: "uniforms".to_string(),
                    code_fields: vec!["id".to_string()],
                    assign_missing: false,
                },
            ],
            collections: vec![
                CollectionPlan {
                    collection: "employees".to_string(),
                    fields: vec![field("companyId", "companies")],
                },
                CollectionPlan {
                    collection: "orders".to_string(),
                    fields: vec![
                        field("companyId", "companies"),
                        field("items.uniformId", "uniforms"),
                    ],
                },
            ],
            duplicate_keys: Vec::new(),
        }
    }

    fn seeded_store() -> VecStore {
        let mut store = VecStore::default();
        store.insert("companies", ACME_REF, json!({"_id": {"$oid": ACME_REF}, "id": "100004", "name": "Acme"}));
        store.insert("employees", "e1", json!({"companyId": ACME_REF, "name": "Asha"}));
        store
    }

    fn options(mode: MigrationMode) -> MigrationOptions {
        MigrationOptions {
            mode,
            ..MigrationOptions::default()
        }
    }

    #[test]
    fn end_to_end_resolution_is_idempotent() {
        let mut store = seeded_store();
        let plan = small_plan();

        let dry = must(run_migration(&mut store, &plan, &options(MigrationMode::DryRun)));
        assert_eq!(dry.status, RunStatus::DryRunComplete);
        assert_eq!(dry.totals.resolved, 1);
        assert_eq!(
            dry.collections[0].changes,
            vec![FieldChange {
                doc_id: "e1".to_string(),
                path: "companyId".to_string(),
                from: ACME_REF.to_string(),
                to: "100004".to_string(),
            }]
        );
        assert_eq!(store.writes, 0);
        assert_eq!(
            store.body("employees", "e1"),
            Some(json!({"companyId": ACME_REF, "name": "Asha"}))
        );

        let applied = must(run_migration(&mut store, &plan, &options(MigrationMode::Apply)));
        assert_eq!(applied.status, RunStatus::Applied);
        assert_eq!(applied.totals.documents_changed, 1);
        assert_eq!(
            store.body("employees", "e1"),
            Some(json!({"companyId": "100004", "name": "Asha"}))
        );

        let again = must(run_migration(&mut store, &plan, &options(MigrationMode::Apply)));
        assert_eq!(again.totals.resolved, 0);
        assert_eq!(again.totals.documents_changed, 0);
        assert_eq!(again.totals.already_valid, 1);
    }

    #[test]
    fn orphans_are_reported_and_left_in_place() {
        let mut store = seeded_store();
        store.insert("employees", "e2", json!({"companyId": GHOST_REF}));
        let before = store.body("employees", "e2");

        let report = must(run_migration(&mut store, &small_plan(), &options(MigrationMode::DryRun)));
        let employees = &report.collections[0];
        assert_eq!(employees.orphaned, 1);
        assert_eq!(employees.orphans[0].reference, GHOST_REF);
        assert_eq!(employees.orphans[0].target, "companies");
        assert_eq!(store.body("employees", "e2"), before);

        let applied = must(run_migration(&mut store, &small_plan(), &options(MigrationMode::Apply)));
        assert_eq!(applied.totals.orphaned, 1);
        assert_eq!(store.body("employees", "e2"), before);
        assert!(applied.orphan_deletions.is_empty());
    }

    #[test]
    fn orphan_deletion_requires_confirmation() {
        let mut store = seeded_store();
        store.insert("employees", "e2", json!({"companyId": GHOST_REF}));
        let orphans = vec![
            OrphanRef {
                doc_id: "e2".to_string(),
                path: "companyId".to_string(),
                target: "companies".to_string(),
                reference: GHOST_REF.to_string(),
            };
            2
        ];

        let report = must(delete_orphaned(&mut store, "employees", &orphans, false));
        assert_eq!(report.candidates, vec!["e2".to_string()]);
        assert_eq!(report.deleted, 0);
        assert_eq!(store.count("employees"), 2);

        let report = must(delete_orphaned(&mut store, "employees", &orphans, true));
        assert_eq!(report.deleted, 1);
        assert_eq!(store.count("employees"), 1);
    }

    #[test]
    fn delete_orphaned_option_only_deletes_when_applying() {
        let mut store = seeded_store();
        store.insert("employees", "e2", json!({"companyId": GHOST_REF}));
        let mut run = options(MigrationMode::DryRun);
        run.delete_orphaned = true;

        let dry = must(run_migration(&mut store, &small_plan(), &run));
        assert_eq!(dry.orphan_deletions.len(), 1);
        assert!(!dry.orphan_deletions[0].executed);
        assert_eq!(store.count("employees"), 2);

        run.mode = MigrationMode::Apply;
        let applied = must(run_migration(&mut store, &small_plan(), &run));
        assert_eq!(applied.totals.orphans_deleted, 1);
        assert_eq!(store.body("employees", "e2"), None);
    }

    #[test]
    fn nested_items_rewrite_only_changed_fields() {
        let mut store = seeded_store();
        store.insert("uniforms", "aaaaaaaaaaaaaaaaaaaaaaaa", json!({"id": "200001"}));
        store.insert(
            "orders",
            "o1",
            json!({"companyId": "100004", "items": [
                {"uniformId": "aaaaaaaaaaaaaaaaaaaaaaaa", "qty": 2},
                {"uniformId": "200002", "qty": 1}
            ]}),
        );
        store.insert(
            "orders",
            "o2",
            json!({"companyId": "100004", "items": [{"uniformId": "200001"}]}),
        );

        let report = must(run_migration(&mut store, &small_plan(), &options(MigrationMode::Apply)));
        let orders = &report.collections[1];
        assert_eq!(orders.resolved, 1);
        assert_eq!(orders.already_valid, 4);
        assert_eq!(orders.documents_changed, 1);
        assert_eq!(
            store.body("orders", "o1"),
            Some(json!({"companyId": "100004", "items": [
                {"uniformId": "200001", "qty": 2},
                {"uniformId": "200002", "qty": 1}
            ]}))
        );
    }

    #[test]
    fn malformed_document_fails_alone_without_partial_writes() {
        let mut store = seeded_store();
        store.insert("orders", "o1", json!({"companyId": ACME_REF, "items": "n/a"}));
        store.insert("orders", "o2", json!({"companyId": ACME_REF}));

        let report = must(run_migration(&mut store, &small_plan(), &options(MigrationMode::Apply)));
        let orders = &report.collections[1];
        assert_eq!(orders.scanned, 2);
        assert_eq!(orders.errors, 1);
        assert_eq!(orders.failures[0].doc_id, "o1");
        assert_eq!(orders.resolved, 1);
        assert_eq!(
            store.body("orders", "o1"),
            Some(json!({"companyId": ACME_REF, "items": "n/a"}))
        );
        assert_eq!(store.body("orders", "o2"), Some(json!({"companyId": "100004"})));
    }

    #[test]
    fn rejected_write_fails_the_run() {
        let mut store = seeded_store();
        store.insert("employees", "e2", json!({"companyId": ACME_REF}));
        store.fail_updates_for("e1");

        let result = run_migration(&mut store, &small_plan(), &options(MigrationMode::Apply));
        assert!(matches!(result, Err(LedgerError::Store(_))));
        assert_eq!(store.body("employees", "e1"), Some(json!({"companyId": ACME_REF, "name": "Asha"})));
        assert_eq!(store.body("employees", "e2"), Some(json!({"companyId": ACME_REF})));
        assert_eq!(store.writes, 0);
    }

    #[test]
    fn rejected_write_is_ignored_by_dry_run() {
        let mut store = seeded_store();
        store.fail_updates_for("e1");

        let report = must(run_migration(&mut store, &small_plan(), &options(MigrationMode::DryRun)));
        assert_eq!(report.collections[0].errors, 0);
        assert_eq!(report.collections[0].documents_changed, 1);
    }

    #[test]
    fn embedded_and_native_references_collapse_to_codes() {
        let mut store = seeded_store();
        store.insert("employees", "e2", json!({"companyId": {"$oid": ACME_REF}}));
        store.insert("employees", "e3", json!({"companyId": {"_id": ACME_REF, "name": "Acme"}}));

        must(run_migration(&mut store, &small_plan(), &options(MigrationMode::Apply)));
        for id in ["e2", "e3"] {
            assert_eq!(store.body("employees", id), Some(json!({"companyId": "100004"})));
        }
    }

    #[test]
    fn lookup_falls_back_through_candidate_fields() {
        let mut store = VecStore::default();
        store.insert("companies", ACME_REF, json!({"id": "legacy-acme", "companyId": "100004"}));
        store.insert("companies", GHOST_REF, json!({"name": "no code"}));
        let cache = must(LookupCache::build(&store, &[companies_target()]));
        let acme = LegacyRef::parse(ACME_REF);
        let ghost = LegacyRef::parse(GHOST_REF);
        assert_eq!(acme.as_ref().and_then(|r| cache.resolve("companies", r)), Some("100004"));
        assert_eq!(ghost.as_ref().and_then(|r| cache.resolve("companies", r)), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_codes_are_assigned_after_the_highest() {
        let mut store = VecStore::default();
        store.insert("companies", ACME_REF, json!({"id": "100007"}));
        store.insert("companies", GHOST_REF, json!({"name": "Globex"}));
        let mut target = companies_target();
        target.assign_missing = true;

        let dry = must(assign_missing_codes(&mut store, &target, MigrationMode::DryRun));
        assert_eq!(dry[0].code, "100008");
        assert_eq!(store.body("companies", GHOST_REF), Some(json!({"name": "Globex"})));

        must(assign_missing_codes(&mut store, &target, MigrationMode::Apply));
        assert_eq!(
            store.body("companies", GHOST_REF),
            Some(json!({"name": "Globex", "id": "100008"}))
        );
        assert!(must(assign_missing_codes(&mut store, &target, MigrationMode::Apply)).is_empty());
    }

    #[test]
    fn first_assigned_code_and_exhaustion() {
        let mut store = VecStore::default();
        store.insert("companies", "a", json!({}));
        let target = companies_target();
        let assigned = must(assign_missing_codes(&mut store, &target, MigrationMode::DryRun));
        assert_eq!(assigned[0].code, "100001");

        store.insert("companies", "b", json!({"id": "999999"}));
        assert!(matches!(
            assign_missing_codes(&mut store, &target, MigrationMode::DryRun),
            Err(LedgerError::Configuration(_))
        ));
    }

    #[test]
    fn dry_run_assignments_feed_the_lookup() {
        let mut store = VecStore::default();
        store.insert("companies", GHOST_REF, json!({"name": "Globex"}));
        store.insert("employees", "e1", json!({"companyId": GHOST_REF}));
        let mut plan = small_plan();
        plan.targets[0].assign_missing = true;

        let report = must(run_migration(&mut store, &plan, &options(MigrationMode::DryRun)));
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.collections[0].resolved, 1);
        assert_eq!(report.collections[0].changes[0].to, "100001");
        assert_eq!(store.writes, 0);
    }

    #[test]
    fn duplicates_are_grouped_after_normalization() {
        let mut store = seeded_store();
        store.insert("employees", "e9", json!({"id": "300001"}));
        store.insert(
            "company_admins",
            "a1",
            json!({"companyId": ACME_REF, "employeeId": "300001", "createdAt": "2024-01-01T00:00:00Z"}),
        );
        store.insert(
            "company_admins",
            "a2",
            json!({"companyId": "100004", "employeeId": "300001", "createdAt": "2024-02-01T00:00:00Z"}),
        );
        store.insert(
            "company_admins",
            "a3",
            json!({"companyId": "100004", "employeeId": "300002"}),
        );
        let mut plan = small_plan();
        plan.targets.push(TargetSpec {
            collection: "employees".to_string(),
            code_fields: vec!["id".to_string()],
            assign_missing: false,
        });
        plan.duplicate_keys.push(DuplicateKeySpec {
            collection: "company_admins".to_string(),
            fields: vec![field("companyId", "companies"), field("employeeId", "employees")],
            created_field: "createdAt".to_string(),
        });

        let dry = must(run_migration(&mut store, &plan, &options(MigrationMode::DryRun)));
        assert_eq!(dry.duplicates[0].groups.len(), 1);
        assert_eq!(dry.duplicates[0].groups[0].keep, "a1");
        assert_eq!(dry.duplicates[0].groups[0].delete, vec!["a2".to_string()]);
        assert_eq!(store.count("company_admins"), 3);

        let applied = must(run_migration(&mut store, &plan, &options(MigrationMode::Apply)));
        assert_eq!(applied.totals.duplicates_deleted, 1);
        assert_eq!(store.count("company_admins"), 2);
        assert_eq!(store.body("company_admins", "a2"), None);
    }

    #[test]
    fn collection_filter_limits_scans() {
        let mut store = seeded_store();
        let mut run = options(MigrationMode::DryRun);
        run.collections = vec!["orders".to_string()];
        let report = must(run_migration(&mut store, &small_plan(), &run));
        assert_eq!(report.collections.len(), 1);
        assert_eq!(report.collections[0].collection, "orders");

        run.collections = vec!["nope".to_string()];
        assert!(run_migration(&mut store, &small_plan(), &run).is_err());
    }

    #[derive(Debug, Clone)]
    enum Fixture {
        Known,
        Unknown,
        Canonical,
        Junk,
    }

    fn arb_fixture() -> impl Strategy<Value = Fixture> {
        prop_oneof![
            Just(Fixture::Known),
            Just(Fixture::Unknown),
            Just(Fixture::Canonical),
            Just(Fixture::Junk),
        ]
    }

    fn fixture_value(fixture: &Fixture) -> Value {
        match fixture {
            Fixture::Known => json!(ACME_REF),
            Fixture::Unknown => json!(GHOST_REF),
            Fixture::Canonical => json!("100004"),
            Fixture::Junk => json!(42),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_second_apply_changes_nothing(
            docs in prop::collection::vec((arb_fixture(), prop::collection::vec(arb_fixture(), 0..4)), 1..10)
        ) {
            let mut store = seeded_store();
            for (index, (company, items)) in docs.iter().enumerate() {
                let items: Vec<Value> = items
                    .iter()
                    .map(|item| json!({"uniformId": fixture_value(item)}))
                    .collect();
                store.insert(
                    "orders",
                    &format!("o{index:03}"),
                    json!({"companyId": fixture_value(company), "items": items}),
                );
            }
            store.insert("uniforms", ACME_REF, json!({"id": "200001"}));
            let plan = small_plan();

            let first = must(run_migration(&mut store, &plan, &options(MigrationMode::Apply)));
            let snapshot = store.clone();
            let second = must(run_migration(&mut store, &plan, &options(MigrationMode::Apply)));

            prop_assert_eq!(second.totals.resolved, 0);
            prop_assert_eq!(second.totals.documents_changed, 0);
            prop_assert_eq!(second.totals.orphaned, first.totals.orphaned);
            prop_assert_eq!(store.writes, snapshot.writes);
        }
    }
}
