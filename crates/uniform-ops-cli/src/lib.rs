//! Embeddable command surface for the `uops` repair tool.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_ops_with_db`] for direct [`OpsCommand`] execution against a DB path.
//! - [`run_ops`] for execution against an existing [`SqliteRecordStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing::info;
use uniform_ops_core::{
    aggregate_split_status, audit_requisition_rollups, audit_status_consistency,
    backfill_unified_status, run_migration, status_mappings, BackfillReport, EntityKind,
    MigrationMode, MigrationOptions, MigrationPlan, MigrationRunReport, RollupAuditReport,
    StatusAuditReport,
};
use uniform_ops_store_sqlite::SqliteRecordStore;

#[derive(Debug, Parser)]
#[command(name = "uops")]
#[command(about = "Reference migration and status audit tooling for the uniform ordering store")]
pub struct Cli {
    #[arg(long, default_value = "./uniform_ops.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: OpsCommand,
}

#[derive(Debug, Subcommand)]
pub enum OpsCommand {
    /// Rewrite legacy references to canonical codes.
    Migrate(MigrateArgs),
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
}

#[derive(Debug, Args)]
pub struct ModeArgs {
    /// Report changes without writing (default).
    #[arg(long, conflicts_with = "apply")]
    dry_run: bool,
    /// Perform the writes.
    #[arg(long, visible_alias = "execute")]
    apply: bool,
}

impl ModeArgs {
    fn mode(&self) -> MigrationMode {
        if self.apply {
            MigrationMode::Apply
        } else {
            MigrationMode::DryRun
        }
    }
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long)]
    plan: Option<PathBuf>,
    #[arg(long = "collection")]
    collections: Vec<String>,
    #[command(flatten)]
    mode: ModeArgs,
    #[arg(long)]
    delete_orphaned: bool,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    /// Compare legacy and unified status fields.
    Status(AuditStatusArgs),
    /// Compare persisted requisition status with its split orders.
    Rollups(JsonArgs),
}

#[derive(Debug, Args)]
pub struct AuditStatusArgs {
    #[arg(long = "entity")]
    entities: Vec<EntityArg>,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum StatusCommand {
    /// Fill missing unified status from the legacy status.
    Backfill(BackfillArgs),
    /// Compute a requisition's status from its split statuses.
    Aggregate(AggregateArgs),
}

#[derive(Debug, Args)]
pub struct BackfillArgs {
    #[arg(long)]
    entity: EntityArg,
    #[command(flatten)]
    mode: ModeArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AggregateArgs {
    #[arg(long = "status")]
    statuses: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    /// Load a JSON array of documents into a collection.
    Import(ImportArgs),
    /// Print a collection as a JSON array.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    collection: String,
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    collection: String,
}

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Print the built-in plan, or validate and print a plan file.
    Show(PlanShowArgs),
}

#[derive(Debug, Args)]
pub struct PlanShowArgs {
    #[arg(long)]
    plan: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EntityArg {
    Order,
    PurchaseRequisition,
    PurchaseOrder,
    Shipment,
    GoodsReceipt,
    Invoice,
}

impl EntityArg {
    fn kind(self) -> EntityKind {
        match self {
            Self::Order => EntityKind::Order,
            Self::PurchaseRequisition => EntityKind::PurchaseRequisition,
            Self::PurchaseOrder => EntityKind::PurchaseOrder,
            Self::Shipment => EntityKind::Shipment,
            Self::GoodsReceipt => EntityKind::GoodsReceipt,
            Self::Invoice => EntityKind::Invoice,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_ops_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// Commands that never touch documents run without opening the store.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_ops_with_db(db_path: &Path, command: OpsCommand) -> Result<()> {
    match command {
        OpsCommand::Plan { command } => run_plan(command),
        OpsCommand::Status {
            command: StatusCommand::Aggregate(args),
        } => run_aggregate(&args),
        ops_command => {
            let mut store = SqliteRecordStore::open(db_path)?;
            store.migrate()?;
            run_ops(ops_command, &mut store)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when configuration is invalid or the store fails.
pub fn run_ops(command: OpsCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        OpsCommand::Migrate(args) => run_migrate(args, store),
        OpsCommand::Audit { command } => run_audit(command, store),
        OpsCommand::Status { command } => run_status(command, store),
        OpsCommand::Store { command } => run_store(command, store),
        OpsCommand::Plan { command } => run_plan(command),
    }
}

fn run_migrate(args: MigrateArgs, store: &mut SqliteRecordStore) -> Result<()> {
    let plan = load_plan(args.plan.as_deref())?;
    let options = MigrationOptions {
        mode: args.mode.mode(),
        delete_orphaned: args.delete_orphaned,
        collections: args.collections,
    };

    let report = run_migration(store, &plan, &options)?;
    if let Some(path) = args.report.as_deref() {
        write_report(path, &report)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_migration_report(&report);
    }
    Ok(())
}

fn run_audit(command: AuditCommand, store: &SqliteRecordStore) -> Result<()> {
    match command {
        AuditCommand::Status(args) => {
            let kinds: Vec<EntityKind> = args.entities.iter().map(|entity| entity.kind()).collect();
            let report = audit_status_consistency(store, &status_mappings(&kinds))?;
            if let Some(path) = args.report.as_deref() {
                write_report(path, &report)?;
            }
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status_audit(&report);
            }
            Ok(())
        }
        AuditCommand::Rollups(args) => {
            let report = audit_requisition_rollups(store)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_rollup_audit(&report);
            }
            Ok(())
        }
    }
}

fn run_status(command: StatusCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        StatusCommand::Backfill(args) => {
            let report =
                backfill_unified_status(store, args.entity.kind().mapping(), args.mode.mode())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_backfill_report(&report);
            }
            Ok(())
        }
        StatusCommand::Aggregate(args) => run_aggregate(&args),
    }
}

fn run_aggregate(args: &AggregateArgs) -> Result<()> {
    let labels: Vec<&str> = args.statuses.iter().map(String::as_str).collect();
    let status = aggregate_split_status(&labels);
    if args.json {
        let payload = serde_json::json!({
            "status": status.as_str(),
            "splits": labels.len(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{status}");
    }
    Ok(())
}

fn run_store(command: StoreCommand, store: &mut SqliteRecordStore) -> Result<()> {
    match command {
        StoreCommand::Import(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read {}", args.file.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("{} must contain valid JSON", args.file.display()))?;
            let Value::Array(documents) = value else {
                return Err(anyhow!(
                    "{} must contain a JSON array of documents",
                    args.file.display()
                ));
            };
            let report = store.import_documents(&args.collection, &documents)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        StoreCommand::Export(args) => {
            let documents = store.export_collection(&args.collection)?;
            println!("{}", serde_json::to_string_pretty(&documents)?);
            Ok(())
        }
    }
}

fn run_plan(command: PlanCommand) -> Result<()> {
    match command {
        PlanCommand::Show(args) => {
            let plan = load_plan(args.plan.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

fn load_plan(path: Option<&Path>) -> Result<MigrationPlan> {
    let Some(path) = path else {
        return Ok(MigrationPlan::v1());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read migration plan {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("migration plan {} must be valid JSON", path.display()))?;
    MigrationPlan::from_json(&value)
        .with_context(|| format!("invalid migration plan {}", path.display()))
}

fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(report)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed writing report to {}", path.display()))?;
    info!(path = %path.display(), "report written");
    Ok(())
}

fn print_migration_report(report: &MigrationRunReport) {
    println!(
        "contract={} run_id={} mode={} status={}",
        report.contract_version,
        report.run_id,
        report.mode.as_str(),
        report.status.as_str()
    );
    if !report.assignments.is_empty() {
        println!("assigned_codes={}", report.assignments.len());
    }
    println!(
        "{:<22} {:>8} {:>8} {:>9} {:>9} {:>8} {:>7} {:>8}",
        "collection", "scanned", "valid", "resolved", "orphaned", "skipped", "errors", "changed"
    );
    println!("{}", "-".repeat(86));
    for scan in &report.collections {
        println!(
            "{:<22} {:>8} {:>8} {:>9} {:>9} {:>8} {:>7} {:>8}",
            scan.collection,
            scan.scanned,
            scan.already_valid,
            scan.resolved,
            scan.orphaned,
            scan.skipped,
            scan.errors,
            scan.documents_changed
        );
        for failure in &scan.failures {
            println!("  failed {}: {}", failure.doc_id, failure.message);
        }
    }

    for duplicates in &report.duplicates {
        println!(
            "duplicates collection={} key={} groups={} deleted={}",
            duplicates.collection,
            duplicates.key_fields.join("+"),
            duplicates.groups.len(),
            duplicates.deleted
        );
    }
    for deletion in &report.orphan_deletions {
        println!(
            "orphans collection={} candidates={} deleted={} executed={}",
            deletion.collection,
            deletion.candidates.len(),
            deletion.deleted,
            if deletion.executed { "yes" } else { "no" }
        );
    }

    if report.mode.is_apply() {
        println!(
            "changed={} scanned={}",
            report.totals.documents_changed, report.totals.scanned
        );
    } else {
        println!(
            "would_change={} scanned={} (dry run, nothing written)",
            report.totals.documents_changed, report.totals.scanned
        );
    }
}

fn print_status_audit(report: &StatusAuditReport) {
    println!(
        "contract={} run_id={} clean={}",
        report.contract_version,
        report.run_id,
        if report.is_clean() { "yes" } else { "no" }
    );
    println!(
        "{:<22} {:<24} {:>8} {:>11} {:>6} {:>13}",
        "entity", "collection", "scanned", "consistent", "null", "inconsistent"
    );
    println!("{}", "-".repeat(90));
    for entity in &report.entities {
        println!(
            "{:<22} {:<24} {:>8} {:>11} {:>6} {:>13}",
            entity.entity.as_str(),
            entity.collection,
            entity.scanned,
            entity.consistent,
            entity.null,
            entity.inconsistent
        );
        for sample in entity.null_samples.iter().chain(&entity.inconsistent_samples) {
            println!(
                "  {} legacy={} unified={} expected={}",
                sample.doc_id,
                sample.legacy.as_deref().unwrap_or("none"),
                sample.unified.as_deref().unwrap_or("none"),
                sample.expected.as_deref().unwrap_or("unmapped")
            );
        }
    }
}

fn print_backfill_report(report: &BackfillReport) {
    println!(
        "contract={} entity={} mode={} status={}",
        report.contract_version,
        report.entity.as_str(),
        report.mode.as_str(),
        report.status.as_str()
    );
    println!(
        "scanned={} already_set={} backfilled={} unmapped={} errors={}",
        report.scanned, report.already_set, report.backfilled, report.unmapped, report.errors
    );
    for sample in &report.unmapped_samples {
        println!(
            "  unmapped {} legacy={}",
            sample.doc_id,
            sample.legacy.as_deref().unwrap_or("none")
        );
    }
}

fn print_rollup_audit(report: &RollupAuditReport) {
    println!(
        "contract={} requisitions={} matching={} mismatched={} without_splits={}",
        report.contract_version,
        report.requisitions,
        report.matching,
        report.mismatched,
        report.without_splits
    );
    for sample in &report.samples {
        println!(
            "  {} persisted={} computed={} splits={}",
            sample.code.as_deref().unwrap_or(&sample.requisition_id),
            sample.persisted.as_deref().unwrap_or("none"),
            sample.computed,
            sample.splits
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_path(name: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("uops-{name}-{}.{extension}", ulid::Ulid::new()))
    }

    #[test]
    fn mode_defaults_to_dry_run() {
        let cli = must(Cli::try_parse_from(["uops", "migrate"]).map_err(anyhow::Error::from));
        let OpsCommand::Migrate(args) = cli.command else {
            panic!("expected migrate command");
        };
        assert_eq!(args.mode.mode(), MigrationMode::DryRun);
    }

    #[test]
    fn execute_is_an_alias_for_apply() {
        let cli = must(
            Cli::try_parse_from(["uops", "migrate", "--execute", "--delete-orphaned"])
                .map_err(anyhow::Error::from),
        );
        let OpsCommand::Migrate(args) = cli.command else {
            panic!("expected migrate command");
        };
        assert_eq!(args.mode.mode(), MigrationMode::Apply);
        assert!(args.delete_orphaned);
    }

    #[test]
    fn dry_run_and_apply_conflict() {
        assert!(Cli::try_parse_from(["uops", "migrate", "--dry-run", "--apply"]).is_err());
        assert!(Cli::try_parse_from([
            "uops", "status", "backfill", "--entity", "invoice", "--dry-run", "--execute"
        ])
        .is_err());
    }

    #[test]
    fn load_plan_defaults_to_builtin_and_rejects_bad_files() {
        assert_eq!(must(load_plan(None)), MigrationPlan::v1());

        let path = temp_path("bad-plan", "json");
        if let Err(err) = fs::write(&path, r#"{"plan_version": 0, "targets": [], "collections": []}"#) {
            panic!("failed to write fixture: {err}");
        }
        assert!(load_plan(Some(&path)).is_err());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn migrate_writes_report_file() {
        let db_path = temp_path("migrate", "sqlite3");
        let report_path = temp_path("migrate-report", "json");
        let mut store = must(SqliteRecordStore::open(&db_path));
        must(store.migrate());
        must(store.import_documents(
            "companies",
            &[serde_json::json!({"_id": {"$oid": "507f1f77bcf86cd799439011"}, "id": "100004"})],
        ));
        must(store.import_documents(
            "employees",
            &[serde_json::json!({"_id": "e1", "companyId": "507f1f77bcf86cd799439011"})],
        ));

        let cli = must(
            Cli::try_parse_from([
                "uops",
                "migrate",
                "--collection",
                "employees",
                "--apply",
                "--report",
                &report_path.to_string_lossy(),
            ])
            .map_err(anyhow::Error::from),
        );
        must(run_ops(cli.command, &mut store));

        let written: Value = match fs::read_to_string(&report_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(written["contract_version"], "migration_run.v1");
        assert_eq!(written["status"], "APPLIED");
        assert_eq!(written["totals"]["documents_changed"], 1);

        let _ = fs::remove_file(&report_path);
        let _ = fs::remove_file(&db_path);
    }
}
