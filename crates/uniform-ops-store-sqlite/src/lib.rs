#![allow(clippy::missing_errors_doc)]

//! `SQLite`-backed snapshot of the document database.
//!
//! Each document is one row keyed by `(collection, doc_id)` with its body
//! kept as JSON text, so a dump of the live store can be loaded, migrated
//! and inspected offline.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};
use ulid::Ulid;
use uniform_ops_core::{
    classify_reference, format_rfc3339, now_utc, Document, LedgerError, RecordStore,
    ReferenceKind,
};

const DOCUMENT_MIGRATION_VERSION: i64 = 1;

const SCHEMA_DOCUMENTS_V1: &str = r"
CREATE TABLE IF NOT EXISTS documents (
  collection TEXT NOT NULL,
  doc_id TEXT NOT NULL,
  body_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (collection, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection
  ON documents(collection);
";

pub struct SqliteRecordStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub collection: String,
    pub imported: usize,
    pub replaced: usize,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_DOCUMENTS_V1)
            .context("failed to apply document schema")?;

        let now = timestamp()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DOCUMENT_MIGRATION_VERSION, now],
            )
            .context("failed to register document schema migration")?;

        Ok(())
    }

    /// Loads a JSON array of documents into `collection` in one transaction.
    pub fn import_documents(&mut self, collection: &str, documents: &[Value]) -> Result<ImportReport> {
        if collection.trim().is_empty() {
            bail!("collection name must be non-empty");
        }

        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;
        let now = timestamp()?;
        let mut report = ImportReport {
            collection: collection.to_string(),
            imported: 0,
            replaced: 0,
        };
        for (index, value) in documents.iter().enumerate() {
            let Value::Object(body) = value else {
                bail!("document #{index} of {collection} is not a JSON object");
            };
            let doc_id = document_id_for(body);
            let existed: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM documents WHERE collection = ?1 AND doc_id = ?2",
                    params![collection, doc_id],
                    |row| row.get(0),
                )
                .optional()
                .context("failed to probe existing document")?;
            let body_json =
                serde_json::to_string(body).context("failed to serialize document body")?;
            tx.execute(
                "INSERT OR REPLACE INTO documents(collection, doc_id, body_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![collection, doc_id, body_json, now],
            )
            .with_context(|| format!("failed to import {collection}/{doc_id}"))?;
            report.imported += 1;
            if existed.is_some() {
                report.replaced += 1;
            }
        }
        tx.commit().context("failed to commit import transaction")?;

        info!(
            collection = %collection,
            imported = report.imported,
            replaced = report.replaced,
            "snapshot imported"
        );
        Ok(report)
    }

    pub fn get_document(&self, collection: &str, doc_id: &str) -> Result<Option<Document>> {
        self.body_json(collection, doc_id)?
            .map(|body_json| Ok(Document::new(doc_id, parse_body(doc_id, &body_json)?)))
            .transpose()
    }

    /// Raw stored JSON text of one document.
    pub fn body_json(&self, collection: &str, doc_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT body_json FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {collection}/{doc_id}"))
    }

    pub fn documents(&self, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT doc_id, body_json FROM documents
                 WHERE collection = ?1
                 ORDER BY doc_id ASC",
            )
            .context("failed to prepare collection query")?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .with_context(|| format!("failed to list {collection}"))?;

        let mut documents = Vec::new();
        for row in rows {
            let (doc_id, body_json) = row.context("failed to read document row")?;
            let body = parse_body(&doc_id, &body_json)?;
            documents.push(Document::new(doc_id, body));
        }
        Ok(documents)
    }

    pub fn export_collection(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .documents(collection)?
            .into_iter()
            .map(|doc| Value::Object(doc.body))
            .collect())
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {collection}"))?;
        usize::try_from(count).with_context(|| format!("invalid document count: {count}"))
    }

    fn merge_fields(
        &mut self,
        collection: &str,
        doc_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;
        let raw: Option<String> = tx
            .query_row(
                "SELECT body_json FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, doc_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {collection}/{doc_id}"))?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut body = parse_body(doc_id, &raw)?;
        for (key, value) in fields {
            body.insert(key.clone(), value.clone());
        }
        let body_json = serde_json::to_string(&body).context("failed to serialize document body")?;
        tx.execute(
            "UPDATE documents SET body_json = ?3, updated_at = ?4
             WHERE collection = ?1 AND doc_id = ?2",
            params![collection, doc_id, body_json, timestamp()?],
        )
        .with_context(|| format!("failed to update {collection}/{doc_id}"))?;
        tx.commit().context("failed to commit update transaction")?;

        debug!(collection = %collection, doc_id = %doc_id, fields = fields.len(), "document updated");
        Ok(true)
    }

    fn remove_documents(&mut self, collection: &str, doc_ids: &[String]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start delete transaction")?;
        let mut deleted = 0;
        for doc_id in doc_ids {
            deleted += tx
                .execute(
                    "DELETE FROM documents WHERE collection = ?1 AND doc_id = ?2",
                    params![collection, doc_id],
                )
                .with_context(|| format!("failed to delete {collection}/{doc_id}"))?;
        }
        tx.commit().context("failed to commit delete transaction")?;
        Ok(deleted)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl RecordStore for SqliteRecordStore {
    fn list_documents(&self, collection: &str) -> Result<Vec<Document>, LedgerError> {
        self.documents(collection).map_err(store_error)
    }

    fn update_fields(
        &mut self,
        collection: &str,
        doc_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, LedgerError> {
        self.merge_fields(collection, doc_id, fields)
            .map_err(store_error)
    }

    fn delete_documents(
        &mut self,
        collection: &str,
        doc_ids: &[String],
    ) -> Result<usize, LedgerError> {
        self.remove_documents(collection, doc_ids)
            .map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> LedgerError {
    LedgerError::Store(format!("{err:#}"))
}

fn timestamp() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn parse_body(doc_id: &str, body_json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(body_json)
        .with_context(|| format!("invalid stored JSON for document {doc_id}"))?
    {
        Value::Object(body) => Ok(body),
        _ => Err(anyhow!("stored document {doc_id} is not a JSON object")),
    }
}

/// Primary key for an imported document: the lowercase hex of a legacy
/// `_id`, the `_id` string or number as written, or a fresh ULID.
#[must_use]
pub fn document_id_for(body: &Map<String, Value>) -> String {
    let Some(raw) = body.get("_id") else {
        return Ulid::new().to_string();
    };
    match classify_reference(raw) {
        ReferenceKind::Legacy(reference) => reference.to_string(),
        ReferenceKind::Canonical(code) => code.to_string(),
        ReferenceKind::NotAReference => match raw {
            Value::String(value) if !value.is_empty() => value.clone(),
            Value::Number(value) => value.to_string(),
            _ => Ulid::new().to_string(),
        },
    }
}
