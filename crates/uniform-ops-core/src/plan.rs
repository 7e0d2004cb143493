//! Migration plan: which collections hold references, where they point,
//! and how target collections expose their canonical codes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::path::FieldPath;
use crate::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TargetSpec {
    pub collection: String,
    /// Candidate code fields in order of preference; the first is the
    /// primary field that receives assigned codes.
    pub code_fields: Vec<String>,
    #[serde(default)]
    pub assign_missing: bool,
}

impl TargetSpec {
    #[must_use]
    pub fn primary_code_field(&self) -> &str {
        self.code_fields.first().map_or("id", String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReferenceField {
    pub path: FieldPath,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CollectionPlan {
    pub collection: String,
    pub fields: Vec<ReferenceField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateKeySpec {
    pub collection: String,
    pub fields: Vec<ReferenceField>,
    #[serde(default = "default_created_field")]
    pub created_field: String,
}

fn default_created_field() -> String {
    "createdAt".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationPlan {
    pub plan_version: u32,
    pub targets: Vec<TargetSpec>,
    pub collections: Vec<CollectionPlan>,
    #[serde(default)]
    pub duplicate_keys: Vec<DuplicateKeySpec>,
}

impl MigrationPlan {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            plan_version: 1,
            targets: vec![
                target("companies", &["id", "companyId"]),
                target("employees", &["id", "employeeId"]),
                target("vendors", &["id", "vendorId"]),
                target("locations", &["id", "locationId"]),
                target("branches", &["id", "branchId"]),
                target("uniforms", &["id", "productId"]),
            ],
            collections: vec![
                collection(
                    "employees",
                    &[
                        ("companyId", "companies"),
                        ("locationId", "locations"),
                        ("branchId", "branches"),
                    ],
                ),
                collection(
                    "locations",
                    &[("companyId", "companies"), ("adminId", "employees")],
                ),
                collection(
                    "branches",
                    &[("companyId", "companies"), ("adminId", "employees")],
                ),
                collection(
                    "orders",
                    &[
                        ("employeeId", "employees"),
                        ("companyId", "companies"),
                        ("vendorId", "vendors"),
                        ("locationId", "locations"),
                        ("items.uniformId", "uniforms"),
                    ],
                ),
                collection(
                    "purchase_requisitions",
                    &[("companyId", "companies"), ("employeeId", "employees")],
                ),
                collection(
                    "company_admins",
                    &[("companyId", "companies"), ("employeeId", "employees")],
                ),
                collection(
                    "vendor_inventories",
                    &[("vendorId", "vendors"), ("productId", "uniforms")],
                ),
                collection(
                    "product_companies",
                    &[("productId", "uniforms"), ("companyIds", "companies")],
                ),
            ],
            duplicate_keys: vec![
                DuplicateKeySpec {
                    collection: "company_admins".to_string(),
                    fields: references(&[("companyId", "companies"), ("employeeId", "employees")]),
                    created_field: default_created_field(),
                },
                DuplicateKeySpec {
                    collection: "vendor_inventories".to_string(),
                    fields: references(&[("vendorId", "vendors"), ("productId", "uniforms")]),
                    created_field: default_created_field(),
                },
            ],
        }
    }

    /// Validates target declarations and cross references.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when the plan is internally
    /// inconsistent.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.plan_version == 0 {
            return Err(LedgerError::Configuration(
                "plan_version MUST be >= 1".to_string(),
            ));
        }

        let mut declared = BTreeSet::new();
        for spec in &self.targets {
            if spec.collection.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "target collection name MUST be non-empty".to_string(),
                ));
            }
            if !declared.insert(spec.collection.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "target {} declared more than once",
                    spec.collection
                )));
            }
            if spec.code_fields.is_empty() || spec.code_fields.iter().any(|f| f.trim().is_empty())
            {
                return Err(LedgerError::Configuration(format!(
                    "target {} MUST list at least one non-empty code field",
                    spec.collection
                )));
            }
        }

        let mut sources = BTreeSet::new();
        for plan in &self.collections {
            if plan.collection.trim().is_empty() {
                return Err(LedgerError::Configuration(
                    "source collection name MUST be non-empty".to_string(),
                ));
            }
            if !sources.insert(plan.collection.as_str()) {
                return Err(LedgerError::Configuration(format!(
                    "collection {} planned more than once",
                    plan.collection
                )));
            }
            if plan.fields.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "collection {} has no reference fields",
                    plan.collection
                )));
            }
            ensure_targets_declared(&declared, &plan.collection, &plan.fields)?;
        }

        for spec in &self.duplicate_keys {
            if spec.fields.is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "duplicate key for {} has no fields",
                    spec.collection
                )));
            }
            if spec.created_field.trim().is_empty() {
                return Err(LedgerError::Configuration(format!(
                    "duplicate key for {} needs a created_field",
                    spec.collection
                )));
            }
            ensure_targets_declared(&declared, &spec.collection, &spec.fields)?;
        }

        Ok(())
    }

    /// Decodes and validates a plan from JSON.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when JSON decoding fails or
    /// the decoded plan is inconsistent.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let plan: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid migration plan JSON payload: {err}"))
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Source collections to scan, restricted to `only` when non-empty.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when `only` names a collection
    /// the plan does not cover.
    pub fn selected_collections(&self, only: &[String]) -> Result<Vec<&CollectionPlan>, LedgerError> {
        if only.is_empty() {
            return Ok(self.collections.iter().collect());
        }
        for name in only {
            if !self.collections.iter().any(|plan| &plan.collection == name) {
                return Err(LedgerError::Configuration(format!(
                    "collection {name} is not part of the migration plan"
                )));
            }
        }
        Ok(self
            .collections
            .iter()
            .filter(|plan| only.contains(&plan.collection))
            .collect())
    }
}

fn ensure_targets_declared(
    declared: &BTreeSet<&str>,
    collection: &str,
    fields: &[ReferenceField],
) -> Result<(), LedgerError> {
    for field in fields {
        if !declared.contains(field.target.as_str()) {
            return Err(LedgerError::Configuration(format!(
                "{collection}.{} points at undeclared target {}",
                field.path, field.target
            )));
        }
    }
    Ok(())
}

fn target(collection: &str, code_fields: &[&str]) -> TargetSpec {
    TargetSpec {
        collection: collection.to_string(),
        code_fields: code_fields.iter().map(|field| (*field).to_string()).collect(),
        assign_missing: false,
    }
}

fn references(fields: &[(&'static str, &str)]) -> Vec<ReferenceField> {
    fields
        .iter()
        .map(|(path, target)| ReferenceField {
            path: FieldPath::from_static(path),
            target: (*target).to_string(),
        })
        .collect()
}

fn collection(name: &str, fields: &[(&'static str, &str)]) -> CollectionPlan {
    CollectionPlan {
        collection: name.to_string(),
        fields: references(fields),
    }
}
