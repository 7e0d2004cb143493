//! Dotted field paths such as `items.uniformId`.
//!
//! Arrays are fanned out wherever they appear: an array in the middle of a
//! path is treated as a list of sub-documents, an array at the end as a list
//! of scalar values.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::LedgerError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted path.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for an empty path or an empty
    /// segment.
    pub fn parse(raw: &str) -> Result<Self, LedgerError> {
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(LedgerError::Configuration(format!(
                "field path has an empty segment: {raw:?}"
            )));
        }
        Ok(Self { segments })
    }

    /// For compiled-in paths; callers keep these literals non-empty.
    pub(crate) fn from_static(raw: &'static str) -> Self {
        Self {
            segments: raw.split('.').map(str::to_string).collect(),
        }
    }

    /// Top-level field that has to be rewritten when anything under this
    /// path changes.
    #[must_use]
    pub fn root(&self) -> &str {
        // parse() guarantees at least one segment.
        self.segments.first().map_or("", String::as_str)
    }

    /// Plain object descent without array fan-out.
    #[must_use]
    pub fn get<'a>(&self, doc: &'a Map<String, Value>) -> Option<&'a Value> {
        let (head, rest) = self.segments.split_first()?;
        let mut current = doc.get(head)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at this path, creating intermediate objects.
    ///
    /// # Errors
    /// Returns [`LedgerError::Shape`] when an intermediate segment holds a
    /// non-object value.
    pub fn set(&self, doc: &mut Map<String, Value>, value: Value) -> Result<(), LedgerError> {
        let Some((last, parents)) = self.segments.split_last() else {
            return Ok(());
        };
        let mut current = doc;
        for segment in parents {
            let slot = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(map) => map,
                other => {
                    return Err(LedgerError::Shape(format!(
                        "{self}: expected object at {segment}, found {}",
                        value_kind(other)
                    )))
                }
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }

    /// Every value reached by this path. Absent and null branches yield
    /// nothing.
    ///
    /// # Errors
    /// Returns [`LedgerError::Shape`] when a scalar sits where the path
    /// needs to descend further.
    pub fn leaves<'a>(&self, doc: &'a Map<String, Value>) -> Result<Vec<&'a Value>, LedgerError> {
        let mut out = Vec::new();
        if let Some((head, rest)) = self.segments.split_first() {
            if let Some(child) = doc.get(head) {
                self.collect(child, rest, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Mutable counterpart of [`FieldPath::leaves`].
    ///
    /// # Errors
    /// Returns [`LedgerError::Shape`] when a scalar sits where the path
    /// needs to descend further.
    pub fn leaves_mut<'a>(
        &self,
        doc: &'a mut Map<String, Value>,
    ) -> Result<Vec<&'a mut Value>, LedgerError> {
        let mut out = Vec::new();
        if let Some((head, rest)) = self.segments.split_first() {
            if let Some(child) = doc.get_mut(head) {
                self.collect_mut(child, rest, &mut out)?;
            }
        }
        Ok(out)
    }

    fn collect<'a>(
        &self,
        node: &'a Value,
        remaining: &[String],
        out: &mut Vec<&'a Value>,
    ) -> Result<(), LedgerError> {
        let Some((head, rest)) = remaining.split_first() else {
            match node {
                Value::Array(items) => out.extend(items.iter().filter(|item| !item.is_null())),
                Value::Null => {}
                leaf => out.push(leaf),
            }
            return Ok(());
        };

        match node {
            Value::Object(map) => match map.get(head) {
                Some(child) => self.collect(child, rest, out),
                None => Ok(()),
            },
            Value::Array(items) => {
                for item in items {
                    self.collect(item, remaining, out)?;
                }
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(self.shape_error(head, other)),
        }
    }

    fn collect_mut<'a>(
        &self,
        node: &'a mut Value,
        remaining: &[String],
        out: &mut Vec<&'a mut Value>,
    ) -> Result<(), LedgerError> {
        let Some((head, rest)) = remaining.split_first() else {
            match node {
                Value::Array(items) => {
                    out.extend(items.iter_mut().filter(|item| !item.is_null()));
                }
                Value::Null => {}
                leaf => out.push(leaf),
            }
            return Ok(());
        };

        if !matches!(node, Value::Object(_) | Value::Array(_) | Value::Null) {
            return Err(self.shape_error(head, node));
        }

        match node {
            Value::Object(map) => match map.get_mut(head) {
                Some(child) => self.collect_mut(child, rest, out),
                None => Ok(()),
            },
            Value::Array(items) => {
                for item in items {
                    self.collect_mut(item, remaining, out)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn shape_error(&self, segment: &str, found: &Value) -> LedgerError {
        LedgerError::Shape(format!(
            "{self}: cannot descend into {segment}, found {}",
            value_kind(found)
        ))
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(value: FieldPath) -> Self {
        value.to_string()
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
