use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::LedgerError;

pub const CANONICAL_CODE_WIDTH: usize = 6;
pub const LEGACY_REF_HEX_LEN: usize = 24;

/// A legacy internal object reference, normalized to lowercase hex.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct LegacyRef(String);

impl LegacyRef {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == LEGACY_REF_HEX_LEN && raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creation time carried in the first four bytes of the reference.
    #[must_use]
    pub fn embedded_timestamp(&self) -> Option<OffsetDateTime> {
        let bytes = hex::decode(&self.0).ok()?;
        let head: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        OffsetDateTime::from_unix_timestamp(i64::from(u32::from_be_bytes(head))).ok()
    }
}

impl Display for LegacyRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for LegacyRef {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| {
            LedgerError::Validation(format!("not a 24-character hex reference: {value}"))
        })
    }
}

impl From<LegacyRef> for String {
    fn from(value: LegacyRef) -> Self {
        value.0
    }
}

/// The three shapes an identifier-reference field can take.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReferenceKind<'a> {
    Canonical(&'a str),
    Legacy(LegacyRef),
    NotAReference,
}

#[must_use]
pub fn is_canonical_code(raw: &str) -> bool {
    raw.len() == CANONICAL_CODE_WIDTH && raw.bytes().all(|byte| byte.is_ascii_digit())
}

/// Classifies one scalar field value.
///
/// Legacy references arrive as bare 24-hex strings, as extended-JSON
/// `{"$oid": ..}` values, or as embedded sub-documents whose `_id` is
/// one of those two.
#[must_use]
pub fn classify_reference(value: &Value) -> ReferenceKind<'_> {
    match value {
        Value::String(raw) if is_canonical_code(raw) => ReferenceKind::Canonical(raw.as_str()),
        Value::Object(map) => match map.get("_id").and_then(native_ref) {
            Some(legacy) => ReferenceKind::Legacy(legacy),
            None => native_ref(value).map_or(ReferenceKind::NotAReference, ReferenceKind::Legacy),
        },
        other => native_ref(other).map_or(ReferenceKind::NotAReference, ReferenceKind::Legacy),
    }
}

fn native_ref(value: &Value) -> Option<LegacyRef> {
    match value {
        Value::String(raw) => LegacyRef::parse(raw),
        Value::Object(map) => map.get("$oid").and_then(Value::as_str).and_then(LegacyRef::parse),
        _ => None,
    }
}
