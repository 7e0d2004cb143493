use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::reference::{classify_reference, LegacyRef, ReferenceKind};
use crate::Document;

/// Records sharing one natural key. `keep` survives, `delete` are removed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DuplicateGroup {
    pub key: String,
    pub keep: String,
    pub delete: Vec<String>,
}

/// Best-known creation time of a document.
///
/// Reads `created_field` as an RFC 3339 string or an extended-JSON
/// `{"$date": ..}` value, then falls back to the timestamp embedded in the
/// document's own legacy reference.
#[must_use]
pub fn creation_time(doc: &Document, created_field: &str) -> Option<OffsetDateTime> {
    doc.body
        .get(created_field)
        .and_then(timestamp_value)
        .or_else(|| match doc.body.get("_id").map(classify_reference) {
            Some(ReferenceKind::Legacy(reference)) => reference.embedded_timestamp(),
            _ => None,
        })
        .or_else(|| LegacyRef::parse(&doc.id).and_then(|reference| reference.embedded_timestamp()))
}

fn timestamp_value(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(raw) => OffsetDateTime::parse(raw, &Rfc3339).ok(),
        Value::Number(millis) => from_millis(millis.as_i64()?),
        Value::Object(map) => match map.get("$date")? {
            Value::Object(inner) => {
                let raw = inner.get("$numberLong")?.as_str()?;
                from_millis(raw.parse().ok()?)
            }
            other => timestamp_value(other),
        },
        _ => None,
    }
}

fn from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

/// Groups `records` by `natural_key` and keeps the oldest of each group.
///
/// Records without a key are never grouped. Ordering inside a group is by
/// creation time, undated records last, then by document id.
pub fn detect_duplicates<F>(
    records: &[Document],
    natural_key: F,
    created_field: &str,
) -> Vec<DuplicateGroup>
where
    F: Fn(&Document) -> Option<String>,
{
    let mut by_key: BTreeMap<String, Vec<(Option<OffsetDateTime>, &str)>> = BTreeMap::new();
    for record in records {
        if let Some(key) = natural_key(record) {
            by_key
                .entry(key)
                .or_default()
                .push((creation_time(record, created_field), record.id.as_str()));
        }
    }

    by_key
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(key, mut members)| {
            members.sort_by(|left, right| oldest_first(*left, *right));
            let (keep, rest) = members.split_first()?;
            Some(DuplicateGroup {
                key,
                keep: keep.1.to_string(),
                delete: rest.iter().map(|(_, id)| (*id).to_string()).collect(),
            })
        })
        .collect()
}

fn oldest_first(
    left: (Option<OffsetDateTime>, &str),
    right: (Option<OffsetDateTime>, &str),
) -> Ordering {
    let by_time = match (left.0, right.0) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| left.1.cmp(right.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn doc(id: &str, value: Value) -> Document {
        match value {
            Value::Object(map) => Document::new(id, map),
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn admin_key(record: &Document) -> Option<String> {
        let company = record.body.get("companyId")?.as_str()?;
        let employee = record.body.get("employeeId")?.as_str()?;
        Some(format!("{company}|{employee}"))
    }

    #[test]
    fn two_newest_of_three_are_marked_for_deletion() {
        let records = vec![
            doc("b", json!({"companyId": "100004", "employeeId": "300001", "createdAt": "2024-02-01T00:00:00Z"})),
            doc("a", json!({"companyId": "100004", "employeeId": "300001", "createdAt": "2024-03-01T00:00:00Z"})),
            doc("c", json!({"companyId": "100004", "employeeId": "300001", "createdAt": "2024-01-01T00:00:00Z"})),
            doc("d", json!({"companyId": "100004", "employeeId": "300002", "createdAt": "2024-01-01T00:00:00Z"})),
        ];
        let groups = detect_duplicates(&records, admin_key, "createdAt");
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                key: "100004|300001".to_string(),
                keep: "c".to_string(),
                delete: vec!["b".to_string(), "a".to_string()],
            }]
        );
    }

    #[test]
    fn embedded_reference_time_breaks_missing_created_at() {
        // 0x5000_0000 predates 0x6000_0000.
        let records = vec![
            doc("600000000000000000000000", json!({"companyId": "100004", "employeeId": "300001"})),
            doc("500000000000000000000000", json!({"companyId": "100004", "employeeId": "300001"})),
        ];
        let groups = detect_duplicates(&records, admin_key, "createdAt");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].keep, "500000000000000000000000");
    }

    #[test]
    fn undated_records_sort_last_then_by_id() {
        let records = vec![
            doc("zz", json!({"companyId": "100004", "employeeId": "300001"})),
            doc("yy", json!({"companyId": "100004", "employeeId": "300001"})),
            doc("xx", json!({"companyId": "100004", "employeeId": "300001", "createdAt": {"$date": "2030-01-01T00:00:00Z"}})),
        ];
        let groups = detect_duplicates(&records, admin_key, "createdAt");
        assert_eq!(groups[0].keep, "xx");
        assert_eq!(groups[0].delete, vec!["yy".to_string(), "zz".to_string()]);
    }

    #[test]
    fn records_without_key_are_ignored() {
        let records = vec![
            doc("a", json!({"companyId": "100004"})),
            doc("b", json!({"companyId": "100004"})),
        ];
        assert!(detect_duplicates(&records, admin_key, "createdAt").is_empty());
    }

    #[test]
    fn creation_time_reads_extended_json_forms() {
        let millis = doc("a", json!({"createdAt": {"$date": {"$numberLong": "1700000000000"}}}));
        let created = creation_time(&millis, "createdAt").map(OffsetDateTime::unix_timestamp);
        assert_eq!(created, Some(1_700_000_000));

        let offset = doc("b", json!({"createdAt": "2024-03-01T08:30:00+05:30"}));
        assert!(creation_time(&offset, "createdAt").is_some());

        let native = doc("c", json!({"_id": {"$oid": "507f1f77bcf86cd799439011"}}));
        let created = creation_time(&native, "createdAt").map(OffsetDateTime::unix_timestamp);
        assert_eq!(created, Some(0x507f_1f77));

        assert_eq!(creation_time(&Document::new("plain", Map::new()), "createdAt"), None);
    }
}
