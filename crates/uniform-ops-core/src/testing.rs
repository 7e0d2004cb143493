//! In-memory [`RecordStore`] for unit tests.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::{Document, LedgerError, RecordStore};

#[derive(Debug, Default, Clone)]
pub(crate) struct VecStore {
    collections: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    failing_updates: BTreeSet<String>,
    pub(crate) writes: usize,
}

impl VecStore {
    pub(crate) fn insert(&mut self, collection: &str, id: &str, body: Value) {
        let Value::Object(map) = body else {
            panic!("fixture {collection}/{id} must be an object");
        };
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), map);
    }

    pub(crate) fn body(&self, collection: &str, id: &str) -> Option<Value> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|body| Value::Object(body.clone()))
    }

    pub(crate) fn count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, BTreeMap::len)
    }

    pub(crate) fn fail_updates_for(&mut self, id: &str) {
        self.failing_updates.insert(id.to_string());
    }
}

impl RecordStore for VecStore {
    fn list_documents(&self, collection: &str) -> Result<Vec<Document>, LedgerError> {
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, body)| Document::new(id.clone(), body.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn update_fields(
        &mut self,
        collection: &str,
        doc_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, LedgerError> {
        if self.failing_updates.contains(doc_id) {
            return Err(LedgerError::Store(format!("write rejected for {doc_id}")));
        }
        let Some(body) = self
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(doc_id))
        else {
            return Ok(false);
        };
        for (key, value) in fields {
            body.insert(key.clone(), value.clone());
        }
        self.writes += 1;
        Ok(true)
    }

    fn delete_documents(
        &mut self,
        collection: &str,
        doc_ids: &[String],
    ) -> Result<usize, LedgerError> {
        let Some(docs) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        Ok(doc_ids.iter().filter(|id| docs.remove(*id).is_some()).count())
    }
}
