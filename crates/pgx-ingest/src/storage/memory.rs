//! In-process store
//!
//! Understands the subset of the query language the pipeline uses: field
//! equality, `$in`, and `$set` patches. Failures can be injected per
//! operation and collection to exercise error paths.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{IndexSpec, Store, StoreError};

/// Operations a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateCollection,
    DropCollection,
    CreateIndex,
    InsertMany,
    Count,
    UpdateMany,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Value>,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug, Default)]
struct State {
    collections: BTreeMap<String, Collection>,
    failures: HashSet<(StoreOp, String)>,
}

/// [`Store`] kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every `op` against `collection` fail until cleared
    pub fn inject_failure(&self, op: StoreOp, collection: impl Into<String>) {
        self.lock().failures.insert((op, collection.into()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.lock().collections.contains_key(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    pub fn documents(&self, name: &str) -> Vec<Value> {
        self.lock()
            .collections
            .get(name)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    pub fn indexes(&self, name: &str) -> Vec<IndexSpec> {
        self.lock()
            .collections
            .get(name)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    fn check_failure(state: &State, op: StoreOp, name: &str) -> Result<(), StoreError> {
        if state.failures.contains(&(op, name.to_string())) {
            return Err(StoreError::Backend(format!("injected {:?} failure on {}", op, name)));
        }
        Ok(())
    }
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, StoreError> {
    value
        .as_object()
        .ok_or_else(|| StoreError::Encoding(format!("{} must be a JSON object", what)))
}

fn matches(document: &Value, query: &Map<String, Value>) -> Result<bool, StoreError> {
    for (field, condition) in query {
        let actual = document.get(field);
        let hit = match condition.as_object() {
            Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                let mut hit = true;
                for (op, operand) in ops {
                    hit &= match op.as_str() {
                        "$in" => operand
                            .as_array()
                            .ok_or_else(|| StoreError::Encoding("$in expects an array".into()))?
                            .iter()
                            .any(|candidate| actual == Some(candidate)),
                        other => {
                            return Err(StoreError::Encoding(format!(
                                "unsupported query operator {}",
                                other
                            )))
                        },
                    };
                }
                hit
            },
            _ => actual == Some(condition),
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, StoreOp::CreateCollection, name)?;
        if state.collections.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        state.collections.insert(name.to_string(), Collection::default());
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, StoreOp::DropCollection, name)?;
        state.collections.remove(name);
        Ok(())
    }

    async fn create_index(&self, name: &str, spec: &IndexSpec) -> Result<(), StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, StoreOp::CreateIndex, name)?;
        let collection = state.collections.entry(name.to_string()).or_default();
        if !collection.indexes.contains(spec) {
            collection.indexes.push(spec.clone());
        }
        Ok(())
    }

    async fn insert_many(&self, name: &str, documents: Vec<Value>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, StoreOp::InsertMany, name)?;
        if let Some(bad) = documents.iter().find(|d| !d.is_object()) {
            return Err(StoreError::Encoding(format!("not a document: {}", bad)));
        }
        let inserted = documents.len() as u64;
        state
            .collections
            .entry(name.to_string())
            .or_default()
            .documents
            .extend(documents);
        Ok(inserted)
    }

    async fn count(&self, name: &str, query: &Value) -> Result<u64, StoreError> {
        let state = self.lock();
        Self::check_failure(&state, StoreOp::Count, name)?;
        let query = as_object(query, "query")?;
        let Some(collection) = state.collections.get(name) else {
            return Ok(0);
        };
        let mut count = 0;
        for document in &collection.documents {
            if matches(document, query)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn update_many(
        &self,
        name: &str,
        query: &Value,
        patch: &Value,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        Self::check_failure(&state, StoreOp::UpdateMany, name)?;
        let query = as_object(query, "query")?;
        let patch = as_object(patch, "patch")?;

        let mut assignments = Map::new();
        for (op, fields) in patch {
            match op.as_str() {
                "$set" => assignments.extend(as_object(fields, "$set")?.clone()),
                other => {
                    return Err(StoreError::Encoding(format!("unsupported update operator {}", other)))
                },
            }
        }

        let Some(collection) = state.collections.get_mut(name) else {
            return Ok(0);
        };
        let mut matched = 0;
        for document in collection.documents.iter_mut() {
            if !matches(document, query)? {
                continue;
            }
            matched += 1;
            if let Some(fields) = document.as_object_mut() {
                for (field, value) in &assignments {
                    fields.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_collection_twice_fails() {
        let store = MemoryStore::new();
        store.create_collection("p1").await.unwrap();
        let err = store.create_collection("p1").await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(name) if name == "p1"));
    }

    #[tokio::test]
    async fn test_count_with_equality_and_in() {
        let store = MemoryStore::new();
        store
            .insert_many(
                "patients",
                vec![
                    json!({"patient_id": "A", "ready": false}),
                    json!({"patient_id": "B", "ready": false}),
                    json!({"patient_id": "C", "ready": true}),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.count("patients", &json!({})).await.unwrap(), 3);
        assert_eq!(store.count("patients", &json!({"ready": false})).await.unwrap(), 2);
        assert_eq!(
            store
                .count("patients", &json!({"patient_id": {"$in": ["A", "C", "Z"]}}))
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.count("missing", &json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_many_sets_fields() {
        let store = MemoryStore::new();
        store
            .insert_many(
                "patients",
                vec![json!({"patient_id": "A"}), json!({"patient_id": "B"})],
            )
            .await
            .unwrap();

        let matched = store
            .update_many(
                "patients",
                &json!({"patient_id": {"$in": ["A"]}}),
                &json!({"$set": {"ready": true}}),
            )
            .await
            .unwrap();

        assert_eq!(matched, 1);
        let docs = store.documents("patients");
        assert_eq!(docs[0]["ready"], json!(true));
        assert!(docs[1].get("ready").is_none());
    }

    #[tokio::test]
    async fn test_unsupported_operator_is_rejected() {
        let store = MemoryStore::new();
        store.insert_many("c", vec![json!({"n": 1})]).await.unwrap();
        let err = store
            .update_many("c", &json!({}), &json!({"$inc": {"n": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.inject_failure(StoreOp::CreateIndex, "p1");
        assert!(store.create_index("p1", &IndexSpec::positional()).await.is_err());
        assert!(store.create_index("p2", &IndexSpec::positional()).await.is_ok());
        store.clear_failures();
        assert!(store.create_index("p1", &IndexSpec::positional()).await.is_ok());
    }
}
