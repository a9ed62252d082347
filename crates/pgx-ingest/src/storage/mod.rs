//! Storage collaborator
//!
//! The pipeline needs a small set of collection-scoped operations keyed by
//! collection name. Queries and patches use the MongoDB document vocabulary
//! expressed as JSON (`{"field": {"$in": [...]}}`, `{"$set": {...}}`).
//!
//! - [`MongoStore`]: production backend
//! - [`MemoryStore`]: in-process backend for tests and dry runs

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Field holding the subject identifier in the subject registry
pub const SUBJECT_ID_FIELD: &str = "patient_id";

/// Flag set once a subject's variants are fully loaded
pub const READY_FIELD: &str = "ready";

/// Completion timestamp written alongside the ready flag
pub const COMPLETED_FIELD: &str = "completed";

/// Storage failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("collection already exists: {0}")]
    AlreadyExists(String),

    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("invalid document: {0}")]
    Encoding(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Index definition: ordered key list plus options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// (field, direction) pairs; 1 ascending, -1 descending
    pub keys: Vec<(String, i32)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn ascending<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: fields.into_iter().map(|f| (f.into(), 1)).collect(),
            unique: false,
        }
    }

    /// Compound positional index every variant collection gets
    pub fn positional() -> Self {
        Self::ascending(["chr", "start", "end"])
    }

    /// Index name following the `field_dir` convention
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_")
    }
}

/// Collection-scoped storage operations
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a collection, failing with [`StoreError::AlreadyExists`] on a name clash
    async fn create_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn create_index(&self, name: &str, spec: &IndexSpec) -> Result<(), StoreError>;

    /// Insert documents; returns how many were written.
    ///
    /// The pipeline never inserts records itself (the parser does). This
    /// exists for parser stand-ins in tests and dry runs, and for seeding.
    async fn insert_many(&self, name: &str, documents: Vec<Value>) -> Result<u64, StoreError>;

    async fn count(&self, name: &str, query: &Value) -> Result<u64, StoreError>;

    /// Apply `patch` to every document matching `query`; returns the match count
    async fn update_many(&self, name: &str, query: &Value, patch: &Value)
        -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_index() {
        let spec = IndexSpec::positional();
        assert_eq!(
            spec.keys,
            vec![("chr".to_string(), 1), ("start".to_string(), 1), ("end".to_string(), 1)]
        );
        assert_eq!(spec.name(), "chr_1_start_1_end_1");
        assert!(!spec.unique);
    }
}
