//! MongoDB store
//!
//! Production backend. Subject collections, the subject registry and the
//! admin settings document all live in one database.

use async_trait::async_trait;
use mongodb::bson::{self, Document};
use mongodb::error::ErrorKind as MongoErrorKind;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use pgx_common::IngestError;
use serde_json::Value;
use tracing::{debug, info};

use super::{IndexSpec, Store, StoreError};
use crate::settings::{AnnotatorSettings, SettingsSource};

/// Server error code for "collection already exists"
const NAMESPACE_EXISTS: i32 = 48;

/// Server error code for "namespace not found"
const NAMESPACE_NOT_FOUND: i32 = 26;

/// [`Store`] backed by a MongoDB database
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
    admin_collection: String,
}

impl MongoStore {
    /// Connect and select `database`
    pub async fn connect(
        uri: &str,
        database: &str,
        admin_collection: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await.map_err(backend)?;
        info!(database = %database, "Connected to MongoDB");
        Ok(Self::new(client.database(database), admin_collection))
    }

    pub fn new(db: Database, admin_collection: impl Into<String>) -> Self {
        Self {
            db,
            admin_collection: admin_collection.into(),
        }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

fn backend(err: mongodb::error::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn command_code(err: &mongodb::error::Error) -> Option<i32> {
    match *err.kind {
        MongoErrorKind::Command(ref command) => Some(command.code),
        _ => None,
    }
}

fn to_document(value: &Value) -> Result<Document, StoreError> {
    bson::to_document(value).map_err(|e| StoreError::Encoding(e.to_string()))
}

fn index_model(spec: &IndexSpec) -> IndexModel {
    let mut keys = Document::new();
    for (field, direction) in &spec.keys {
        keys.insert(field.clone(), *direction);
    }
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().name(spec.name()).unique(spec.unique).build())
        .build()
}

#[async_trait]
impl Store for MongoStore {
    async fn create_collection(&self, name: &str) -> Result<(), StoreError> {
        match self.db.create_collection(name).await {
            Ok(()) => Ok(()),
            Err(e) if command_code(&e) == Some(NAMESPACE_EXISTS) => {
                Err(StoreError::AlreadyExists(name.to_string()))
            },
            Err(e) => Err(backend(e)),
        }
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        match self.collection(name).drop().await {
            Ok(()) => Ok(()),
            Err(e) if command_code(&e) == Some(NAMESPACE_NOT_FOUND) => {
                Err(StoreError::NotFound(name.to_string()))
            },
            Err(e) => Err(backend(e)),
        }
    }

    async fn create_index(&self, name: &str, spec: &IndexSpec) -> Result<(), StoreError> {
        self.collection(name)
            .create_index(index_model(spec))
            .await
            .map_err(backend)?;
        debug!(collection = %name, index = %spec.name(), "Index created");
        Ok(())
    }

    async fn insert_many(&self, name: &str, documents: Vec<Value>) -> Result<u64, StoreError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let documents = documents
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>, _>>()?;
        let result = self
            .collection(name)
            .insert_many(documents)
            .await
            .map_err(backend)?;
        Ok(result.inserted_ids.len() as u64)
    }

    async fn count(&self, name: &str, query: &Value) -> Result<u64, StoreError> {
        self.collection(name)
            .count_documents(to_document(query)?)
            .await
            .map_err(backend)
    }

    async fn update_many(
        &self,
        name: &str,
        query: &Value,
        patch: &Value,
    ) -> Result<u64, StoreError> {
        let result = self
            .collection(name)
            .update_many(to_document(query)?, to_document(patch)?)
            .await
            .map_err(backend)?;
        Ok(result.matched_count)
    }
}

/// Settings come from the single document of the admin collection
#[async_trait]
impl SettingsSource for MongoStore {
    async fn load(&self) -> Result<AnnotatorSettings, IngestError> {
        let document = self
            .collection(&self.admin_collection)
            .find_one(Document::new())
            .await
            .map_err(|e| IngestError::configuration(format!("failed to read settings: {}", e)))?
            .ok_or_else(|| {
                IngestError::configuration(format!(
                    "no settings document in collection {}",
                    self.admin_collection
                ))
            })?;

        let settings: AnnotatorSettings = bson::from_document(document)
            .map_err(|e| IngestError::configuration(format!("malformed settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }
}
