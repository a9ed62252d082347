//! PGX Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads uploaded variant files into per-subject collections.
//!
//! # Components
//!
//! - **Queue**: runs ingestion jobs one at a time, in submission order, and
//!   exposes work that is not yet in storage
//! - **Pipeline**: annotates, parses, reconciles and indexes one job, always
//!   cleaning up temporary files
//! - **Tools**: subprocess wrapper for the annotator, parser and `wc`
//! - **Consistency**: line-count reconciliation
//! - **Storage**: MongoDB and in-memory backends
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pgx_common::SubjectDescriptor;
//! use pgx_ingest::{
//!     IngestConfig, IngestQueue, JobRequest, MongoStore, Pipeline, PipelineConfig, ProcessRunner,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::load()?;
//!     let store = Arc::new(
//!         MongoStore::connect(
//!             &config.storage.uri,
//!             &config.storage.database,
//!             config.storage.admin_collection.clone(),
//!         )
//!         .await?,
//!     );
//!     let pipeline = Pipeline::new(
//!         store.clone(),
//!         store,
//!         Arc::new(ProcessRunner::new()),
//!         PipelineConfig::from(&config),
//!     );
//!     let queue = IngestQueue::new(Arc::new(pipeline), config.queue.history_limit);
//!
//!     let id = queue.enqueue(
//!         JobRequest::new("/uploads/sample.vcf", "alice")
//!             .with_subject(SubjectDescriptor::new("A", "alice_A")),
//!     )?;
//!     let job = queue.wait_for(id).await;
//!     println!("{:?}", job.map(|j| j.status));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consistency;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod settings;
pub mod storage;
pub mod tool;

pub use config::IngestConfig;
pub use job::{Job, JobId, JobRequest, PendingSubject, StageMark};
pub use pipeline::{JobRunner, Pipeline, PipelineConfig, ProgressSink};
pub use queue::IngestQueue;
pub use settings::{AnnotatorSettings, SettingsSource, StaticSettings};
pub use storage::{MemoryStore, MongoStore, Store, StoreError};
pub use tool::{ProcessRunner, ToolRunner};
