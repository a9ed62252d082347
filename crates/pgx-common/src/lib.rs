//! PGX Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared vocabulary and ambient infrastructure for the PGX portal's
//! variant ingestion components.
//!
//! # Overview
//!
//! - **Error Handling**: the closed [`IngestError`] type every pipeline stage reports
//! - **Types**: subject descriptors, job statuses and pipeline stages
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use pgx_common::{IngestError, SubjectDescriptor};
//!
//! fn require_subjects(subjects: &[SubjectDescriptor]) -> pgx_common::Result<()> {
//!     if subjects.is_empty() {
//!         return Err(IngestError::validation("at least one subject is required"));
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ErrorKind, IngestError, Result};
pub use types::{JobStatus, Stage, SubjectDescriptor};
