//! Error types for variant ingestion
//!
//! Every failure a job can end with is classified into one [`ErrorKind`].
//! Callers of the queue only ever see these kinds, never raw subprocess or
//! driver errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Classification of an ingestion failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad enqueue input
    Validation,
    /// Missing tool or configuration
    Configuration,
    /// Missing or unusable input file
    Input,
    /// Collection create/count/index/update failure
    Storage,
    /// Annotation tool launch, exit or output failure
    Annotation,
    /// Parser launch, exit, stderr output or artifact failure
    Parse,
    /// Record count mismatch
    Consistency,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Input => "InputError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Annotation => "AnnotationError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Consistency => "ConsistencyError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified ingestion failure.
///
/// Carries the kind, a human readable message and, for subject-level
/// failures, the identifier of the subject that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}{}", subject_suffix(.subject))]
pub struct IngestError {
    pub kind: ErrorKind,
    pub message: String,
    pub subject: Option<String>,
}

fn subject_suffix(subject: &Option<String>) -> String {
    match subject {
        Some(id) => format!(" (subject {})", id),
        None => String::new(),
    }
}

impl IngestError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            subject: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn annotation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Annotation, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consistency, message)
    }

    /// Attach the originating subject identifier
    pub fn for_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject = Some(subject_id.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}
