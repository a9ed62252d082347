//! Common types used across PGX ingestion

use serde::{Deserialize, Serialize};

/// A subject (e.g. a patient) whose variants land in a dedicated collection.
///
/// Serialized with the field names the external parser expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDescriptor {
    /// Unique subject identifier
    #[serde(rename = "patient_id")]
    pub subject_id: String,

    /// Target collection, created fresh by the pipeline
    #[serde(rename = "collection_id")]
    pub collection: String,

    /// Records plus ignored lines this subject should account for, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_records: Option<u64>,
}

impl SubjectDescriptor {
    pub fn new(subject_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            collection: collection.into(),
            expected_records: None,
        }
    }

    pub fn with_expected_records(mut self, expected: u64) -> Self {
        self.expected_records = Some(expected);
        self
    }
}

/// Job status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadConfiguration,
    StatInput,
    SanitizeFilename,
    StatAnnotator,
    CreateCollections,
    InvokeAnnotator,
    VerifyAnnotatorOutput,
    InvokeParser,
    VerifyRecordCounts,
    CreateIndexes,
    MarkSubjectsReady,
    Cleanup,
}

impl Stage {
    /// Every stage that can advance a job's stage index, in order
    pub const ORDERED: [Stage; 11] = [
        Stage::LoadConfiguration,
        Stage::StatInput,
        Stage::SanitizeFilename,
        Stage::StatAnnotator,
        Stage::CreateCollections,
        Stage::InvokeAnnotator,
        Stage::VerifyAnnotatorOutput,
        Stage::InvokeParser,
        Stage::VerifyRecordCounts,
        Stage::CreateIndexes,
        Stage::MarkSubjectsReady,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Stage::LoadConfiguration => "load_configuration",
            Stage::StatInput => "stat_input",
            Stage::SanitizeFilename => "sanitize_filename",
            Stage::StatAnnotator => "stat_annotator",
            Stage::CreateCollections => "create_collections",
            Stage::InvokeAnnotator => "invoke_annotator",
            Stage::VerifyAnnotatorOutput => "verify_annotator_output",
            Stage::InvokeParser => "invoke_parser",
            Stage::VerifyRecordCounts => "verify_record_counts",
            Stage::CreateIndexes => "create_indexes",
            Stage::MarkSubjectsReady => "mark_subjects_ready",
            Stage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_serializes_with_parser_field_names() {
        let subject = SubjectDescriptor::new("A", "p1");
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json, serde_json::json!({"patient_id": "A", "collection_id": "p1"}));
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_stages_are_ordered() {
        let mut sorted = Stage::ORDERED.to_vec();
        sorted.sort();
        assert_eq!(sorted, Stage::ORDERED.to_vec());
        assert!(Stage::MarkSubjectsReady < Stage::Cleanup);
    }
}
