//! Ingestion job definitions

use chrono::{DateTime, Utc};
use pgx_common::{IngestError, JobStatus, Stage, SubjectDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// Opaque job identifier assigned at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// What a caller submits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Uploaded variant file
    pub input: PathBuf,
    pub subjects: Vec<SubjectDescriptor>,
    /// Submitting user
    pub owner: String,
}

impl JobRequest {
    pub fn new(input: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            subjects: Vec::new(),
            owner: owner.into(),
        }
    }

    pub fn with_subject(mut self, subject: SubjectDescriptor) -> Self {
        self.subjects.push(subject);
        self
    }

    /// Check required fields before anything is queued
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.input.as_os_str().is_empty() {
            return Err(IngestError::validation("input path is required"));
        }
        if self.owner.trim().is_empty() {
            return Err(IngestError::validation("owner is required"));
        }
        if self.subjects.is_empty() {
            return Err(IngestError::validation("at least one subject is required"));
        }

        let mut ids = HashSet::new();
        let mut collections = HashSet::new();
        for subject in &self.subjects {
            if subject.subject_id.trim().is_empty() {
                return Err(IngestError::validation("subject identifier is required"));
            }
            if subject.collection.trim().is_empty() {
                return Err(IngestError::validation("collection name is required")
                    .for_subject(&subject.subject_id));
            }
            if !ids.insert(subject.subject_id.as_str()) {
                return Err(IngestError::validation("duplicate subject identifier")
                    .for_subject(&subject.subject_id));
            }
            if !collections.insert(subject.collection.as_str()) {
                return Err(IngestError::validation(format!(
                    "collection {} is assigned to more than one subject",
                    subject.collection
                ))
                .for_subject(&subject.subject_id));
            }
        }
        Ok(())
    }
}

/// A completed stage and when it completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMark {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// One ingestion request as it moves through the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Renamed during sanitization; later stages use the new path
    pub input_path: PathBuf,
    pub subjects: Vec<SubjectDescriptor>,
    pub owner: String,
    pub status: JobStatus,
    /// Number of stages completed, advanced only on stage success
    pub stage_index: usize,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set once cleanup has run
    pub finished_at: Option<DateTime<Utc>>,
    pub timeline: Vec<StageMark>,
    pub error: Option<IngestError>,
}

impl Job {
    pub fn from_request(request: JobRequest) -> Self {
        Self {
            id: JobId::new(),
            input_path: request.input,
            subjects: request.subjects,
            owner: request.owner,
            status: JobStatus::Queued,
            stage_index: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            timeline: Vec::new(),
            error: None,
        }
    }

    /// Move to `next` if that keeps the status monotonic
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                job_id = %self.id,
                from = %self.status,
                to = %next,
                "Rejected non-monotonic status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Record a successful stage
    pub fn complete_stage(&mut self, stage: Stage) {
        if stage != Stage::Cleanup {
            self.stage_index += 1;
        }
        self.timeline.push(StageMark {
            stage,
            at: Utc::now(),
        });
    }

    /// Stage the job is in (or would run next)
    pub fn current_stage(&self) -> Stage {
        Stage::ORDERED
            .get(self.stage_index)
            .copied()
            .unwrap_or(Stage::Cleanup)
    }

    pub fn completed(&self, stage: Stage) -> bool {
        self.timeline.iter().any(|mark| mark.stage == stage)
    }

    pub fn subject_ids(&self) -> Vec<String> {
        self.subjects.iter().map(|s| s.subject_id.clone()).collect()
    }
}

/// A not-yet-committed subject, for merging into read results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSubject {
    pub subject: SubjectDescriptor,
    pub owner: String,
    pub job_id: JobId,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
}
