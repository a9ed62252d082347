//! Pipeline orchestrator
//!
//! Drives one job through the ingestion stages in order:
//!
//! 1. load configuration
//! 2. stat input
//! 3. sanitize filename
//! 4. stat annotator
//! 5. create collections
//! 6. invoke annotator
//! 7. verify annotator output
//! 8. invoke parser
//! 9. verify record counts
//! 10. create indexes
//! 11. mark subjects ready
//!
//! The first failing stage aborts the rest. Whatever the outcome, the
//! temporary files next to the input are removed before the job reaches a
//! terminal status, and cleanup problems never change that status.

mod stages;

use async_trait::async_trait;
use chrono::Utc;
use pgx_common::{IngestError, JobStatus, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::IngestConfig;
use crate::job::Job;
use crate::settings::SettingsSource;
use crate::storage::Store;
use crate::tool::ToolRunner;

pub use stages::sanitize_file_name;

/// Receives a copy of the job every time the pipeline moves it forward
pub trait ProgressSink: Send + Sync {
    fn update(&self, job: &Job);
}

/// Sink that drops every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _job: &Job) {}
}

/// Something that can take a running job to a terminal status
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` to completion. The returned job is terminal and its
    /// cleanup has already happened.
    async fn run(&self, job: Job, progress: Arc<dyn ProgressSink>) -> Job;

    /// Best-effort cleanup for a job whose run died without finishing.
    ///
    /// `job` is the last state reported through the progress sink.
    async fn recover(&self, job: &mut Job);
}

/// Knobs the pipeline needs from the process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub parser_program: PathBuf,
    pub line_count_program: PathBuf,
    pub annotator_timeout: Duration,
    pub parser_timeout: Duration,
    pub line_count_timeout: Duration,
    pub subject_registry: String,
    pub drop_collections_on_failure: bool,
}

impl From<&IngestConfig> for PipelineConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            parser_program: PathBuf::from(&config.tools.parser_program),
            line_count_program: PathBuf::from(&config.tools.line_count_program),
            annotator_timeout: config.tools.annotator_timeout(),
            parser_timeout: config.tools.parser_timeout(),
            line_count_timeout: config.tools.line_count_timeout(),
            subject_registry: config.storage.subject_registry.clone(),
            drop_collections_on_failure: config.queue.drop_collections_on_failure,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

/// The ingestion pipeline and its collaborators
#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<dyn SettingsSource>,
    store: Arc<dyn Store>,
    tools: Arc<dyn ToolRunner>,
    config: PipelineConfig,
}

/// Per-run bookkeeping that outlives a failing stage
#[derive(Debug, Default)]
struct RunState {
    /// Collections this run created, in creation order
    created_collections: Vec<String>,
}

impl Pipeline {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn Store>,
        tools: Arc<dyn ToolRunner>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            settings,
            store,
            tools,
            config,
        }
    }

    fn advance(job: &mut Job, stage: Stage, progress: &dyn ProgressSink) {
        job.complete_stage(stage);
        info!(stage = %stage, "Stage complete");
        progress.update(job);
    }

    async fn execute(
        &self,
        job: &mut Job,
        state: &mut RunState,
        progress: &dyn ProgressSink,
    ) -> Result<(), IngestError> {
        let settings = self.settings.load().await?;
        Self::advance(job, Stage::LoadConfiguration, progress);

        stages::stat_input(&job.input_path).await?;
        Self::advance(job, Stage::StatInput, progress);

        job.input_path = stages::sanitize_input(&job.input_path).await?;
        Self::advance(job, Stage::SanitizeFilename, progress);

        stages::stat_annotator(&settings).await?;
        Self::advance(job, Stage::StatAnnotator, progress);

        self.create_collections(job, state).await?;
        Self::advance(job, Stage::CreateCollections, progress);

        self.invoke_annotator(&job.input_path, &settings).await?;
        Self::advance(job, Stage::InvokeAnnotator, progress);

        let output = stages::verify_annotator_output(&job.input_path, &settings).await?;
        Self::advance(job, Stage::VerifyAnnotatorOutput, progress);

        let ignored = self.invoke_parser(&output, &job.subjects).await?;
        Self::advance(job, Stage::InvokeParser, progress);

        self.verify_record_counts(&output, &job.subjects, &ignored).await?;
        Self::advance(job, Stage::VerifyRecordCounts, progress);

        self.create_indexes(&job.subjects, &settings).await;
        Self::advance(job, Stage::CreateIndexes, progress);

        self.mark_subjects_ready(&job.subjects).await?;
        Self::advance(job, Stage::MarkSubjectsReady, progress);

        Ok(())
    }

    /// Drop the collections a failed run created
    async fn rollback(&self, state: &RunState) {
        for collection in state.created_collections.iter().rev() {
            match self.store.drop_collection(collection).await {
                Ok(()) => info!(collection = %collection, "Dropped collection of failed job"),
                Err(e) => warn!(collection = %collection, error = %e, "Failed to drop collection"),
            }
        }
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    async fn run(&self, mut job: Job, progress: Arc<dyn ProgressSink>) -> Job {
        let span = info_span!(
            "ingest",
            job_id = %job.id,
            input = %job.input_path.display()
        );

        async move {
            info!(
                "Starting ingestion for {} subject(s) owned by {}",
                job.subjects.len(),
                job.owner
            );

            let mut state = RunState::default();
            let outcome = self.execute(&mut job, &mut state, progress.as_ref()).await;

            if let Err(err) = &outcome {
                error!(
                    kind = %err.kind(),
                    subject = err.subject.as_deref().unwrap_or("-"),
                    stage = %job.current_stage(),
                    "Ingestion failed: {}",
                    err.message
                );
                if self.config.drop_collections_on_failure {
                    self.rollback(&state).await;
                }
            }

            stages::cleanup(&job.input_path).await;
            job.complete_stage(Stage::Cleanup);

            match outcome {
                Ok(()) => {
                    job.transition(JobStatus::Succeeded);
                    info!("Ingestion succeeded");
                },
                Err(err) => {
                    job.error = Some(err);
                    job.transition(JobStatus::Failed);
                },
            }
            job.finished_at = Some(Utc::now());
            progress.update(&job);
            job
        }
        .instrument(span)
        .await
    }

    async fn recover(&self, job: &mut Job) {
        let span = info_span!(
            "recover",
            job_id = %job.id,
            input = %job.input_path.display()
        );

        async {
            warn!(stage = %job.current_stage(), "Recovering after an aborted run");
            if self.config.drop_collections_on_failure && job.completed(Stage::CreateCollections) {
                let state = RunState {
                    created_collections: job.subjects.iter().map(|s| s.collection.clone()).collect(),
                };
                self.rollback(&state).await;
            }
            stages::cleanup(&job.input_path).await;
            job.complete_stage(Stage::Cleanup);
        }
        .instrument(span)
        .await
    }
}
