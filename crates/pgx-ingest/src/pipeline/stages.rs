//! Individual pipeline stages

use chrono::Utc;
use pgx_common::{IngestError, SubjectDescriptor};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Pipeline, RunState};
use crate::consistency::{self, SubjectTally, Verdict};
use crate::job::Job;
use crate::settings::AnnotatorSettings;
use crate::storage::{IndexSpec, StoreError, COMPLETED_FIELD, READY_FIELD, SUBJECT_ID_FIELD};
use crate::tool::{Invocation, OutputLine, ToolOutput};

/// Format of the completion timestamp in the subject registry
const COMPLETED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Remove characters that break argument passing from a file name.
///
/// Parentheses are dropped and every whitespace character becomes `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '(' && *c != ')')
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

pub(super) async fn stat_input(input: &Path) -> Result<(), IngestError> {
    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(IngestError::input(format!("{} is not a regular file", input.display()))),
        Err(e) => Err(IngestError::input(format!(
            "input file {} is not accessible: {}",
            input.display(),
            e
        ))),
    }
}

/// Rename the input to its sanitized name; returns the path to use from now on
pub(super) async fn sanitize_input(input: &Path) -> Result<PathBuf, IngestError> {
    let Some(name) = input.file_name().and_then(|n| n.to_str()) else {
        return Err(IngestError::input(format!(
            "input path {} has no usable file name",
            input.display()
        )));
    };

    let sanitized = sanitize_file_name(name);
    if sanitized == name {
        return Ok(input.to_path_buf());
    }

    let target = input.with_file_name(&sanitized);
    if tokio::fs::symlink_metadata(&target).await.is_ok() {
        return Err(IngestError::input(format!(
            "cannot rename {} to {}: a file with that name already exists",
            input.display(),
            target.display()
        )));
    }
    tokio::fs::rename(input, &target).await.map_err(|e| {
        IngestError::input(format!(
            "failed to rename {} to {}: {}",
            input.display(),
            target.display(),
            e
        ))
    })?;
    info!("Renamed input to {}", target.display());
    Ok(target)
}

pub(super) async fn stat_annotator(settings: &AnnotatorSettings) -> Result<(), IngestError> {
    tokio::fs::metadata(&settings.annotator_path)
        .await
        .map(|_| ())
        .map_err(|e| {
            IngestError::configuration(format!(
                "annotator not found at {}: {}",
                settings.annotator_path.display(),
                e
            ))
        })
}

pub(super) async fn verify_annotator_output(
    input: &Path,
    settings: &AnnotatorSettings,
) -> Result<PathBuf, IngestError> {
    let output = settings.output_path(input);
    match tokio::fs::metadata(&output).await {
        Ok(_) => Ok(output),
        Err(e) => Err(IngestError::annotation(format!(
            "annotator finished but produced no output at {}: {}",
            output.display(),
            e
        ))),
    }
}

/// Remove every file next to `input` whose name starts with the input's name
pub(super) async fn cleanup(input: &Path) {
    let Some(prefix) = input.file_name().and_then(|n| n.to_str()) else {
        warn!("Skipping cleanup: {} has no usable file name", input.display());
        return;
    };
    let dir = match input.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cleanup could not list {}: {}", dir.display(), e);
            return;
        },
    };

    let mut removed = 0usize;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Cleanup stopped listing {}: {}", dir.display(), e);
                break;
            },
        };

        let matches_prefix = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix));
        if !matches_prefix {
            continue;
        }
        if !entry.file_type().await.is_ok_and(|t| t.is_file()) {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }

    info!(removed, "Cleanup finished");
}

fn log_line(tool: &'static str) -> impl for<'l> FnMut(OutputLine<'l>) + Send {
    move |line| match line {
        OutputLine::Stdout(text) => debug!(tool, "{}", text),
        OutputLine::Stderr(text) => warn!(tool, "{}", text),
    }
}

fn exit_description(output: &ToolOutput) -> String {
    match output.exit_code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

fn storage_error(err: StoreError, subject: &SubjectDescriptor) -> IngestError {
    let message = match err {
        StoreError::AlreadyExists(name) => format!("collection {} already exists", name),
        other => other.to_string(),
    };
    IngestError::storage(message).for_subject(&subject.subject_id)
}

/// Subject list in the shape the parser reads
fn parser_subjects(subjects: &[SubjectDescriptor]) -> Result<String, IngestError> {
    let list: Vec<Value> = subjects
        .iter()
        .map(|s| json!({ "patient_id": s.subject_id, "collection_id": s.collection }))
        .collect();
    serde_json::to_string(&list)
        .map_err(|e| IngestError::parse(format!("failed to serialize subject list: {}", e)))
}

/// Path of the per-subject ignored counts the parser leaves behind
fn parser_artifact(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

impl Pipeline {
    pub(super) async fn create_collections(
        &self,
        job: &Job,
        state: &mut RunState,
    ) -> Result<(), IngestError> {
        for subject in &job.subjects {
            self.store
                .create_collection(&subject.collection)
                .await
                .map_err(|e| storage_error(e, subject))?;
            state.created_collections.push(subject.collection.clone());
            debug!(subject = %subject.subject_id, "Created collection {}", subject.collection);
        }
        Ok(())
    }

    pub(super) async fn invoke_annotator(
        &self,
        input: &Path,
        settings: &AnnotatorSettings,
    ) -> Result<(), IngestError> {
        let invocation = Invocation::new(settings.script_path(), self.config.annotator_timeout)
            .arg(input.display().to_string())
            .arg(settings.database_path().display().to_string())
            .args(["-buildver", settings.genome_build.as_str()])
            .args(["-operation".to_string(), settings.operations.join(",")])
            .args(["-nastring", "."])
            .args(["-protocol".to_string(), settings.databases.join(",")])
            .args(["-vcfinput", "-remove"]);

        info!("Running annotator {}", invocation.display_name());
        let output = self
            .tools
            .stream(&invocation, &mut log_line("annotator"))
            .await
            .map_err(|e| IngestError::annotation(e.to_string()))?;

        if !output.success() {
            return Err(IngestError::annotation(format!(
                "annotator {}",
                exit_description(&output)
            )));
        }
        Ok(())
    }

    /// Run the parser and return the ignored-line count of every subject
    pub(super) async fn invoke_parser(
        &self,
        output: &Path,
        subjects: &[SubjectDescriptor],
    ) -> Result<Vec<u64>, IngestError> {
        let invocation = Invocation::new(&self.config.parser_program, self.config.parser_timeout)
            .arg(output.display().to_string())
            .arg(parser_subjects(subjects)?);

        info!("Running parser {}", invocation.display_name());
        let result = self
            .tools
            .stream(&invocation, &mut log_line("parser"))
            .await
            .map_err(|e| IngestError::parse(e.to_string()))?;

        if !result.success() {
            return Err(IngestError::parse(format!("parser {}", exit_description(&result))));
        }
        if !result.stderr.is_empty() {
            return Err(IngestError::parse(format!(
                "parser reported an error: {}",
                result.stderr.trim_end()
            )));
        }

        let artifact = parser_artifact(output);
        let raw = tokio::fs::read_to_string(&artifact).await.map_err(|e| {
            IngestError::parse(format!("missing parser result {}: {}", artifact.display(), e))
        })?;
        let ignored: Vec<u64> = serde_json::from_str(&raw).map_err(|e| {
            IngestError::parse(format!("malformed parser result {}: {}", artifact.display(), e))
        })?;
        if ignored.len() != subjects.len() {
            return Err(IngestError::parse(format!(
                "parser reported {} ignored counts for {} subjects",
                ignored.len(),
                subjects.len()
            )));
        }
        Ok(ignored)
    }

    async fn count_lines(&self, path: &Path) -> Result<u64, IngestError> {
        let invocation =
            Invocation::new(&self.config.line_count_program, self.config.line_count_timeout)
                .arg("-l")
                .arg(path.display().to_string());

        let output = self
            .tools
            .collect(&invocation)
            .await
            .map_err(|e| IngestError::consistency(format!("line count failed: {}", e)))?;
        if !output.success() {
            return Err(IngestError::consistency(format!(
                "line count {}",
                exit_description(&output)
            )));
        }

        output
            .stdout
            .split_whitespace()
            .next()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                IngestError::consistency(format!(
                    "unexpected line count output: {:?}",
                    output.stdout.trim()
                ))
            })
    }

    pub(super) async fn verify_record_counts(
        &self,
        output: &Path,
        subjects: &[SubjectDescriptor],
        ignored: &[u64],
    ) -> Result<(), IngestError> {
        let raw = self.count_lines(output).await?;

        let mut tallies = Vec::with_capacity(subjects.len());
        for (subject, ignored) in subjects.iter().zip(ignored) {
            let inserted = self
                .store
                .count(&subject.collection, &json!({}))
                .await
                .map_err(|e| storage_error(e, subject))?;
            let tally = SubjectTally::new(inserted, *ignored);
            tallies.push(match subject.expected_records {
                Some(expected) => tally.with_expected(expected),
                None => tally,
            });
        }

        match consistency::check(raw, &tallies) {
            Verdict::Pass => {
                info!(raw_lines = raw, "Record counts reconciled");
                Ok(())
            },
            Verdict::Mismatch {
                subject_index,
                allocated,
                accounted,
                total_accounted,
            } => {
                let message = format!(
                    "{} raw lines but {} accounted for; subject accounted for {} of {}",
                    raw, total_accounted, accounted, allocated
                );
                let err = IngestError::consistency(message);
                Err(match subjects.get(subject_index) {
                    Some(subject) => err.for_subject(&subject.subject_id),
                    None => err,
                })
            },
        }
    }

    /// Index failures are logged and end the stage without failing the job
    pub(super) async fn create_indexes(
        &self,
        subjects: &[SubjectDescriptor],
        settings: &AnnotatorSettings,
    ) {
        let mut specs = vec![IndexSpec::positional()];
        specs.extend(
            settings
                .secondary_indexes
                .iter()
                .map(|field| IndexSpec::ascending([field.as_str()])),
        );

        for subject in subjects {
            for spec in &specs {
                if let Err(e) = self.store.create_index(&subject.collection, spec).await {
                    warn!(
                        subject = %subject.subject_id,
                        index = %spec.name(),
                        "Index creation failed, continuing without it: {}",
                        e
                    );
                    return;
                }
            }
        }
    }

    pub(super) async fn mark_subjects_ready(
        &self,
        subjects: &[SubjectDescriptor],
    ) -> Result<(), IngestError> {
        let ids: Vec<&str> = subjects.iter().map(|s| s.subject_id.as_str()).collect();
        let completed = Utc::now().format(COMPLETED_FORMAT).to_string();

        let matched = self
            .store
            .update_many(
                &self.config.subject_registry,
                &json!({ SUBJECT_ID_FIELD: { "$in": ids } }),
                &json!({ "$set": { READY_FIELD: true, COMPLETED_FIELD: completed } }),
            )
            .await
            .map_err(|e| IngestError::storage(format!("failed to mark subjects ready: {}", e)))?;

        if matched < subjects.len() as u64 {
            warn!(
                "Only {} of {} subjects found in registry {}",
                matched,
                subjects.len(),
                self.config.subject_registry
            );
        }
        Ok(())
    }
}
