//! PGX Ingest - variant file ingestion tool

use anyhow::{Context, Result};
use clap::Parser;
use pgx_common::logging::{init_logging, LogConfig, LogLevel};
use pgx_common::{JobStatus, SubjectDescriptor};
use pgx_ingest::{
    IngestConfig, IngestQueue, Job, JobRequest, MongoStore, Pipeline, PipelineConfig,
    ProcessRunner, SettingsSource, StaticSettings,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pgx-ingest")]
#[command(author, version, about = "PGX variant ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Ingest one variant file and wait for it to finish
    Run {
        /// Uploaded variant file
        #[arg(short, long)]
        input: PathBuf,

        /// Submitting user
        #[arg(short, long)]
        owner: String,

        /// Subject as <id>=<collection>[:<expected records>]; repeat per subject
        #[arg(short, long = "subject", required = true, value_parser = parse_subject)]
        subjects: Vec<SubjectDescriptor>,

        /// Annotator settings JSON file instead of the admin collection
        #[arg(long, env = "PGX_SETTINGS_FILE")]
        settings: Option<PathBuf>,
    },

    /// Ingest every job of a JSON manifest, in order
    Batch {
        /// JSON array of {input, owner, subjects}
        #[arg(short, long)]
        manifest: PathBuf,

        /// Annotator settings JSON file instead of the admin collection
        #[arg(long, env = "PGX_SETTINGS_FILE")]
        settings: Option<PathBuf>,
    },

    /// Load configuration and annotator settings and report problems
    CheckConfig {
        /// Annotator settings JSON file instead of the admin collection
        #[arg(long, env = "PGX_SETTINGS_FILE")]
        settings: Option<PathBuf>,
    },
}

fn parse_subject(raw: &str) -> std::result::Result<SubjectDescriptor, String> {
    let (id, rest) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <id>=<collection>, got {:?}", raw))?;
    let (collection, expected) = match rest.split_once(':') {
        Some((collection, expected)) => {
            let expected = expected
                .parse::<u64>()
                .map_err(|e| format!("invalid expected record count {:?}: {}", expected, e))?;
            (collection, Some(expected))
        },
        None => (rest, None),
    };
    if id.is_empty() || collection.is_empty() {
        return Err(format!("subject id and collection must not be empty: {:?}", raw));
    }

    let subject = SubjectDescriptor::new(id, collection);
    Ok(match expected {
        Some(expected) => subject.with_expected_records(expected),
        None => subject,
    })
}

fn settings_source(
    store: Arc<MongoStore>,
    settings: Option<&Path>,
) -> Result<Arc<dyn SettingsSource>> {
    let source: Arc<dyn SettingsSource> = match settings {
        Some(path) => {
            info!("Using annotator settings from {}", path.display());
            Arc::new(StaticSettings::from_json_file(path)?)
        },
        None => store,
    };
    Ok(source)
}

async fn build_queue(
    config: &IngestConfig,
    settings: Option<&Path>,
    history_limit: usize,
) -> Result<IngestQueue> {
    let store = Arc::new(
        MongoStore::connect(
            &config.storage.uri,
            &config.storage.database,
            config.storage.admin_collection.clone(),
        )
        .await
        .context("Failed to connect to MongoDB")?,
    );
    let settings = settings_source(store.clone(), settings)?;
    let pipeline = Pipeline::new(
        settings,
        store,
        Arc::new(ProcessRunner::new()),
        PipelineConfig::from(config),
    );
    Ok(IngestQueue::new(Arc::new(pipeline), history_limit))
}

fn summary(job: &Job) -> String {
    let elapsed = match (job.started_at, job.finished_at) {
        (Some(start), Some(end)) => {
            format!("{:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
        },
        _ => "-".to_string(),
    };
    let line = format!("{} {} {} ({})", job.id, job.status, job.input_path.display(), elapsed);
    match &job.error {
        Some(err) => format!("{} {}", line, err),
        None => line,
    }
}

async fn run(config: &IngestConfig, request: JobRequest, settings: Option<&Path>) -> Result<()> {
    let queue = build_queue(config, settings, config.queue.history_limit.max(1)).await?;
    let id = queue.enqueue(request)?;
    let job = queue
        .wait_for(id)
        .await
        .context("Job finished but its result was lost")?;

    println!("{}", summary(&job));
    if job.status != JobStatus::Succeeded {
        anyhow::bail!("Ingestion job {} failed", job.id);
    }
    Ok(())
}

async fn batch(config: &IngestConfig, manifest: &Path, settings: Option<&Path>) -> Result<()> {
    let raw = std::fs::read_to_string(manifest)
        .with_context(|| format!("Failed to read manifest {}", manifest.display()))?;
    let requests: Vec<JobRequest> = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed manifest {}", manifest.display()))?;

    let history = config.queue.history_limit.max(requests.len());
    let queue = build_queue(config, settings, history).await?;

    let mut ids = Vec::with_capacity(requests.len());
    let mut failed = 0usize;
    for request in requests {
        let input = request.input.clone();
        match queue.enqueue(request) {
            Ok(id) => ids.push(id),
            Err(e) => {
                warn!("Rejected {}: {}", input.display(), e);
                println!("rejected {} {}", input.display(), e);
                failed += 1;
            },
        }
    }

    for id in ids {
        match queue.wait_for(id).await {
            Some(job) => {
                if job.status != JobStatus::Succeeded {
                    failed += 1;
                }
                println!("{}", summary(&job));
            },
            None => {
                warn!(job_id = %id, "Lost track of job");
                failed += 1;
            },
        }
    }

    queue.wait_idle().await;
    if failed > 0 {
        anyhow::bail!("{} job(s) did not succeed", failed);
    }
    Ok(())
}

async fn check_config(config: &IngestConfig, settings: Option<&Path>) -> Result<()> {
    println!("storage: {} / {}", config.storage.uri, config.storage.database);
    println!("parser: {}", config.tools.parser_program);
    println!("line count: {}", config.tools.line_count_program);

    let loaded = match settings {
        Some(path) => StaticSettings::from_json_file(path)?.load().await?,
        None => {
            let store = MongoStore::connect(
                &config.storage.uri,
                &config.storage.database,
                config.storage.admin_collection.clone(),
            )
            .await
            .context("Failed to connect to MongoDB")?;
            store.load().await?
        },
    };

    println!("annotator: {}", loaded.script_path().display());
    println!("genome build: {}", loaded.genome_build);
    println!("databases: {}", loaded.databases.join(","));

    if tokio::fs::metadata(&loaded.annotator_path).await.is_err() {
        anyhow::bail!("Annotator directory {} does not exist", loaded.annotator_path.display());
    }
    println!("configuration OK");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("pgx-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load()?;

    match cli.command {
        Command::Run {
            input,
            owner,
            subjects,
            settings,
        } => {
            let mut request = JobRequest::new(input, owner);
            request.subjects = subjects;
            run(&config, request, settings.as_deref()).await?;
        },
        Command::Batch { manifest, settings } => {
            batch(&config, &manifest, settings.as_deref()).await?;
        },
        Command::CheckConfig { settings } => {
            check_config(&config, settings.as_deref()).await?;
        },
    }

    info!("Done");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subject() {
        let s = parse_subject("A=alice_A").unwrap();
        assert_eq!(s.subject_id, "A");
        assert_eq!(s.collection, "alice_A");
        assert_eq!(s.expected_records, None);

        let s = parse_subject("B=alice_B:40").unwrap();
        assert_eq!(s.expected_records, Some(40));
    }

    #[test]
    fn test_parse_subject_rejects_malformed() {
        assert!(parse_subject("A").is_err());
        assert!(parse_subject("=coll").is_err());
        assert!(parse_subject("A=coll:many").is_err());
    }

    #[test]
    fn test_cli_parses_repeated_subjects() {
        let cli = Cli::try_parse_from([
            "pgx-ingest",
            "run",
            "--input",
            "/uploads/sample.vcf",
            "--owner",
            "alice",
            "--subject",
            "A=p1:60",
            "--subject",
            "B=p2",
        ])
        .unwrap();
        match cli.command {
            Command::Run { subjects, .. } => assert_eq!(subjects.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
