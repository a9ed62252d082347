//! Common test utilities for pgx-ingest integration tests
//!
//! Provides a scripted [`ToolRunner`] that stands in for the annotator, the
//! parser and `wc`, plus a [`Harness`] that wires it to a [`MemoryStore`]
//! inside a temporary directory.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::Harness;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = Harness::new();
//!     let input = harness.write_input("sample.vcf", 100);
//!     // enqueue a job against harness.queue()
//! }
//! ```

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use pgx_common::SubjectDescriptor;
use pgx_ingest::pipeline::{Pipeline, PipelineConfig};
use pgx_ingest::settings::{AnnotatorSettings, StaticSettings};
use pgx_ingest::storage::{MemoryStore, Store};
use pgx_ingest::tool::{Invocation, OutputLine, ToolError, ToolOutput, ToolRunner};
use pgx_ingest::IngestQueue;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Parser program name used by the harness
pub const PARSER: &str = "pgx-parse-vcf";

/// Line-count program name used by the harness
pub const LINE_COUNT: &str = "wc";

/// Subject registry collection used by the harness
pub const REGISTRY: &str = "patients";

/// What the fake annotator does
#[derive(Debug, Clone)]
pub enum Annotator {
    /// Copy the input lines into the multianno output
    Succeed,
    /// Write a scratch file, then exit with this code
    Exit(i32),
    /// Exit 0 without producing the output file
    NoOutput,
    /// Cannot be started
    LaunchFailure,
    /// Sleep this long before succeeding
    Slow(Duration),
}

/// What the fake parser does
#[derive(Debug, Clone)]
pub enum Parser {
    /// Insert `inserted` records per subject and report `ignored` per subject
    Insert(Vec<(u64, u64)>),
    /// Insert as above, but also write a line to stderr
    InsertWithStderr(Vec<(u64, u64)>, String),
    /// Exit with this code without inserting anything
    Exit(i32),
    /// Write this artifact content verbatim and exit 0
    Artifact(String),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub annotator: Annotator,
    pub parser: Parser,
    /// Replace the real line count of the annotated file
    pub line_count: Option<u64>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            annotator: Annotator::Succeed,
            parser: Parser::Insert(Vec::new()),
            line_count: None,
        }
    }
}

/// Scripted stand-in for every external program the pipeline calls
pub struct FakeTools {
    store: Arc<MemoryStore>,
    script: Mutex<Script>,
    calls: Mutex<Vec<Invocation>>,
}

fn program_name(invocation: &Invocation) -> String {
    invocation
        .program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn arg_after<'a>(invocation: &'a Invocation, flag: &str) -> &'a str {
    let pos = invocation.args.iter().position(|a| a == flag).unwrap();
    &invocation.args[pos + 1]
}

fn exit(code: i32) -> ToolOutput {
    ToolOutput {
        exit_code: Some(code),
        ..Default::default()
    }
}

impl FakeTools {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Names of the programs invoked, in call order
    pub fn programs(&self) -> Vec<String> {
        self.calls().iter().map(program_name).collect()
    }

    fn script(&self) -> Script {
        self.script.lock().unwrap().clone()
    }

    async fn annotate(
        &self,
        invocation: &Invocation,
        on_line: &mut (dyn for<'l> FnMut(OutputLine<'l>) + Send),
    ) -> Result<ToolOutput, ToolError> {
        let input = PathBuf::from(&invocation.args[0]);
        let build = arg_after(invocation, "-buildver").to_string();
        let mut output_name = input.as_os_str().to_os_string();
        output_name.push(format!(".{}_multianno.vcf", build));
        let scratch = PathBuf::from(format!("{}.avinput", input.display()));

        let behaviour = self.script().annotator;
        if let Annotator::LaunchFailure = behaviour {
            return Err(ToolError::Launch {
                program: invocation.display_name(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        on_line(OutputLine::Stderr("NOTICE: Running with system command"));
        match behaviour {
            Annotator::Succeed | Annotator::LaunchFailure => {},
            Annotator::Slow(delay) => tokio::time::sleep(delay).await,
            Annotator::Exit(code) => {
                std::fs::write(&scratch, "partial\n").unwrap();
                return Ok(exit(code));
            },
            Annotator::NoOutput => return Ok(exit(0)),
        }

        std::fs::write(&scratch, "scratch\n").unwrap();
        std::fs::copy(&input, PathBuf::from(output_name)).unwrap();
        on_line(OutputLine::Stdout("Done"));
        Ok(exit(0))
    }

    async fn parse(
        &self,
        invocation: &Invocation,
        on_line: &mut (dyn for<'l> FnMut(OutputLine<'l>) + Send),
    ) -> Result<ToolOutput, ToolError> {
        let output = &invocation.args[0];
        let subjects: Vec<SubjectDescriptor> = serde_json::from_str(&invocation.args[1]).unwrap();
        let artifact = format!("{}.json", output);

        let (counts, stderr) = match self.script().parser {
            Parser::Insert(counts) => (counts, None),
            Parser::InsertWithStderr(counts, line) => (counts, Some(line)),
            Parser::Exit(code) => return Ok(exit(code)),
            Parser::Artifact(content) => {
                std::fs::write(&artifact, content).unwrap();
                return Ok(exit(0));
            },
        };

        for (subject, (inserted, _)) in subjects.iter().zip(&counts) {
            let documents: Vec<Value> = (0..*inserted)
                .map(|i| json!({ "chr": "1", "start": i, "end": i + 1, "patient_id": subject.subject_id }))
                .collect();
            self.store
                .insert_many(&subject.collection, documents)
                .await
                .unwrap();
        }
        let ignored: Vec<u64> = counts.iter().map(|(_, ignored)| *ignored).collect();
        std::fs::write(&artifact, serde_json::to_string(&ignored).unwrap()).unwrap();

        let mut result = exit(0);
        if let Some(line) = stderr {
            on_line(OutputLine::Stderr(&line));
            result.stderr = format!("{}\n", line);
        }
        Ok(result)
    }

    fn count_lines(&self, invocation: &Invocation) -> ToolOutput {
        let path = invocation.args.last().unwrap();
        let lines = match self.script().line_count {
            Some(lines) => lines,
            None => std::fs::read_to_string(path).unwrap().matches('\n').count() as u64,
        };
        ToolOutput {
            exit_code: Some(0),
            stdout: format!("  {} {}\n", lines, path),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl ToolRunner for FakeTools {
    async fn collect(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match program_name(invocation).as_str() {
            LINE_COUNT => Ok(self.count_lines(invocation)),
            other => panic!("unexpected collect call to {}", other),
        }
    }

    async fn stream(
        &self,
        invocation: &Invocation,
        on_line: &mut (dyn for<'l> FnMut(OutputLine<'l>) + Send),
    ) -> Result<ToolOutput, ToolError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match program_name(invocation).as_str() {
            "table_annovar.pl" => self.annotate(invocation, on_line).await,
            PARSER => self.parse(invocation, on_line).await,
            other => panic!("unexpected stream call to {}", other),
        }
    }
}

/// Temporary upload directory, annotator install, store and fake tools
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub tools: Arc<FakeTools>,
    pub settings: AnnotatorSettings,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let annotator = dir.path().join("annovar");
        std::fs::create_dir_all(annotator.join("humandb")).unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();

        let store = Arc::new(MemoryStore::new());
        let tools = Arc::new(FakeTools::new(Arc::clone(&store)));
        let settings = AnnotatorSettings {
            annotator_path: annotator,
            databases: vec!["refGene".into(), "clinvar_20150629".into()],
            operations: vec!["g".into(), "f".into()],
            genome_build: "hg19".into(),
            secondary_indexes: vec!["Gene_refGene".into()],
        };

        Self {
            dir,
            store,
            tools,
            settings,
        }
    }

    pub fn uploads(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    /// Write an input file with `lines` variant lines
    pub fn write_input(&self, name: &str, lines: usize) -> PathBuf {
        let path = self.uploads().join(name);
        let body: String = (0..lines)
            .map(|i| format!("1\t{}\t.\tA\tG\t50\tPASS\t.\n", 1000 + i))
            .collect();
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Files left in the upload directory
    pub fn upload_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.uploads())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Registry rows the pipeline flips to ready
    pub async fn register(&self, subjects: &[&str]) {
        let rows = subjects
            .iter()
            .map(|id| json!({ "patient_id": id, "ready": false }))
            .collect();
        self.store.insert_many(REGISTRY, rows).await.unwrap();
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            parser_program: PathBuf::from(PARSER),
            line_count_program: PathBuf::from(LINE_COUNT),
            annotator_timeout: Duration::from_secs(30),
            parser_timeout: Duration::from_secs(30),
            line_count_timeout: Duration::from_secs(5),
            subject_registry: REGISTRY.to_string(),
            drop_collections_on_failure: true,
        }
    }

    pub fn pipeline_with(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            Arc::new(StaticSettings(self.settings.clone())),
            self.store.clone(),
            self.tools.clone(),
            config,
        )
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(self.pipeline_config())
    }

    pub fn queue(&self) -> IngestQueue {
        IngestQueue::new(Arc::new(self.pipeline()), 16)
    }
}
