//! Annotator settings (configuration collaborator)
//!
//! Settings the portal administrator maintains at runtime: where the
//! annotation tool lives, which annotation databases and operations to run,
//! the genome build, and which extra fields to index. They are read at the
//! start of every job so changes apply to the next upload without a restart.

use async_trait::async_trait;
use pgx_common::IngestError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Script name inside the annotator installation directory
pub const ANNOTATOR_SCRIPT: &str = "table_annovar.pl";

/// Database directory inside the annotator installation directory
pub const ANNOTATOR_DB_DIR: &str = "humandb";

/// Settings needed to run one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotatorSettings {
    /// Installation directory of the annotation tool
    #[serde(rename = "annovar-path")]
    pub annotator_path: PathBuf,

    /// Annotation databases (protocols)
    #[serde(rename = "annovar-dbs", default)]
    pub databases: Vec<String>,

    /// Operation mode per database, parallel to `databases`
    #[serde(rename = "annovar-usage", default)]
    pub operations: Vec<String>,

    /// Genome build identifier, e.g. "hg19"
    #[serde(rename = "genome-build", default)]
    pub genome_build: String,

    /// Extra single-field indexes created on every subject collection
    #[serde(rename = "annovar-index", default)]
    pub secondary_indexes: Vec<String>,
}

impl AnnotatorSettings {
    /// Reject settings missing a required key
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.annotator_path.as_os_str().is_empty() {
            return Err(IngestError::configuration("annotator path is not configured"));
        }
        if self.genome_build.trim().is_empty() {
            return Err(IngestError::configuration("genome build is not configured"));
        }
        if self.databases.is_empty() {
            return Err(IngestError::configuration("no annotation databases configured"));
        }
        if self.operations.is_empty() {
            return Err(IngestError::configuration("no annotation operations configured"));
        }
        if self.operations.len() != self.databases.len() {
            return Err(IngestError::configuration(format!(
                "{} annotation databases but {} operations",
                self.databases.len(),
                self.operations.len()
            )));
        }
        Ok(())
    }

    pub fn script_path(&self) -> PathBuf {
        self.annotator_path.join(ANNOTATOR_SCRIPT)
    }

    pub fn database_path(&self) -> PathBuf {
        self.annotator_path.join(ANNOTATOR_DB_DIR)
    }

    /// Annotated output the tool writes next to `input`
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let mut name = input.as_os_str().to_os_string();
        name.push(format!(".{}_multianno.vcf", self.genome_build));
        PathBuf::from(name)
    }
}

/// Source of annotator settings
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load(&self) -> Result<AnnotatorSettings, IngestError>;
}

/// Fixed settings, e.g. read once from a JSON file
#[derive(Debug, Clone)]
pub struct StaticSettings(pub AnnotatorSettings);

impl StaticSettings {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read settings {}: {}", path.display(), e))?;
        let settings: AnnotatorSettings = serde_json::from_str(&raw)?;
        Ok(Self(settings))
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn load(&self) -> Result<AnnotatorSettings, IngestError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}
