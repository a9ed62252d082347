//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Storage Configuration Constants
// ============================================================================

/// Default MongoDB connection string for local development.
pub const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017";

/// Default database name.
pub const DEFAULT_DATABASE: &str = "pgx";

/// Default collection holding the annotator settings document.
pub const DEFAULT_ADMIN_COLLECTION: &str = "admin";

/// Default subject registry collection.
pub const DEFAULT_SUBJECT_REGISTRY: &str = "patients";

// ============================================================================
// Tool Configuration Constants
// ============================================================================

/// Default parser executable, resolved through PATH.
pub const DEFAULT_PARSER_PROGRAM: &str = "pgx-parse-vcf";

/// Default line-count utility.
pub const DEFAULT_LINE_COUNT_PROGRAM: &str = "wc";

/// Default annotator timeout in seconds (6 hours).
pub const DEFAULT_ANNOTATOR_TIMEOUT_SECS: u64 = 21_600;

/// Default parser timeout in seconds (6 hours).
pub const DEFAULT_PARSER_TIMEOUT_SECS: u64 = 21_600;

/// Default line-count timeout in seconds.
pub const DEFAULT_LINE_COUNT_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Queue Configuration Constants
// ============================================================================

/// Drop collections a failed job created.
pub const DEFAULT_DROP_COLLECTIONS_ON_FAILURE: bool = true;

/// Finished jobs retained for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Largest accepted `PGX_HISTORY_LIMIT`
pub const MAX_HISTORY_LIMIT: usize = 100_000;

/// Ingestion configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub storage: StorageConfig,
    pub tools: ToolConfig,
    pub queue: QueueConfig,
}

/// Storage-specific configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub uri: String,
    pub database: String,
    pub admin_collection: String,
    pub subject_registry: String,
}

/// External program configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub parser_program: String,
    pub line_count_program: String,
    pub annotator_timeout_secs: u64,
    pub parser_timeout_secs: u64,
    pub line_count_timeout_secs: u64,
}

impl ToolConfig {
    pub fn annotator_timeout(&self) -> Duration {
        Duration::from_secs(self.annotator_timeout_secs)
    }

    pub fn parser_timeout(&self) -> Duration {
        Duration::from_secs(self.parser_timeout_secs)
    }

    pub fn line_count_timeout(&self) -> Duration {
        Duration::from_secs(self.line_count_timeout_secs)
    }
}

/// Queue and failure-handling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub drop_collections_on_failure: bool,
    pub history_limit: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl IngestConfig {
    /// Load configuration from `.env`, environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from the process environment only
    pub fn from_env() -> anyhow::Result<Self> {
        let config = IngestConfig {
            storage: StorageConfig {
                uri: env_or("MONGODB_URI", DEFAULT_MONGODB_URI),
                database: env_or("PGX_DATABASE", DEFAULT_DATABASE),
                admin_collection: env_or("PGX_ADMIN_COLLECTION", DEFAULT_ADMIN_COLLECTION),
                subject_registry: env_or("PGX_SUBJECT_REGISTRY", DEFAULT_SUBJECT_REGISTRY),
            },
            tools: ToolConfig {
                parser_program: env_or("PGX_PARSER_PROGRAM", DEFAULT_PARSER_PROGRAM),
                line_count_program: env_or("PGX_LINE_COUNT_PROGRAM", DEFAULT_LINE_COUNT_PROGRAM),
                annotator_timeout_secs: env_parse(
                    "PGX_ANNOTATOR_TIMEOUT_SECS",
                    DEFAULT_ANNOTATOR_TIMEOUT_SECS,
                ),
                parser_timeout_secs: env_parse("PGX_PARSER_TIMEOUT_SECS", DEFAULT_PARSER_TIMEOUT_SECS),
                line_count_timeout_secs: env_parse(
                    "PGX_LINE_COUNT_TIMEOUT_SECS",
                    DEFAULT_LINE_COUNT_TIMEOUT_SECS,
                ),
            },
            queue: QueueConfig {
                drop_collections_on_failure: env_parse(
                    "PGX_DROP_COLLECTIONS_ON_FAILURE",
                    DEFAULT_DROP_COLLECTIONS_ON_FAILURE,
                ),
                history_limit: env_parse("PGX_HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.uri.trim().is_empty() {
            anyhow::bail!("MongoDB URI cannot be empty");
        }
        if self.storage.database.trim().is_empty() {
            anyhow::bail!("Database name cannot be empty");
        }
        if self.storage.admin_collection.trim().is_empty() {
            anyhow::bail!("Admin collection name cannot be empty");
        }
        if self.storage.subject_registry.trim().is_empty() {
            anyhow::bail!("Subject registry collection name cannot be empty");
        }

        if self.tools.parser_program.trim().is_empty() {
            anyhow::bail!("Parser program cannot be empty");
        }
        if self.tools.line_count_program.trim().is_empty() {
            anyhow::bail!("Line-count program cannot be empty");
        }

        for (name, secs) in [
            ("annotator", self.tools.annotator_timeout_secs),
            ("parser", self.tools.parser_timeout_secs),
            ("line-count", self.tools.line_count_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("The {} timeout must be greater than 0", name);
            }
        }

        if self.queue.history_limit > MAX_HISTORY_LIMIT {
            anyhow::bail!(
                "History limit {} exceeds the maximum of {}",
                self.queue.history_limit,
                MAX_HISTORY_LIMIT
            );
        }
        if self.queue.history_limit == 0 {
            tracing::warn!("Job history disabled - finished jobs will not be retained");
        }

        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                uri: DEFAULT_MONGODB_URI.to_string(),
                database: DEFAULT_DATABASE.to_string(),
                admin_collection: DEFAULT_ADMIN_COLLECTION.to_string(),
                subject_registry: DEFAULT_SUBJECT_REGISTRY.to_string(),
            },
            tools: ToolConfig {
                parser_program: DEFAULT_PARSER_PROGRAM.to_string(),
                line_count_program: DEFAULT_LINE_COUNT_PROGRAM.to_string(),
                annotator_timeout_secs: DEFAULT_ANNOTATOR_TIMEOUT_SECS,
                parser_timeout_secs: DEFAULT_PARSER_TIMEOUT_SECS,
                line_count_timeout_secs: DEFAULT_LINE_COUNT_TIMEOUT_SECS,
            },
            queue: QueueConfig {
                drop_collections_on_failure: DEFAULT_DROP_COLLECTIONS_ON_FAILURE,
                history_limit: DEFAULT_HISTORY_LIMIT,
            },
        }
    }
}
