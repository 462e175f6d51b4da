use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run-level failures. Anything here aborts the run before a Silver partition is published.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No valid Bronze input: {attempted} file(s) attempted, none readable")]
    NoValidInput { attempted: usize },

    #[error("Silver partition '{partition_id}' already exists and is not empty")]
    WriteConflict { partition_id: String },

    #[error("Invalid partition id '{0}'")]
    InvalidPartitionId(String),

    #[error("Silver partition '{0}' not found")]
    PartitionNotFound(String),

    #[error("Silver partition '{partition_id}' is corrupt: {reason}")]
    CorruptPartition { partition_id: String, reason: String },

    #[error("Run cancelled before publish")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A single Bronze file that could not be read. Recoverable: the file is skipped.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Malformed input {locator}: {reason}")]
pub struct MalformedInput {
    pub locator: String,
    pub reason: String,
}

impl MalformedInput {
    pub fn new(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            reason: reason.into(),
        }
    }
}

/// Per-record normalization failure. The record is rejected and the run continues.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizationError {
    #[error("missing required source field for '{field}'")]
    MissingField { field: String },

    #[error("field '{field}': cannot parse {value} as {expected}")]
    Unparseable {
        field: String,
        value: String,
        expected: String,
    },

    #[error("field '{field}': value '{value}' is outside the allowed domain")]
    OutOfDomain { field: String, value: String },

    #[error("identity field '{field}' is empty")]
    EmptyIdentity { field: String },
}

/// Per-record validation failure produced by the first failing rule.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("rule '{rule}' failed: {message}")]
pub struct RejectionReason {
    pub rule: String,
    pub field: Option<String>,
    pub message: String,
}

impl RejectionReason {
    pub fn new(rule: &str, field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}
