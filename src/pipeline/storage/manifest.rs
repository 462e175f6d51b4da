use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{CanonicalRecord, IdentityKey, Provenance};
use crate::error::{MalformedInput, RejectionReason};
use crate::pipeline::ingestion::InputFile;
use crate::pipeline::processing::normalize::NormalizationFailure;

/// Per-stage counts for one run; serialized into the manifest and logged at the end
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub files_read: usize,
    pub files_malformed: usize,
    /// Raw records read from Bronze
    pub read: usize,
    pub normalized: usize,
    pub normalize_failed: usize,
    /// Records left after collapsing identity groups
    pub deduplicated: usize,
    pub duplicates_collapsed: usize,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionStage {
    Normalize,
    Validate,
}

/// One line of the rejection report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionEntry {
    /// Absent when normalization failed before a key could be built
    pub identity_key: Option<IdentityKey>,
    pub stage: RejectionStage,
    /// Failing rule, or the normalization error kind
    pub rule: String,
    pub field: Option<String>,
    pub reason: String,
    pub provenance: Vec<Provenance>,
}

impl RejectionEntry {
    pub fn from_normalization(failure: NormalizationFailure) -> Self {
        let (rule, field) = match &failure.error {
            crate::error::NormalizationError::MissingField { field } => ("missing_field", field),
            crate::error::NormalizationError::Unparseable { field, .. } => ("unparseable", field),
            crate::error::NormalizationError::OutOfDomain { field, .. } => ("out_of_domain", field),
            crate::error::NormalizationError::EmptyIdentity { field } => ("empty_identity", field),
        };
        Self {
            identity_key: None,
            stage: RejectionStage::Normalize,
            rule: rule.to_string(),
            field: Some(field.clone()),
            reason: failure.error.to_string(),
            provenance: vec![failure.provenance],
        }
    }

    pub fn from_validation(record: CanonicalRecord, reason: RejectionReason) -> Self {
        Self {
            identity_key: Some(record.identity_key),
            stage: RejectionStage::Validate,
            reason: reason.to_string(),
            rule: reason.rule,
            field: reason.field,
            provenance: record.lineage.into_iter().collect(),
        }
    }
}

/// Describes one committed Silver partition. Written last inside the partition, so a
/// readable manifest means the partition is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilverManifest {
    pub manifest_version: String,
    pub partition_id: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Bronze partitions that contributed at least one readable file, sorted
    pub input_partitions: Vec<String>,
    /// Bronze files read, sorted by locator
    pub input_files: Vec<InputFile>,
    /// Bronze files skipped as unreadable
    #[serde(default)]
    pub malformed_inputs: Vec<MalformedInput>,
    pub record_count: usize,
    pub rejected_count: usize,
    pub counts: RunCounts,
    /// Digest of the sorted `locator:sha256` list of input files
    pub inputs_sha256: String,
    /// Digest of `records.ndjson`; equal across re-runs over the same Bronze
    pub records_sha256: String,
    /// Canonical field names, in schema order
    pub schema_fields: Vec<String>,
}

/// A committed partition loaded back from the Silver store
#[derive(Debug, Clone, PartialEq)]
pub struct SilverPartition {
    pub manifest: SilverManifest,
    /// Ordered by identity key
    pub records: Vec<CanonicalRecord>,
}
