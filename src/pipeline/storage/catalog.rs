use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::manifest::{RejectionEntry, SilverManifest, SilverPartition};
use super::silver_writer::validate_partition_id;
use crate::constants::{MANIFEST_FILE, RECORDS_FILE, REJECTIONS_FILE};
use crate::domain::CanonicalRecord;
use crate::error::{PipelineError, Result};
use crate::idempotency::sha256_hex;

/// Read side of the Silver store. Committed manifests are the only record of what exists.
#[derive(Debug, Clone)]
pub struct SilverCatalog {
    root: PathBuf,
}

fn read_ndjson<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }
    Ok(items)
}

impl SilverCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Committed partitions ordered by creation time, then id
    pub fn list(&self) -> Result<Vec<SilverManifest>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut manifests = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let manifest_path = entry.path().join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }
            match fs::read(&manifest_path)
                .map_err(PipelineError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<SilverManifest>(&bytes)?))
            {
                Ok(m) => manifests.push(m),
                Err(e) => warn!(partition = %name, error = %e, "Skipping unreadable manifest"),
            }
        }
        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.partition_id.cmp(&b.partition_id))
        });
        Ok(manifests)
    }

    pub fn latest(&self) -> Result<Option<SilverManifest>> {
        Ok(self.list()?.pop())
    }

    fn partition_path(&self, partition_id: &str) -> Result<PathBuf> {
        validate_partition_id(partition_id)?;
        let dir = self.root.join(partition_id);
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(PipelineError::PartitionNotFound(partition_id.to_string()));
        }
        Ok(dir)
    }

    pub fn read_manifest(&self, partition_id: &str) -> Result<SilverManifest> {
        let dir = self.partition_path(partition_id)?;
        Ok(serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?)
    }

    /// Load a partition, checking the records file against the manifest digest
    pub fn read_partition(&self, partition_id: &str) -> Result<SilverPartition> {
        let dir = self.partition_path(partition_id)?;
        let manifest: SilverManifest = serde_json::from_slice(&fs::read(dir.join(MANIFEST_FILE))?)?;

        let bytes = fs::read(dir.join(RECORDS_FILE))?;
        if sha256_hex(&bytes) != manifest.records_sha256 {
            return Err(PipelineError::CorruptPartition {
                partition_id: partition_id.to_string(),
                reason: "records digest does not match manifest".to_string(),
            });
        }
        let records: Vec<CanonicalRecord> = read_ndjson(&dir.join(RECORDS_FILE))?;
        if records.len() != manifest.record_count {
            return Err(PipelineError::CorruptPartition {
                partition_id: partition_id.to_string(),
                reason: format!(
                    "manifest lists {} records, found {}",
                    manifest.record_count,
                    records.len()
                ),
            });
        }
        Ok(SilverPartition { manifest, records })
    }

    pub fn read_rejections(&self, partition_id: &str) -> Result<Vec<RejectionEntry>> {
        let dir = self.partition_path(partition_id)?;
        read_ndjson(&dir.join(REJECTIONS_FILE))
    }
}
