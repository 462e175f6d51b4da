use chrono::{DateTime, Utc};
use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manifest::{RejectionEntry, RunCounts, SilverManifest};
use crate::constants::{LOCKS_DIR, MANIFEST_FILE, MANIFEST_VERSION, RECORDS_FILE, REJECTIONS_FILE, STAGING_DIR};
use crate::domain::CanonicalRecord;
use crate::error::{MalformedInput, PipelineError, Result};
use crate::idempotency::{compute_inputs_digest, sha256_hex};
use crate::observability::metrics;
use crate::pipeline::ingestion::InputFile;

static PARTITION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("partition id regex is valid"));

/// Partition ids become directory names under the Silver root
pub fn validate_partition_id(id: &str) -> Result<()> {
    if id.starts_with('.') || !PARTITION_ID.is_match(id) {
        return Err(PipelineError::InvalidPartitionId(id.to_string()));
    }
    Ok(())
}

/// Shared cancellation signal for a run, set from the Ctrl-C handler
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }
}

/// Everything a run has produced, ready to be published as one partition
#[derive(Debug, Clone)]
pub struct PartitionDraft {
    pub partition_id: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub input_partitions: Vec<String>,
    pub input_files: Vec<InputFile>,
    pub malformed_inputs: Vec<MalformedInput>,
    /// Sorted by identity key
    pub records: Vec<CanonicalRecord>,
    pub rejections: Vec<RejectionEntry>,
    pub counts: RunCounts,
    pub schema_fields: Vec<String>,
}

/// Removes a staging directory unless the publish went through
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        metrics::writer::rolled_back();
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(staging = %self.path.display(), "Rolled back staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(staging = %self.path.display(), error = %e, "Failed to remove staging directory"),
        }
    }
}

fn ndjson_bytes<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Publishes Silver partitions atomically.
///
/// Files are staged under `.staging/`, then the partition directory appears with one
/// rename while holding `.locks/<partition_id>.lock`. Readers see either no partition or
/// a complete one.
#[derive(Debug, Clone)]
pub struct SilverWriter {
    root: PathBuf,
}

impl SilverWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, partition_id: &str) -> PathBuf {
        self.root.join(partition_id)
    }

    pub fn commit(&self, draft: PartitionDraft, cancel: &CancelFlag) -> Result<SilverManifest> {
        validate_partition_id(&draft.partition_id)?;
        cancel.check()?;

        let staging_root = self.root.join(STAGING_DIR);
        let locks_root = self.root.join(LOCKS_DIR);
        fs::create_dir_all(&staging_root)?;
        fs::create_dir_all(&locks_root)?;

        let staging = staging_root.join(format!("{}-{}", draft.partition_id, draft.run_id));
        fs::create_dir_all(&staging)?;
        let mut guard = StagingGuard::new(staging.clone());

        let records = ndjson_bytes(&draft.records)?;
        write_synced(&staging.join(RECORDS_FILE), &records)?;
        write_synced(&staging.join(REJECTIONS_FILE), &ndjson_bytes(&draft.rejections)?)?;

        let mut input_files = draft.input_files;
        input_files.sort_by(|a, b| a.locator.cmp(&b.locator));
        let input_digest_parts: Vec<String> = input_files
            .iter()
            .map(|f| format!("{}:{}", f.locator, f.sha256))
            .collect();
        let mut input_partitions = draft.input_partitions;
        input_partitions.sort();
        input_partitions.dedup();

        let manifest = SilverManifest {
            manifest_version: MANIFEST_VERSION.to_string(),
            partition_id: draft.partition_id.clone(),
            run_id: draft.run_id,
            created_at: draft.created_at,
            input_partitions,
            inputs_sha256: compute_inputs_digest(&input_digest_parts),
            input_files,
            malformed_inputs: draft.malformed_inputs,
            record_count: draft.records.len(),
            rejected_count: draft.rejections.len(),
            counts: draft.counts,
            records_sha256: sha256_hex(&records),
            schema_fields: draft.schema_fields,
        };
        write_synced(
            &staging.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(locks_root.join(format!("{}.lock", draft.partition_id)))?;
        lock_file.lock_exclusive()?;
        let published = self.publish(&staging, &draft.partition_id, cancel);
        if let Err(e) = FileExt::unlock(&lock_file) {
            warn!(partition_id = %draft.partition_id, error = %e, "Failed to release partition lock");
        }
        published?;

        guard.disarm();
        metrics::writer::partition_committed(manifest.record_count);
        info!(
            partition_id = %manifest.partition_id,
            records = manifest.record_count,
            rejected = manifest.rejected_count,
            "Committed Silver partition"
        );
        Ok(manifest)
    }

    /// Runs with the partition lock held
    fn publish(&self, staging: &Path, partition_id: &str, cancel: &CancelFlag) -> Result<()> {
        let target = self.partition_dir(partition_id);
        if target.exists() {
            if !target.is_dir() || !is_empty_dir(&target)? {
                metrics::writer::write_conflict();
                return Err(PipelineError::WriteConflict {
                    partition_id: partition_id.to_string(),
                });
            }
            fs::remove_dir(&target)?;
        }

        cancel.check()?;
        fs::rename(staging, &target)?;

        // make the rename durable
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CanonicalValue, IdentityKey, Provenance};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn draft(partition_id: &str) -> PartitionDraft {
        let mut fields = BTreeMap::new();
        fields.insert("station_id".to_string(), CanonicalValue::String("S1".into()));
        let record = CanonicalRecord::new(
            IdentityKey::from_components(vec![json!("S1")]),
            fields,
            Provenance {
                source_id: "paris_bike_counts".to_string(),
                ingested_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                origin_locator: "bronze/a.json".to_string(),
                record_path: "$[0]".to_string(),
            },
        );
        PartitionDraft {
            partition_id: partition_id.to_string(),
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            input_partitions: vec!["2024-01-02".to_string()],
            input_files: vec![InputFile {
                locator: "bronze/a.json".to_string(),
                partition_id: "2024-01-02".to_string(),
                sha256: "00".to_string(),
                records: 1,
            }],
            malformed_inputs: Vec::new(),
            records: vec![record],
            rejections: Vec::new(),
            counts: RunCounts::default(),
            schema_fields: vec!["station_id".to_string()],
        }
    }

    fn staging_entries(root: &Path) -> usize {
        fs::read_dir(root.join(STAGING_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_partition_id_validation() {
        assert!(validate_partition_id("silver_20240102T000000Z").is_ok());
        assert!(validate_partition_id("2024-01-02.v2").is_ok());
        assert!(validate_partition_id(".staging").is_err());
        assert!(validate_partition_id("../escape").is_err());
        assert!(validate_partition_id("").is_err());
    }

    #[test]
    fn test_commit_publishes_complete_partition() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SilverWriter::new(dir.path());

        let manifest = writer.commit(draft("p1"), &CancelFlag::new()).unwrap();
        let target = writer.partition_dir("p1");
        assert!(target.join(RECORDS_FILE).exists());
        assert!(target.join(REJECTIONS_FILE).exists());
        assert!(target.join(MANIFEST_FILE).exists());
        assert_eq!(manifest.record_count, 1);

        let records = fs::read(target.join(RECORDS_FILE)).unwrap();
        assert_eq!(manifest.records_sha256, sha256_hex(&records));
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[test]
    fn test_existing_non_empty_partition_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SilverWriter::new(dir.path());
        writer.commit(draft("p1"), &CancelFlag::new()).unwrap();

        let err = writer.commit(draft("p1"), &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, PipelineError::WriteConflict { ref partition_id } if partition_id == "p1"));
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[test]
    fn test_existing_empty_directory_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("p1")).unwrap();
        let writer = SilverWriter::new(dir.path());
        assert!(writer.commit(draft("p1"), &CancelFlag::new()).is_ok());
    }

    #[test]
    fn test_cancelled_commit_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SilverWriter::new(dir.path());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = writer.commit(draft("p1"), &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!writer.partition_dir("p1").exists());
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[test]
    fn test_concurrent_commits_same_id_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SilverWriter::new(dir.path());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let writer = writer.clone();
                std::thread::spawn(move || writer.commit(draft("shared"), &CancelFlag::new()))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PipelineError::WriteConflict { .. })));
        assert_eq!(staging_entries(dir.path()), 0);
    }
}
