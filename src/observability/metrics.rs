//! Stage metrics for the Bronze to Silver pipeline.
//!
//! Recording is a no-op until a recorder is installed with [`init`], so the library
//! and its tests emit metrics unconditionally.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use tracing::info;

/// All metric names used in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Reader
    ReaderFilesRead,
    ReaderFilesMalformed,
    ReaderRecordsRead,

    // Normalize
    NormalizeRecordsNormalized,
    NormalizeRecordsFailed,

    // Dedup
    DedupGroups,
    DedupDuplicatesCollapsed,
    DedupGroupSize,

    // Validation gate
    ValidateRecordsAccepted,
    ValidateRecordsRejected,

    // Writer
    WriterPartitionsCommitted,
    WriterWriteConflicts,
    WriterRollbacks,
    WriterRecordsWritten,

    // Run
    RunDuration,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::ReaderFilesRead => "pipeline_reader_files_read_total",
            MetricName::ReaderFilesMalformed => "pipeline_reader_files_malformed_total",
            MetricName::ReaderRecordsRead => "pipeline_reader_records_read_total",
            MetricName::NormalizeRecordsNormalized => "pipeline_normalize_records_normalized_total",
            MetricName::NormalizeRecordsFailed => "pipeline_normalize_records_failed_total",
            MetricName::DedupGroups => "pipeline_dedup_groups_total",
            MetricName::DedupDuplicatesCollapsed => "pipeline_dedup_duplicates_collapsed_total",
            MetricName::DedupGroupSize => "pipeline_dedup_group_size",
            MetricName::ValidateRecordsAccepted => "pipeline_validate_records_accepted_total",
            MetricName::ValidateRecordsRejected => "pipeline_validate_records_rejected_total",
            MetricName::WriterPartitionsCommitted => "pipeline_writer_partitions_committed_total",
            MetricName::WriterWriteConflicts => "pipeline_writer_write_conflicts_total",
            MetricName::WriterRollbacks => "pipeline_writer_rollbacks_total",
            MetricName::WriterRecordsWritten => "pipeline_writer_records_written_total",
            MetricName::RunDuration => "pipeline_run_duration_seconds",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install the Prometheus recorder and return a handle for rendering
pub fn init() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    info!("Metrics system initialized");
    Ok(handle)
}

pub mod reader {
    use super::MetricName;

    pub fn file_read(records: usize) {
        ::metrics::counter!(MetricName::ReaderFilesRead.as_str()).increment(1);
        ::metrics::counter!(MetricName::ReaderRecordsRead.as_str()).increment(records as u64);
    }

    pub fn file_malformed() {
        ::metrics::counter!(MetricName::ReaderFilesMalformed.as_str()).increment(1);
    }
}

pub mod normalize {
    use super::MetricName;

    pub fn batch_normalized(normalized: usize, failed: usize) {
        ::metrics::counter!(MetricName::NormalizeRecordsNormalized.as_str())
            .increment(normalized as u64);
        ::metrics::counter!(MetricName::NormalizeRecordsFailed.as_str()).increment(failed as u64);
    }
}

pub mod dedup {
    use super::MetricName;

    pub fn group_resolved(size: usize) {
        ::metrics::counter!(MetricName::DedupGroups.as_str()).increment(1);
        ::metrics::histogram!(MetricName::DedupGroupSize.as_str()).record(size as f64);
        if size > 1 {
            ::metrics::counter!(MetricName::DedupDuplicatesCollapsed.as_str())
                .increment((size - 1) as u64);
        }
    }
}

pub mod validate {
    use super::MetricName;

    pub fn record_accepted() {
        ::metrics::counter!(MetricName::ValidateRecordsAccepted.as_str()).increment(1);
    }

    pub fn record_rejected(rule: &str) {
        ::metrics::counter!(MetricName::ValidateRecordsRejected.as_str(), "rule" => rule.to_string())
            .increment(1);
    }
}

pub mod writer {
    use super::MetricName;

    pub fn partition_committed(records: usize) {
        ::metrics::counter!(MetricName::WriterPartitionsCommitted.as_str()).increment(1);
        ::metrics::counter!(MetricName::WriterRecordsWritten.as_str()).increment(records as u64);
    }

    pub fn write_conflict() {
        ::metrics::counter!(MetricName::WriterWriteConflicts.as_str()).increment(1);
    }

    pub fn rolled_back() {
        ::metrics::counter!(MetricName::WriterRollbacks.as_str()).increment(1);
    }
}

pub mod run {
    use super::MetricName;

    pub fn finished(status: &str, seconds: f64) {
        ::metrics::histogram!(MetricName::RunDuration.as_str(), "status" => status.to_string())
            .record(seconds);
    }
}
