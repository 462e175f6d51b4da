use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::app::ports::SilverStorePort;
use crate::config::Config;
use crate::constants::{BRONZE_TIMESTAMP_FORMAT, DEFAULT_PARTITION_PREFIX};
use crate::domain::RawRecord;
use crate::error::{MalformedInput, PipelineError, Result};
use crate::observability::metrics;
use crate::pipeline::ingestion::BronzeReader;
use crate::pipeline::processing::dedup::Deduplicator;
use crate::pipeline::processing::normalize::SchemaNormalizer;
use crate::pipeline::processing::quality_gate::ValidationGate;
use crate::pipeline::storage::{
    validate_partition_id, CancelFlag, PartitionDraft, RejectionEntry, RunCounts, SilverManifest,
};

/// `silver_<YYYYMMDDTHHMMSSZ>` for a run started at `at`
pub fn default_partition_id(at: DateTime<Utc>) -> String {
    format!("{}_{}", DEFAULT_PARTITION_PREFIX, at.format(BRONZE_TIMESTAMP_FORMAT))
}

/// Per-run state handed to every stage
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub partition_id: String,
    pub started_at: DateTime<Utc>,
    pub config: Arc<Config>,
    pub cancel: CancelFlag,
}

impl RunContext {
    pub fn new(config: Arc<Config>, partition_id: Option<String>) -> Result<Self> {
        let started_at = Utc::now();
        let partition_id = partition_id.unwrap_or_else(|| default_partition_id(started_at));
        validate_partition_id(&partition_id)?;
        Ok(Self {
            run_id: Uuid::new_v4(),
            partition_id,
            started_at,
            config,
            cancel: CancelFlag::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every file read and every record accepted
    Success,
    /// Partition written, but records were rejected or files skipped
    Partial,
    /// Nothing was published
    Failure,
}

impl RunStatus {
    pub fn from_counts(counts: &RunCounts) -> Self {
        if counts.rejected > 0 || counts.files_malformed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Partial => 2,
            RunStatus::Failure => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub counts: RunCounts,
    pub manifest: SilverManifest,
    pub rejections: Vec<RejectionEntry>,
    pub malformed: Vec<MalformedInput>,
}

/// One Bronze to Silver run: read, normalize, deduplicate, validate, publish
pub struct SilverUseCase {
    reader: BronzeReader,
    normalizer: Arc<SchemaNormalizer>,
    deduplicator: Deduplicator,
    gate: Arc<ValidationGate>,
    store: Box<dyn SilverStorePort>,
    workers: usize,
}

impl SilverUseCase {
    pub fn new(config: &Config, store: Box<dyn SilverStorePort>) -> Result<Self> {
        Ok(Self {
            reader: BronzeReader::new(&config.reader),
            normalizer: Arc::new(SchemaNormalizer::new(&config.schema)),
            deduplicator: Deduplicator::from_config(&config.dedup),
            gate: Arc::new(ValidationGate::from_config(&config.validation)?),
            store,
            workers: config.normalize.workers,
        })
    }

    pub fn store(&self) -> &dyn SilverStorePort {
        self.store.as_ref()
    }

    pub async fn run(&self, ctx: &RunContext, locators: &[PathBuf]) -> Result<RunReport> {
        let span = info_span!("silver_run", run_id = %ctx.run_id, partition_id = %ctx.partition_id);
        let started = Instant::now();
        let result = self.run_stages(ctx, locators).instrument(span).await;
        let status = match &result {
            Ok(report) => report.status,
            Err(_) => RunStatus::Failure,
        };
        metrics::run::finished(status.as_str(), started.elapsed().as_secs_f64());
        result
    }

    async fn run_stages(&self, ctx: &RunContext, locators: &[PathBuf]) -> Result<RunReport> {
        ctx.cancel.check()?;
        let outcome = self.reader.read(locators).await?;

        let mut counts = RunCounts {
            files_read: outcome.batches.len(),
            files_malformed: outcome.malformed.len(),
            read: outcome.record_count(),
            ..RunCounts::default()
        };
        let input_files = outcome.input_files();
        let input_partitions = outcome.partition_ids();
        let malformed = outcome.malformed.clone();
        let raw: Vec<RawRecord> = outcome.into_records().collect();
        ctx.cancel.check()?;

        // Barrier: dedup only starts once the whole record set is normalized
        let normalizer = self.normalizer.clone();
        let workers = self.workers;
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize_all(&raw, workers))
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))??;
        counts.normalized = normalized.records.len();
        counts.normalize_failed = normalized.failures.len();
        metrics::normalize::batch_normalized(counts.normalized, counts.normalize_failed);
        ctx.cancel.check()?;

        let deduplicator = self.deduplicator.clone();
        let gate = self.gate.clone();
        let records = normalized.records;
        let (groups, collapsed, accepted, rejected) = tokio::task::spawn_blocking(move || {
            let dedup = deduplicator.deduplicate(records)?;
            let (accepted, rejected) = gate.partition(dedup.records);
            Ok::<_, PipelineError>((dedup.groups, dedup.duplicates_collapsed, accepted, rejected))
        })
        .await
        .map_err(|e| PipelineError::Worker(e.to_string()))??;
        counts.deduplicated = groups;
        counts.duplicates_collapsed = collapsed;
        counts.accepted = accepted.len();

        let mut rejections: Vec<RejectionEntry> = normalized
            .failures
            .into_iter()
            .map(RejectionEntry::from_normalization)
            .collect();
        rejections.extend(
            rejected
                .into_iter()
                .map(|(record, reason)| RejectionEntry::from_validation(record, reason)),
        );
        counts.rejected = rejections.len();
        ctx.cancel.check()?;

        let draft = PartitionDraft {
            partition_id: ctx.partition_id.clone(),
            run_id: ctx.run_id,
            created_at: ctx.started_at,
            input_partitions,
            input_files,
            malformed_inputs: malformed.clone(),
            records: accepted,
            rejections: rejections.clone(),
            counts: counts.clone(),
            schema_fields: self.normalizer.field_names(),
        };
        let manifest = self.store.commit(draft, ctx.cancel.clone()).await?;

        let status = RunStatus::from_counts(&counts);
        info!(
            status = status.as_str(),
            files_read = counts.files_read,
            files_malformed = counts.files_malformed,
            read = counts.read,
            normalized = counts.normalized,
            deduplicated = counts.deduplicated,
            duplicates_collapsed = counts.duplicates_collapsed,
            accepted = counts.accepted,
            rejected = counts.rejected,
            "Silver run finished"
        );

        Ok(RunReport {
            status,
            counts,
            manifest,
            rejections,
            malformed,
        })
    }
}
