use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::bronze_locator::{self, BronzeFile, BronzeFormat};
use crate::config::ReaderConfig;
use crate::domain::{Provenance, RawRecord};
use crate::error::{MalformedInput, PipelineError, Result};
use crate::idempotency::sha256_hex;
use crate::observability::metrics;

/// A Bronze file that was read successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub locator: String,
    pub partition_id: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone)]
pub struct BronzeBatch {
    pub input: InputFile,
    pub records: Vec<RawRecord>,
}

/// Everything read for one run, in file path order.
///
/// Each file is parsed whole, so records are held in memory per batch; the
/// iterators below only avoid a second copy when flattening.
#[derive(Debug, Clone)]
pub struct BronzeReadOutcome {
    pub batches: Vec<BronzeBatch>,
    pub malformed: Vec<MalformedInput>,
    pub attempted: usize,
    /// Files left out by `reader.sources`
    pub filtered: usize,
}

impl BronzeReadOutcome {
    pub fn records(&self) -> impl Iterator<Item = &RawRecord> {
        self.batches.iter().flat_map(|b| b.records.iter())
    }

    pub fn into_records(self) -> impl Iterator<Item = RawRecord> {
        self.batches.into_iter().flat_map(|b| b.records.into_iter())
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }

    pub fn input_files(&self) -> Vec<InputFile> {
        self.batches.iter().map(|b| b.input.clone()).collect()
    }

    /// Sorted, distinct Bronze partition ids that contributed at least one readable file
    pub fn partition_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .batches
            .iter()
            .map(|b| b.input.partition_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Reads Bronze partitions into raw records tagged with provenance.
///
/// Files are opened read-only and read concurrently. A file that cannot be read is
/// skipped as [`MalformedInput`]; only a run where nothing is readable fails.
pub struct BronzeReader {
    config: ReaderConfig,
}

impl BronzeReader {
    pub fn new(config: &ReaderConfig) -> Self {
        let mut config = config.clone();
        config.max_concurrent_files = config.max_concurrent_files.max(1);
        Self { config }
    }

    pub async fn read(&self, locators: &[PathBuf]) -> Result<BronzeReadOutcome> {
        let (discovered, mut malformed) = bronze_locator::discover(locators);
        let (files, left_out): (Vec<BronzeFile>, Vec<BronzeFile>) = discovered
            .into_iter()
            .partition(|f| self.config.accepts_source(&f.name.source_id));
        for file in &left_out {
            debug!(file = %file.locator(), source = %file.name.source_id, "Source not selected");
        }
        let attempted = files.len() + malformed.len();
        info!(files = files.len(), filtered = left_out.len(), "Reading Bronze inputs");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_files));
        let mut set = JoinSet::new();
        for (idx, file) in files.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let field = self.config.ingested_at_field.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Worker(e.to_string()))?;
                let result = tokio::task::spawn_blocking(move || read_file(&file, &field))
                    .await
                    .map_err(|e| PipelineError::Worker(e.to_string()))?;
                Ok::<_, PipelineError>((idx, result))
            });
        }

        let mut read = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (idx, result) = joined.map_err(|e| PipelineError::Worker(e.to_string()))??;
            match result {
                Ok(batch) => {
                    metrics::reader::file_read(batch.records.len());
                    debug!(file = %batch.input.locator, records = batch.records.len(), "Read Bronze file");
                    read.push((idx, batch));
                }
                Err(bad) => {
                    metrics::reader::file_malformed();
                    warn!(file = %bad.locator, reason = %bad.reason, "Skipping malformed Bronze file");
                    malformed.push(bad);
                }
            }
        }

        if read.is_empty() {
            return Err(PipelineError::NoValidInput { attempted });
        }

        read.sort_by_key(|(idx, _)| *idx);
        malformed.sort_by(|a, b| a.locator.cmp(&b.locator));
        Ok(BronzeReadOutcome {
            batches: read.into_iter().map(|(_, b)| b).collect(),
            malformed,
            attempted,
            filtered: left_out.len(),
        })
    }
}

/// Read one Bronze file. Any failure is scoped to this file.
pub fn read_file(file: &BronzeFile, ingested_at_field: &str) -> std::result::Result<BronzeBatch, MalformedInput> {
    let locator = file.locator();
    let malformed = |reason: String| MalformedInput::new(locator.clone(), reason);

    let format = file
        .format
        .ok_or_else(|| malformed("unsupported file extension".to_string()))?;
    let bytes = fs::read(&file.path).map_err(|e| malformed(e.to_string()))?;
    let sha256 = sha256_hex(&bytes);

    let payload = match format {
        BronzeFormat::Json => parse_json(&bytes),
        BronzeFormat::NdJson => parse_ndjson(&bytes),
        BronzeFormat::Csv => parse_csv(&bytes),
    }
    .map_err(malformed)?;

    let file_ingested_at = file.name.ingested_at.or_else(|| {
        payload
            .top_level
            .as_ref()
            .and_then(|top| top.get(ingested_at_field))
            .and_then(parse_rfc3339)
    });

    let mut records = Vec::with_capacity(payload.records.len());
    for (record_path, fields) in payload.records {
        let ingested_at = match file_ingested_at
            .or_else(|| fields.get(ingested_at_field).and_then(parse_rfc3339))
        {
            Some(ts) => ts,
            None => {
                return Err(malformed(format!(
                    "cannot derive ingested_at for {}: no timestamp in file name and no '{}' field",
                    record_path, ingested_at_field
                )))
            }
        };
        records.push(RawRecord {
            fields,
            provenance: Provenance {
                source_id: file.name.source_id.clone(),
                ingested_at,
                origin_locator: locator.clone(),
                record_path,
            },
            bronze_partition: file.partition_id.clone(),
        });
    }

    Ok(BronzeBatch {
        input: InputFile {
            locator: locator.clone(),
            partition_id: file.partition_id.clone(),
            sha256,
            records: records.len(),
        },
        records,
    })
}

struct ParsedPayload {
    top_level: Option<Map<String, Value>>,
    records: Vec<(String, BTreeMap<String, Value>)>,
}

fn parse_rfc3339(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn expect_object(value: Value, path: &str) -> std::result::Result<BTreeMap<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(format!("{} is not an object (found {})", path, json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Opendatasoft search records keep their data under `fields`; lift it to the top
/// and keep `recordid`/`record_timestamp` alongside when not already present.
fn flatten_opendatasoft(record: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    let mut record = record;
    match record.remove("fields") {
        Some(Value::Object(fields)) => {
            let mut flat: BTreeMap<String, Value> = fields.into_iter().collect();
            for meta in ["recordid", "record_timestamp"] {
                if let Some(v) = record.remove(meta) {
                    flat.entry(meta.to_string()).or_insert(v);
                }
            }
            flat
        }
        Some(other) => {
            record.insert("fields".to_string(), other);
            record
        }
        None => record,
    }
}

fn parse_json(bytes: &[u8]) -> std::result::Result<ParsedPayload, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {}", e))?;
    match value {
        Value::Object(mut top) => match top.remove("records") {
            Some(Value::Array(items)) => {
                let mut records = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let path = format!("$.records[{}]", i);
                    let obj = expect_object(item, &path)?;
                    records.push((path, flatten_opendatasoft(obj)));
                }
                Ok(ParsedPayload {
                    top_level: Some(top),
                    records,
                })
            }
            Some(other) => Err(format!("$.records is {} instead of an array", json_kind(&other))),
            None => {
                let single: BTreeMap<String, Value> = top.clone().into_iter().collect();
                Ok(ParsedPayload {
                    top_level: Some(top),
                    records: vec![("$".to_string(), single)],
                })
            }
        },
        Value::Array(items) => {
            let mut records = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let path = format!("$[{}]", i);
                records.push((path.clone(), expect_object(item, &path)?));
            }
            Ok(ParsedPayload {
                top_level: None,
                records,
            })
        }
        other => Err(format!("top-level JSON is {}", json_kind(&other))),
    }
}

fn parse_ndjson(bytes: &[u8]) -> std::result::Result<ParsedPayload, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8: {}", e))?;
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let path = format!("line:{}", i + 1);
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON at {}: {}", path, e))?;
        records.push((path.clone(), expect_object(value, &path)?));
    }
    Ok(ParsedPayload {
        top_level: None,
        records,
    })
}

// Paris open data CSV exports use ';'
fn detect_delimiter(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolons = header.iter().filter(|b| **b == b';').count();
    let commas = header.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn parse_csv(bytes: &[u8]) -> std::result::Result<ParsedPayload, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(detect_delimiter(bytes))
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| format!("invalid CSV header: {}", e))?
        .clone();

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let path = format!("row:{}", i + 1);
        let row = row.map_err(|e| format!("invalid CSV at {}: {}", path, e))?;
        let fields = headers
            .iter()
            .zip(row.iter())
            .map(|(h, v)| (h.trim().to_string(), Value::String(v.to_string())))
            .collect();
        records.push((path, fields));
    }
    Ok(ParsedPayload {
        top_level: None,
        records,
    })
}
