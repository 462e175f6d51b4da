use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::BRONZE_TIMESTAMP_FORMAT;
use crate::error::MalformedInput;

// `{prefix}[_pNNNN]_{YYYYMMDDTHHMMSSZ}` as written by the extraction client and file ingestion
static BRONZE_STEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>.+?)(?:_p(?P<page>\d{4}))?_(?P<ts>\d{8}T\d{6}Z)$")
        .expect("bronze stem regex is valid")
});

/// Payload encodings accepted in Bronze
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BronzeFormat {
    Json,
    NdJson,
    Csv,
}

impl BronzeFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(BronzeFormat::Json),
            "ndjson" | "jsonl" => Some(BronzeFormat::NdJson),
            "csv" => Some(BronzeFormat::Csv),
            _ => None,
        }
    }
}

/// What a Bronze file name tells us about its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BronzeFileName {
    pub stem: String,
    pub source_id: String,
    pub page: Option<u32>,
    pub ingested_at: Option<DateTime<Utc>>,
}

impl BronzeFileName {
    pub fn parse(stem: &str) -> Self {
        if let Some(caps) = BRONZE_STEM.captures(stem) {
            let ingested_at = caps
                .name("ts")
                .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), BRONZE_TIMESTAMP_FORMAT).ok())
                .map(|naive| naive.and_utc());
            if ingested_at.is_some() {
                return Self {
                    stem: stem.to_string(),
                    source_id: caps["prefix"].to_string(),
                    page: caps.name("page").and_then(|m| m.as_str().parse().ok()),
                    ingested_at,
                };
            }
        }
        Self {
            stem: stem.to_string(),
            source_id: stem.to_string(),
            page: None,
            ingested_at: None,
        }
    }
}

/// One Bronze file scheduled for reading
#[derive(Debug, Clone, PartialEq)]
pub struct BronzeFile {
    pub path: PathBuf,
    pub partition_id: String,
    pub name: BronzeFileName,
    pub format: Option<BronzeFormat>,
}

impl BronzeFile {
    pub fn new(path: PathBuf, partition_id: String) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = BronzeFormat::from_path(&path);
        Self {
            name: BronzeFileName::parse(&stem),
            path,
            partition_id,
            format,
        }
    }

    pub fn locator(&self) -> String {
        self.path.display().to_string()
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn dir_partition_id(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Expand partition locators (files or directories) into the files to read.
///
/// Locators are canonicalized first, so lineage does not depend on how a path was
/// spelled. Directories are listed one level deep, hidden entries skipped. The result is
/// sorted by path and free of repeats. Locators that cannot be listed are reported, not fatal.
pub fn discover(locators: &[PathBuf]) -> (Vec<BronzeFile>, Vec<MalformedInput>) {
    let mut files = Vec::new();
    let mut failures = Vec::new();

    for given in locators {
        let locator = match fs::canonicalize(given) {
            Ok(p) => p,
            Err(e) => {
                failures.push(MalformedInput::new(given.display().to_string(), e.to_string()));
                continue;
            }
        };
        let meta = match fs::metadata(&locator) {
            Ok(m) => m,
            Err(e) => {
                failures.push(MalformedInput::new(locator.display().to_string(), e.to_string()));
                continue;
            }
        };

        if meta.is_dir() {
            let entries = match fs::read_dir(&locator) {
                Ok(entries) => entries,
                Err(e) => {
                    failures.push(MalformedInput::new(locator.display().to_string(), e.to_string()));
                    continue;
                }
            };
            let partition_id = dir_partition_id(&locator);
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_file() && !is_hidden(&path) {
                    files.push(BronzeFile::new(path, partition_id.clone()));
                }
            }
        } else {
            let partition_id = locator
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            files.push(BronzeFile::new(locator, partition_id));
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);
    (files, failures)
}
