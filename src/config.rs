use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::dedup::TieBreakCriterion;
use crate::pipeline::processing::normalize::{FieldMapping, FieldType, ParseFn};
use crate::pipeline::processing::quality_gate::{RuleConfig, ValidationGate};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub reader: ReaderConfig,
    pub normalize: NormalizeConfig,
    pub schema: SchemaConfig,
    pub dedup: DedupConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub bronze_dir: PathBuf,
    pub silver_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bronze_dir: PathBuf::from("data/bronze"),
            silver_dir: PathBuf::from("data/silver"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Upper bound on Bronze files read at the same time
    pub max_concurrent_files: usize,
    /// Payload-level field holding the ingestion time when the file name carries none
    pub ingested_at_field: String,
    /// Source ids (file name prefixes) to read; empty reads every source.
    /// The extractor writes counter metadata (`paris_bike_counters`) next to the
    /// measurements (`paris_bike_counts`) in one Bronze directory.
    pub sources: Vec<String>,
}

impl ReaderConfig {
    pub fn accepts_source(&self, source_id: &str) -> bool {
        self.sources.is_empty() || self.sources.iter().any(|s| s == source_id)
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: 8,
            ingested_at_field: "ingested_at".to_string(),
            sources: vec!["paris_bike_counts".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Normalization worker threads, 0 uses the rayon default
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Canonical fields whose values form the identity key, in order
    pub identity_key: Vec<String>,
    pub fields: Vec<FieldMapping>,
}

impl Default for SchemaConfig {
    // Paris bike counters: the counts dataset names its fields id_compteur/date/sum_counts
    fn default() -> Self {
        Self {
            identity_key: vec!["station_id".to_string(), "ts".to_string()],
            fields: vec![
                FieldMapping {
                    canonical: "station_id".to_string(),
                    sources: vec!["station_id".to_string(), "id_compteur".to_string()],
                    field_type: FieldType::String,
                    parse: ParseFn::Trim,
                    required: true,
                    allowed: Vec::new(),
                },
                FieldMapping {
                    canonical: "ts".to_string(),
                    sources: vec!["ts".to_string(), "date".to_string()],
                    field_type: FieldType::Timestamp,
                    parse: ParseFn::Identity,
                    required: true,
                    allowed: Vec::new(),
                },
                FieldMapping {
                    canonical: "bikes".to_string(),
                    sources: vec!["bikes".to_string(), "sum_counts".to_string()],
                    field_type: FieldType::Integer,
                    parse: ParseFn::Identity,
                    required: true,
                    allowed: Vec::new(),
                },
                FieldMapping {
                    canonical: "station_name".to_string(),
                    sources: vec!["station_name".to_string(), "nom_compteur".to_string()],
                    field_type: FieldType::String,
                    parse: ParseFn::Trim,
                    required: false,
                    allowed: Vec::new(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Winner selection order; canonical serialization is always applied last
    pub tie_break: Vec<TieBreakCriterion>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            tie_break: vec![
                TieBreakCriterion::LatestIngestedAt,
                TieBreakCriterion::MostComplete,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub rules: Vec<RuleConfig>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                RuleConfig::Required {
                    fields: vec!["station_id".to_string(), "ts".to_string(), "bikes".to_string()],
                },
                RuleConfig::Range {
                    field: "bikes".to_string(),
                    min: Some(0.0),
                    max: Some(100_000.0),
                },
                RuleConfig::NotAfterIngestion {
                    field: "ts".to_string(),
                    tolerance_secs: 3600,
                },
            ],
        }
    }
}

impl Config {
    /// Load a TOML config file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` when given, else `config.toml` if present, else built-in defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }
        let default_path = Path::new(constants::DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            return Self::load(default_path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(constants::ENV_BRONZE_DIR) {
            self.paths.bronze_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(constants::ENV_SILVER_DIR) {
            self.paths.silver_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.reader.max_concurrent_files == 0 {
            return Err(PipelineError::Config(
                "reader.max_concurrent_files must be at least 1".to_string(),
            ));
        }
        if self.schema.identity_key.is_empty() {
            return Err(PipelineError::Config(
                "schema.identity_key must name at least one field".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for mapping in &self.schema.fields {
            if !seen.insert(mapping.canonical.as_str()) {
                return Err(PipelineError::Config(format!(
                    "canonical field '{}' is mapped twice",
                    mapping.canonical
                )));
            }
            if mapping.sources.is_empty() {
                return Err(PipelineError::Config(format!(
                    "canonical field '{}' has no source fields",
                    mapping.canonical
                )));
            }
            if mapping.field_type == FieldType::Enum && mapping.allowed.is_empty() {
                return Err(PipelineError::Config(format!(
                    "enum field '{}' needs a non-empty 'allowed' list",
                    mapping.canonical
                )));
            }
        }

        for key_field in &self.schema.identity_key {
            match self.schema.fields.iter().find(|m| &m.canonical == key_field) {
                Some(m) if m.required => {}
                Some(_) => {
                    return Err(PipelineError::Config(format!(
                        "identity field '{}' must be required",
                        key_field
                    )))
                }
                None => {
                    return Err(PipelineError::Config(format!(
                        "identity field '{}' has no mapping",
                        key_field
                    )))
                }
            }
        }

        // rules carry their own bounds (regex syntax, range order, tolerance)
        ValidationGate::from_config(&self.validation)?;
        Ok(())
    }
}
