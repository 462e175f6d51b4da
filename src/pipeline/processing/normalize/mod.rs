pub mod parsers;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::SchemaConfig;
use crate::domain::{CanonicalRecord, CanonicalValue, IdentityKey, Provenance, RawRecord};
use crate::error::{NormalizationError, PipelineError, Result};

pub use parsers::ParseFn;

/// Canonical Silver field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Timestamp,
    Enum,
}

/// How one canonical field is filled from a raw record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Canonical field name in Silver
    pub canonical: String,
    /// Source field names to look for, first present wins
    pub sources: Vec<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub parse: ParseFn,
    #[serde(default)]
    pub required: bool,
    /// Allowed values for enum fields
    #[serde(default)]
    pub allowed: Vec<String>,
}

impl FieldMapping {
    /// First non-null, non-blank source value
    fn lookup<'a>(&self, raw: &'a RawRecord) -> Option<&'a Value> {
        self.sources.iter().find_map(|source| {
            raw.get(source).filter(|v| match v {
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
        })
    }
}

/// A raw record that could not be normalized, kept for the rejection report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationFailure {
    pub provenance: Provenance,
    pub error: NormalizationError,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub records: Vec<CanonicalRecord>,
    pub failures: Vec<NormalizationFailure>,
}

/// Maps raw Bronze records onto the canonical Silver schema.
///
/// A pure function of the raw record's fields and provenance: the same input always
/// yields the same canonical record or the same error.
#[derive(Debug, Clone)]
pub struct SchemaNormalizer {
    fields: Vec<FieldMapping>,
    identity_key: Vec<String>,
}

impl SchemaNormalizer {
    pub fn new(schema: &SchemaConfig) -> Self {
        Self {
            fields: schema.fields.clone(),
            identity_key: schema.identity_key.clone(),
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.canonical.clone()).collect()
    }

    pub fn normalize(&self, raw: &RawRecord) -> std::result::Result<CanonicalRecord, NormalizationError> {
        let mut fields = BTreeMap::new();

        for mapping in &self.fields {
            let value = match mapping.lookup(raw) {
                Some(v) => parsers::extract(
                    &mapping.canonical,
                    mapping.field_type,
                    mapping.parse,
                    &mapping.allowed,
                    v,
                )?,
                None if mapping.required => {
                    return Err(NormalizationError::MissingField {
                        field: mapping.canonical.clone(),
                    })
                }
                None => CanonicalValue::Null,
            };
            if mapping.required && value.is_empty() {
                return Err(NormalizationError::MissingField {
                    field: mapping.canonical.clone(),
                });
            }
            fields.insert(mapping.canonical.clone(), value);
        }

        let mut components = Vec::with_capacity(self.identity_key.len());
        for key_field in &self.identity_key {
            let component = fields
                .get(key_field)
                .and_then(CanonicalValue::identity_component)
                .ok_or_else(|| NormalizationError::EmptyIdentity {
                    field: key_field.clone(),
                })?;
            components.push(component);
        }

        Ok(CanonicalRecord::new(
            IdentityKey::from_components(components),
            fields,
            raw.provenance.clone(),
        ))
    }

    fn normalize_split(&self, raw: &RawRecord) -> std::result::Result<CanonicalRecord, NormalizationFailure> {
        self.normalize(raw).map_err(|error| NormalizationFailure {
            provenance: raw.provenance.clone(),
            error,
        })
    }

    /// Normalize a batch in parallel. Output order follows input order.
    ///
    /// `workers == 0` runs on the global rayon pool.
    pub fn normalize_all(&self, records: &[RawRecord], workers: usize) -> Result<NormalizeOutcome> {
        let run = || -> Vec<_> { records.par_iter().map(|r| self.normalize_split(r)).collect() };

        let results = if workers == 0 {
            run()
        } else {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| PipelineError::Worker(e.to_string()))?
                .install(run)
        };

        let mut outcome = NormalizeOutcome::default();
        for result in results {
            match result {
                Ok(record) => outcome.records.push(record),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        Ok(outcome)
    }
}
