//! Record shapes shared by every stage of the Bronze to Silver pipeline.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a raw record came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    /// The source system, derived from the Bronze file name prefix
    pub source_id: String,
    /// When the record landed in Bronze
    pub ingested_at: DateTime<Utc>,
    /// The Bronze file the record was read from
    pub origin_locator: String,
    /// Location of the record inside its file
    pub record_path: String,
}

/// A record exactly as read from Bronze, with no typing applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub fields: BTreeMap<String, Value>,
    pub provenance: Provenance,
    /// Id of the Bronze partition (directory or file stem) holding the record
    pub bronze_partition: String,
}

impl RawRecord {
    /// Field value, treating JSON null as absent
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !v.is_null())
    }
}

/// Typed value of a canonical Silver field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalValue {
    String(String),
    Integer(i64),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Enum(String),
    Null,
}

impl CanonicalValue {
    /// Null or a blank string counts as empty for completeness scoring
    pub fn is_empty(&self) -> bool {
        match self {
            CanonicalValue::Null => true,
            CanonicalValue::String(s) | CanonicalValue::Enum(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CanonicalValue::Integer(i) => Some(*i as f64),
            CanonicalValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CanonicalValue::String(s) | CanonicalValue::Enum(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CanonicalValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// JSON form used inside an identity key. `None` for empty values.
    pub fn identity_component(&self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        match self {
            CanonicalValue::String(s) | CanonicalValue::Enum(s) => Some(Value::String(s.clone())),
            CanonicalValue::Integer(i) => Some(Value::from(*i)),
            CanonicalValue::Number(n) => serde_json::Number::from_f64(*n).map(Value::Number),
            CanonicalValue::Timestamp(ts) => {
                Some(Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)))
            }
            CanonicalValue::Null => None,
        }
    }
}

/// Deterministic key identifying one logical entity across Bronze snapshots.
///
/// Holds the JSON array of the key fields' canonical values, e.g.
/// `["S1","2024-01-01T00:00:00Z"]`, so components can never run together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn from_components(components: Vec<Value>) -> Self {
        Self(Value::Array(components).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized entity with the lineage of every Bronze record that confirmed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identity_key: IdentityKey,
    pub fields: BTreeMap<String, CanonicalValue>,
    pub lineage: BTreeSet<Provenance>,
}

impl CanonicalRecord {
    pub fn new(
        identity_key: IdentityKey,
        fields: BTreeMap<String, CanonicalValue>,
        provenance: Provenance,
    ) -> Self {
        let mut lineage = BTreeSet::new();
        lineage.insert(provenance);
        Self {
            identity_key,
            fields,
            lineage,
        }
    }

    pub fn get(&self, field: &str) -> Option<&CanonicalValue> {
        self.fields.get(field)
    }

    pub fn latest_ingested_at(&self) -> Option<DateTime<Utc>> {
        self.lineage.iter().map(|p| p.ingested_at).max()
    }

    pub fn earliest_ingested_at(&self) -> Option<DateTime<Utc>> {
        self.lineage.iter().map(|p| p.ingested_at).min()
    }

    pub fn empty_field_count(&self) -> usize {
        self.fields.values().filter(|v| v.is_empty()).count()
    }

    /// Canonical serialization of the field values only (lineage excluded)
    pub fn canonical_fields_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.fields)
    }
}
