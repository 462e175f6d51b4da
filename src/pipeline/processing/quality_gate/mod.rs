use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ValidationConfig;
use crate::domain::{CanonicalRecord, CanonicalValue};
use crate::error::{PipelineError, RejectionReason, Result};
use crate::observability::metrics;

/// A validation rule as written in config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConfig {
    /// Every listed field must be present and non-empty
    Required { fields: Vec<String> },
    /// Numeric field within inclusive bounds
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// String or enum field must match the regex
    Pattern { field: String, regex: String },
    AllowedValues { field: String, values: Vec<String> },
    /// Timestamp field must not be later than the latest ingestion in lineage
    NotAfterIngestion {
        field: String,
        #[serde(default)]
        tolerance_secs: i64,
    },
}

/// One check applied to a deduplicated record
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason>;
}

struct RequiredRule {
    fields: Vec<String>,
}

impl ValidationRule for RequiredRule {
    fn name(&self) -> &str {
        "required"
    }

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason> {
        for field in &self.fields {
            match record.get(field) {
                Some(v) if !v.is_empty() => {}
                _ => {
                    return Err(RejectionReason::new(
                        self.name(),
                        Some(field.as_str()),
                        format!("'{}' is missing or empty", field),
                    ))
                }
            }
        }
        Ok(())
    }
}

struct RangeRule {
    field: String,
    min: Option<f64>,
    max: Option<f64>,
}

impl ValidationRule for RangeRule {
    fn name(&self) -> &str {
        "range"
    }

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason> {
        let value = match record.get(&self.field) {
            None | Some(CanonicalValue::Null) => return Ok(()),
            Some(v) => v,
        };
        let n = value.as_f64().ok_or_else(|| {
            RejectionReason::new(self.name(), Some(self.field.as_str()), "value is not numeric")
        })?;
        if let Some(min) = self.min {
            if n < min {
                return Err(RejectionReason::new(
                    self.name(),
                    Some(self.field.as_str()),
                    format!("{} is below minimum {}", n, min),
                ));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(RejectionReason::new(
                    self.name(),
                    Some(self.field.as_str()),
                    format!("{} is above maximum {}", n, max),
                ));
            }
        }
        Ok(())
    }
}

struct PatternRule {
    field: String,
    regex: Regex,
}

impl ValidationRule for PatternRule {
    fn name(&self) -> &str {
        "pattern"
    }

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason> {
        let text = match record.get(&self.field) {
            None | Some(CanonicalValue::Null) => return Ok(()),
            Some(v) => v.as_text(),
        };
        match text {
            Some(s) if self.regex.is_match(s) => Ok(()),
            Some(s) => Err(RejectionReason::new(
                self.name(),
                Some(self.field.as_str()),
                format!("'{}' does not match {}", s, self.regex.as_str()),
            )),
            None => Err(RejectionReason::new(
                self.name(),
                Some(self.field.as_str()),
                "value is not text",
            )),
        }
    }
}

struct AllowedValuesRule {
    field: String,
    values: Vec<String>,
}

impl ValidationRule for AllowedValuesRule {
    fn name(&self) -> &str {
        "allowed_values"
    }

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason> {
        let text = match record.get(&self.field) {
            None | Some(CanonicalValue::Null) => return Ok(()),
            Some(v) => v.as_text().map(str::to_string).unwrap_or_else(|| {
                v.identity_component()
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            }),
        };
        if self.values.iter().any(|v| v == &text) {
            Ok(())
        } else {
            Err(RejectionReason::new(
                self.name(),
                Some(self.field.as_str()),
                format!("'{}' is not an allowed value", text),
            ))
        }
    }
}

struct NotAfterIngestionRule {
    field: String,
    tolerance: Duration,
}

impl ValidationRule for NotAfterIngestionRule {
    fn name(&self) -> &str {
        "not_after_ingestion"
    }

    fn check(&self, record: &CanonicalRecord) -> std::result::Result<(), RejectionReason> {
        let ts = match record.get(&self.field) {
            None | Some(CanonicalValue::Null) => return Ok(()),
            Some(v) => v.as_timestamp().ok_or_else(|| {
                RejectionReason::new(self.name(), Some(self.field.as_str()), "value is not a timestamp")
            })?,
        };
        let Some(ingested_at) = record.latest_ingested_at() else {
            return Ok(());
        };
        // a bound past the representable range cannot be exceeded
        let Some(latest_allowed) = ingested_at.checked_add_signed(self.tolerance) else {
            return Ok(());
        };
        if ts > latest_allowed {
            return Err(RejectionReason::new(
                self.name(),
                Some(self.field.as_str()),
                format!("{} is after ingestion time {}", ts.to_rfc3339(), ingested_at.to_rfc3339()),
            ));
        }
        Ok(())
    }
}

fn build_rule(config: &RuleConfig) -> Result<Box<dyn ValidationRule>> {
    let rule: Box<dyn ValidationRule> = match config {
        RuleConfig::Required { fields } => Box::new(RequiredRule {
            fields: fields.clone(),
        }),
        RuleConfig::Range { field, min, max } => {
            if let (Some(lo), Some(hi)) = (min, max) {
                if lo > hi {
                    return Err(PipelineError::Config(format!(
                        "range rule on '{}' has min {} above max {}",
                        field, lo, hi
                    )));
                }
            }
            Box::new(RangeRule {
                field: field.clone(),
                min: *min,
                max: *max,
            })
        }
        RuleConfig::Pattern { field, regex } => {
            let regex = Regex::new(regex).map_err(|e| {
                PipelineError::Config(format!("pattern rule on '{}': {}", field, e))
            })?;
            Box::new(PatternRule {
                field: field.clone(),
                regex,
            })
        }
        RuleConfig::AllowedValues { field, values } => Box::new(AllowedValuesRule {
            field: field.clone(),
            values: values.clone(),
        }),
        RuleConfig::NotAfterIngestion {
            field,
            tolerance_secs,
        } => {
            let tolerance = Duration::try_seconds(*tolerance_secs)
                .filter(|t| *t >= Duration::zero())
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "not_after_ingestion rule on '{}' has tolerance_secs {} outside 0..={}",
                        field,
                        tolerance_secs,
                        i64::MAX / 1000
                    ))
                })?;
            Box::new(NotAfterIngestionRule {
                field: field.clone(),
                tolerance,
            })
        }
    };
    Ok(rule)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Accepted(CanonicalRecord),
    Rejected {
        record: CanonicalRecord,
        reason: RejectionReason,
    },
}

/// Ordered rule set applied to each deduplicated record; the first failing rule decides.
pub struct ValidationGate {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl ValidationGate {
    pub fn new(rules: Vec<Box<dyn ValidationRule>>) -> Self {
        Self { rules }
    }

    pub fn from_config(config: &ValidationConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(build_rule)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    pub fn evaluate(&self, record: CanonicalRecord) -> ValidationOutcome {
        for rule in &self.rules {
            if let Err(reason) = rule.check(&record) {
                metrics::validate::record_rejected(&reason.rule);
                return ValidationOutcome::Rejected { record, reason };
            }
        }
        metrics::validate::record_accepted();
        ValidationOutcome::Accepted(record)
    }

    /// Split records into accepted and rejected, keeping input order in both
    pub fn partition(
        &self,
        records: Vec<CanonicalRecord>,
    ) -> (Vec<CanonicalRecord>, Vec<(CanonicalRecord, RejectionReason)>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for record in records {
            match self.evaluate(record) {
                ValidationOutcome::Accepted(r) => accepted.push(r),
                ValidationOutcome::Rejected { record, reason } => rejected.push((record, reason)),
            }
        }
        (accepted, rejected)
    }
}

impl Default for ValidationGate {
    fn default() -> Self {
        // default rules contain no regex, so they always build
        Self::from_config(&ValidationConfig::default()).unwrap_or_else(|_| Self::new(Vec::new()))
    }
}
