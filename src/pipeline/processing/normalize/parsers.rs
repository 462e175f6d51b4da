use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FieldType;
use crate::domain::CanonicalValue;
use crate::error::NormalizationError;

/// Named parse functions that can be attached to a field mapping in config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseFn {
    #[default]
    Identity,
    Trim,
    Lowercase,
    Uppercase,
    /// French decimal notation, `"3,5"` becomes `3.5`
    DecimalComma,
    EpochSeconds,
    EpochMillis,
}

impl ParseFn {
    fn apply_text(&self, s: &str) -> String {
        match self {
            ParseFn::Identity => s.to_string(),
            ParseFn::Trim => s.trim().to_string(),
            ParseFn::Lowercase => s.trim().to_lowercase(),
            ParseFn::Uppercase => s.trim().to_uppercase(),
            ParseFn::DecimalComma => s.trim().replace(',', "."),
            ParseFn::EpochSeconds | ParseFn::EpochMillis => s.trim().to_string(),
        }
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse a timestamp string; values without an offset are taken as UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn unparseable(field: &str, value: &Value, expected: &str) -> NormalizationError {
    NormalizationError::Unparseable {
        field: field.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number_of(value: &Value, parse: ParseFn) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse.apply_text(s).trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

// 2^63, the first f64 past i64::MAX
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn exact_i64(n: f64) -> Option<i64> {
    (n.is_finite() && n.fract() == 0.0 && n >= -I64_BOUND && n < I64_BOUND).then_some(n as i64)
}

/// Integers are read without an f64 round trip; whole floats are accepted when in range
fn integer_of(value: &Value, parse: ParseFn) -> Option<i64> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i),
            None if n.is_u64() => None,
            None => n.as_f64().and_then(exact_i64),
        },
        Value::String(s) => {
            let text = parse.apply_text(s);
            let text = text.trim();
            match text.parse::<i64>() {
                Ok(i) => Some(i),
                Err(_) if text.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'+') => None,
                Err(_) => text.parse::<f64>().ok().and_then(exact_i64),
            }
        }
        _ => None,
    }
}

fn epoch_timestamp(n: f64, parse: ParseFn) -> Option<DateTime<Utc>> {
    let millis = match parse {
        ParseFn::EpochMillis => n,
        _ => n * 1000.0,
    };
    if millis.fract() != 0.0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis as i64)
}

/// Convert one raw value into the typed canonical value for `field`
pub fn extract(
    field: &str,
    field_type: FieldType,
    parse: ParseFn,
    allowed: &[String],
    value: &Value,
) -> Result<CanonicalValue, NormalizationError> {
    match field_type {
        FieldType::String => text_of(value)
            .map(|s| CanonicalValue::String(parse.apply_text(&s)))
            .ok_or_else(|| unparseable(field, value, "string")),

        FieldType::Integer => integer_of(value, parse)
            .map(CanonicalValue::Integer)
            .ok_or_else(|| unparseable(field, value, "integer")),

        FieldType::Number => number_of(value, parse)
            .map(CanonicalValue::Number)
            .ok_or_else(|| unparseable(field, value, "number")),

        FieldType::Timestamp => {
            let ts = match parse {
                ParseFn::EpochSeconds | ParseFn::EpochMillis => {
                    number_of(value, parse).and_then(|n| epoch_timestamp(n, parse))
                }
                _ => value
                    .as_str()
                    .and_then(|s| parse_timestamp(&parse.apply_text(s))),
            };
            ts.map(CanonicalValue::Timestamp)
                .ok_or_else(|| unparseable(field, value, "timestamp"))
        }

        FieldType::Enum => {
            let s = text_of(value)
                .map(|s| parse.apply_text(&s))
                .ok_or_else(|| unparseable(field, value, "enum"))?;
            if allowed.iter().any(|a| a == &s) {
                Ok(CanonicalValue::Enum(s))
            } else {
                Err(NormalizationError::OutOfDomain {
                    field: field.to_string(),
                    value: s,
                })
            }
        }
    }
}
