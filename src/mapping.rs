//! Mapping resolver.
//!
//! A mapping is a JSON tree describing the payload an action wants. Plain
//! values are copied as-is; objects holding exactly one directive key are
//! replaced by the directive's result.
//!
//! ```text
//! Directive                               | Result
//! ----------------------------------------|--------------------------------
//! {"@path": "$.properties.plan"}          | value at that path, or absent
//! {"@timestamp": {"timestamp": <spec>,    | the resolved date rendered with
//!                 "format": "YYYY-MM-DD"}}| a moment-style pattern
//! {"@template": "Hi {{traits.name}}"}     | string interpolation
//! {"@literal": {"@path": "not resolved"}} | the inner value, untouched
//! ```
//!
//! Missing data is never an error: an absent value is dropped from objects
//! and becomes `null` inside arrays. Only malformed directives fail.

use crate::event::{FieldPath, PathError};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

/// A mapping description: any JSON value, possibly containing directives.
pub type MappingSpec = Value;

const DEFAULT_TIMESTAMP_FORMAT: &str = "YYYY-MM-DDTHH:mm:ss.SSSZ";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("invalid {directive} directive: {reason}")]
    InvalidDirective {
        directive: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Path(#[from] PathError),
}

impl MappingError {
    fn invalid(directive: &'static str, reason: impl Into<String>) -> Self {
        MappingError::InvalidDirective {
            directive,
            reason: reason.into(),
        }
    }
}

/// The fixed directive vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive<'a> {
    Path(&'a Value),
    Timestamp(&'a Value),
    Template(&'a Value),
    Literal(&'a Value),
}

impl<'a> Directive<'a> {
    /// Recognise an object made of exactly one known directive key.
    pub fn detect(object: &'a Map<String, Value>) -> Option<Self> {
        if object.len() != 1 {
            return None;
        }
        let (key, value) = object.iter().next()?;
        match key.as_str() {
            "@path" => Some(Directive::Path(value)),
            "@timestamp" => Some(Directive::Timestamp(value)),
            "@template" => Some(Directive::Template(value)),
            "@literal" => Some(Directive::Literal(value)),
            _ => None,
        }
    }

    fn evaluate(&self, data: &Value) -> Result<Option<Value>, MappingError> {
        match self {
            Directive::Path(raw) => {
                let raw = raw
                    .as_str()
                    .ok_or_else(|| MappingError::invalid("@path", "expected a path string"))?;
                let path = FieldPath::parse(raw)?;
                Ok(path.get(data).cloned())
            }
            Directive::Timestamp(options) => resolve_timestamp(options, data),
            Directive::Template(raw) => {
                let template = raw
                    .as_str()
                    .ok_or_else(|| MappingError::invalid("@template", "expected a string"))?;
                render_template(template, data).map(|s| Some(Value::String(s)))
            }
            Directive::Literal(value) => Ok(Some((*value).clone())),
        }
    }
}

/// Resolve a mapping against `data`. `Ok(None)` means the value is absent.
pub fn resolve(spec: &MappingSpec, data: &Value) -> Result<Option<Value>, MappingError> {
    match spec {
        Value::Object(object) => {
            if let Some(directive) = Directive::detect(object) {
                return directive.evaluate(data);
            }
            let mut resolved = Map::with_capacity(object.len());
            for (key, child) in object {
                if let Some(value) = resolve(child, data)? {
                    resolved.insert(key.clone(), value);
                }
            }
            Ok(Some(Value::Object(resolved)))
        }
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| resolve(item, data).map(|v| v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(Value::Array(resolved)))
        }
        literal => Ok(Some(literal.clone())),
    }
}

fn resolve_timestamp(options: &Value, data: &Value) -> Result<Option<Value>, MappingError> {
    let options = options
        .as_object()
        .ok_or_else(|| MappingError::invalid("@timestamp", "expected an object"))?;
    let source = options
        .get("timestamp")
        .ok_or_else(|| MappingError::invalid("@timestamp", "missing 'timestamp'"))?;
    let format = match options.get("format") {
        None => DEFAULT_TIMESTAMP_FORMAT,
        Some(Value::String(format)) => format.as_str(),
        Some(_) => return Err(MappingError::invalid("@timestamp", "'format' must be a string")),
    };

    let Some(raw) = resolve(source, data)? else {
        return Ok(None);
    };
    Ok(parse_datetime(&raw).map(|dt| Value::String(format_moment(&dt, format))))
}

/// Accepts RFC 3339, naive date-times (treated as UTC), plain dates and
/// epoch milliseconds.
pub fn parse_datetime(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
            }
            None
        }
        _ => None,
    }
}

// Longest tokens first so `YYYY` wins over `YY`.
const TOKENS: &[&str] = &[
    "YYYY", "MMMM", "dddd", "SSS", "MMM", "ddd", "YY", "MM", "DD", "Do", "HH", "hh", "mm", "ss", "SS",
    "ZZ", "M", "D", "H", "h", "m", "s", "S", "A", "a", "Z", "X", "x",
];

/// Render a date with moment-style tokens. Text inside `[...]` is copied
/// verbatim; characters that are not tokens pass through.
pub fn format_moment(dt: &DateTime<Utc>, format: &str) -> String {
    let mut out = String::with_capacity(format.len() + 8);
    let mut rest = format;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('[') {
            match stripped.find(']') {
                Some(end) => {
                    out.push_str(&stripped[..end]);
                    rest = &stripped[end + 1..];
                    continue;
                }
                None => {
                    out.push_str(stripped);
                    break;
                }
            }
        }

        match TOKENS.iter().find(|token| rest.starts_with(*token)) {
            Some(token) => {
                out.push_str(&render_token(dt, token));
                rest = &rest[token.len()..];
            }
            None => {
                let mut chars = rest.chars();
                if let Some(c) = chars.next() {
                    out.push(c);
                }
                rest = chars.as_str();
            }
        }
    }

    out
}

fn render_token(dt: &DateTime<Utc>, token: &str) -> String {
    let millis = dt.timestamp_subsec_millis();
    let hour12 = match dt.hour() % 12 {
        0 => 12,
        h => h,
    };
    match token {
        "YYYY" => format!("{:04}", dt.year()),
        "YY" => format!("{:02}", dt.year().rem_euclid(100)),
        "MMMM" => dt.format("%B").to_string(),
        "MMM" => dt.format("%b").to_string(),
        "MM" => format!("{:02}", dt.month()),
        "M" => dt.month().to_string(),
        "DD" => format!("{:02}", dt.day()),
        "D" => dt.day().to_string(),
        "Do" => ordinal(dt.day()),
        "dddd" => dt.format("%A").to_string(),
        "ddd" => dt.format("%a").to_string(),
        "HH" => format!("{:02}", dt.hour()),
        "H" => dt.hour().to_string(),
        "hh" => format!("{:02}", hour12),
        "h" => hour12.to_string(),
        "mm" => format!("{:02}", dt.minute()),
        "m" => dt.minute().to_string(),
        "ss" => format!("{:02}", dt.second()),
        "s" => dt.second().to_string(),
        "SSS" => format!("{:03}", millis),
        "SS" => format!("{:02}", millis / 10),
        "S" => (millis / 100).to_string(),
        "A" => (if dt.hour() < 12 { "AM" } else { "PM" }).to_string(),
        "a" => (if dt.hour() < 12 { "am" } else { "pm" }).to_string(),
        "Z" => "+00:00".to_string(),
        "ZZ" => "+0000".to_string(),
        "X" => dt.timestamp().to_string(),
        "x" => dt.timestamp_millis().to_string(),
        other => other.to_string(),
    }
}

fn ordinal(n: u32) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Replace every `{{path}}` with the value found in `data`. Strings are
/// inserted raw, other values as JSON, missing values as the empty string.
fn render_template(template: &str, data: &Value) -> Result<String, MappingError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| MappingError::invalid("@template", "unclosed '{{'"))?;
        let path = FieldPath::parse(after[..close].trim())?;
        match path.get(data) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
