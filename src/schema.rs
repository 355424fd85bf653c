//! JSON Schema validation for payloads and settings.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The schema itself does not compile.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid JSON schema: {0}")]
pub struct SchemaError(pub String);

/// A document failed validation. Carries every violation, not just the first.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{subject} is invalid: {}", .violations.join("; "))]
pub struct ValidationError {
    pub subject: String,
    pub violations: Vec<String>,
}

/// A compiled schema plus its source document.
#[derive(Clone)]
pub struct Schema {
    raw: Value,
    validator: Arc<jsonschema::Validator>,
}

impl Schema {
    pub fn compile(raw: Value) -> Result<Self, SchemaError> {
        let validator =
            jsonschema::validator_for(&raw).map_err(|e| SchemaError(format!("{}", e)))?;
        Ok(Self {
            raw,
            validator: Arc::new(validator),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Validate `instance`, naming it `subject` in the error.
    pub fn validate(&self, subject: &str, instance: &Value) -> Result<(), ValidationError> {
        let violations: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| format!("{}", e))
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                subject: subject.to_string(),
                violations,
            })
        }
    }

    /// The mapping assembled from each property's `defaultMapping`, if any
    /// property declares one.
    pub fn default_mapping(&self) -> Option<Value> {
        let properties = self.raw.get("properties")?.as_object()?;
        let mapping: Map<String, Value> = properties
            .iter()
            .filter_map(|(name, property)| {
                property
                    .get("defaultMapping")
                    .map(|spec| (name.clone(), spec.clone()))
            })
            .collect();

        if mapping.is_empty() {
            None
        } else {
            Some(Value::Object(mapping))
        }
    }

    /// Properties flagged with `"autocomplete": true`.
    pub fn autocomplete_properties(&self) -> Vec<&str> {
        self.raw
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .filter(|(_, p)| p.get("autocomplete") == Some(&Value::Bool(true)))
                    .map(|(name, _)| name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("raw", &self.raw).finish()
    }
}
