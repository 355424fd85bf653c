//! Destination settings as they arrive on the wire.
//!
//! Raw settings mix destination configuration with the subscription list.
//! The list may be a JSON-encoded string, a single object or an array; it is
//! normalised here into `Vec<Subscription>` and nothing past this module sees
//! the original shape.

use crate::event::FieldPath;
use crate::filter::Filter;
use crate::mapping::MappingSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SUBSCRIPTIONS_KEY: &str = "subscriptions";

/// Replacement for private settings in anything that leaves the engine
/// other than the outbound request itself.
pub const REDACTED: &str = "[REDACTED]";

/// A rule binding a filter to an action and an optional payload mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub partner_action: String,
    pub subscribe: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSpec>,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscriptions are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid subscription at index {index}: {reason}")]
    Invalid { index: usize, reason: String },
}

/// Extract the subscriptions from raw settings.
///
/// Anything other than a string, object or array yields an empty list.
pub fn parse_subscriptions(settings: &Value) -> Result<Vec<Subscription>, SubscriptionError> {
    match settings.get(SUBSCRIPTIONS_KEY) {
        Some(Value::String(encoded)) => {
            let decoded: Value = serde_json::from_str(encoded)?;
            from_value(&decoded)
        }
        Some(other) => from_value(other),
        None => Ok(Vec::new()),
    }
}

fn from_value(raw: &Value) -> Result<Vec<Subscription>, SubscriptionError> {
    let items: Vec<&Value> = match raw {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![raw],
        _ => return Ok(Vec::new()),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Subscription::deserialize(item).map_err(|e| SubscriptionError::Invalid {
                index,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// The settings actions see: everything except the subscriptions.
pub fn destination_settings(settings: &Value) -> Value {
    let mut clean = match settings {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    clean.remove(SUBSCRIPTIONS_KEY);
    Value::Object(clean)
}

/// Read the private-settings list: an array of field names (or paths).
/// Non-string entries are ignored.
pub fn private_fields(raw: &Value) -> Vec<String> {
    raw.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Copy of `settings` with every private field replaced by [`REDACTED`].
pub fn redact(settings: &Value, private: &[String]) -> Value {
    let mut redacted = settings.clone();
    for field in private {
        match FieldPath::parse(field) {
            Ok(path) if !path.is_root() => {
                if path.get(&redacted).is_some() {
                    path.set(&mut redacted, Value::String(REDACTED.to_string()));
                }
            }
            _ => {
                if let Some(value) = redacted.get_mut(field.as_str()) {
                    *value = Value::String(REDACTED.to_string());
                }
            }
        }
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription() -> Value {
        json!({
            "partnerAction": "createUpdatePerson",
            "subscribe": "type = \"identify\"",
            "mapping": {"name": {"@path": "$.traits.name"}}
        })
    }

    #[test]
    fn test_array_object_and_string_shapes_agree() {
        let from_array = parse_subscriptions(&json!({"subscriptions": [subscription()]})).unwrap();
        let from_object = parse_subscriptions(&json!({"subscriptions": subscription()})).unwrap();
        let encoded = serde_json::to_string(&json!([subscription()])).unwrap();
        let from_string = parse_subscriptions(&json!({"subscriptions": encoded})).unwrap();

        assert_eq!(from_array.len(), 1);
        assert_eq!(from_array, from_object);
        assert_eq!(from_array, from_string);
        assert_eq!(from_array[0].partner_action, "createUpdatePerson");
        assert_eq!(
            from_array[0].subscribe,
            Filter::Source("type = \"identify\"".into())
        );
    }

    #[test]
    fn test_other_shapes_are_empty() {
        assert!(parse_subscriptions(&json!({})).unwrap().is_empty());
        assert!(parse_subscriptions(&json!({"subscriptions": null})).unwrap().is_empty());
        assert!(parse_subscriptions(&json!({"subscriptions": 5})).unwrap().is_empty());
        assert!(parse_subscriptions(&json!("not an object")).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_subscriptions() {
        let err = parse_subscriptions(&json!({"subscriptions": "[{"})).unwrap_err();
        assert!(matches!(err, SubscriptionError::Json(_)));

        let err = parse_subscriptions(&json!({"subscriptions": [subscription(), {"subscribe": "all"}]}))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::Invalid { index: 1, .. }));
    }

    #[test]
    fn test_destination_settings_strips_subscriptions() {
        let settings = json!({"apiKey": "secret", "subscriptions": [subscription()]});
        assert_eq!(destination_settings(&settings), json!({"apiKey": "secret"}));
        assert_eq!(destination_settings(&json!(null)), json!({}));
    }

    #[test]
    fn test_redact() {
        let settings = json!({"apiKey": "secret", "domain": "acme", "oauth": {"token": "t"}});
        let private = private_fields(&json!(["apiKey", "oauth.token", "missing", 3]));
        assert_eq!(private, vec!["apiKey", "oauth.token", "missing"]);

        let redacted = redact(&settings, &private);
        assert_eq!(
            redacted,
            json!({"apiKey": REDACTED, "domain": "acme", "oauth": {"token": REDACTED}})
        );
        // Source settings untouched.
        assert_eq!(settings["apiKey"], "secret");
    }
}
