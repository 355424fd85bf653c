//! Webhook destination - deliver the mapped payload to a configured URL.
//!
//! Settings:
//!
//! ```json
//! {
//!   "url": "https://hooks.example.com/analytics",
//!   "headers": {"Authorization": "Bearer ..."},
//!   "subscriptions": [{"partnerAction": "send", "subscribe": "type = \"track\""}]
//! }
//! ```
//!
//! Without a subscription mapping the `send` action posts the whole event.

use crate::action::{Action, ExecuteInput, RequestClient, RequestOptions, StepError};
use crate::config::HttpConfig;
use crate::destination::Destination;
use crate::schema::{Schema, SchemaError};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

pub const SLUG: &str = "webhook";

fn settings_schema() -> Value {
    json!({
        "type": "object",
        "required": ["url"],
        "properties": {
            "url": {"type": "string", "pattern": "^https?://"},
            "headers": {
                "type": "object",
                "additionalProperties": {"type": "string"}
            }
        }
    })
}

fn send_schema() -> Value {
    json!({
        "type": "object",
        "required": ["data"],
        "properties": {
            "method": {
                "type": "string",
                "enum": ["POST", "PUT", "PATCH"],
                "defaultMapping": {"@literal": "POST"}
            },
            "data": {
                "type": "object",
                "defaultMapping": {"@path": "$"}
            }
        }
    })
}

/// Custom headers from the `headers` setting.
fn custom_headers(input: &ExecuteInput) -> RequestOptions {
    let mut options = RequestOptions::new();
    if let Some(headers) = input.settings.get("headers").and_then(Value::as_object) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                options = options.header(name.as_str(), value);
            }
        }
    }
    options
}

async fn send(client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
    let url = input.setting_str("url");
    if url.is_empty() {
        return Err(StepError::Failed("webhook url is not configured".into()));
    }

    let method = input
        .payload
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("POST");
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| StepError::Failed(format!("invalid method '{}': {}", method, e)))?;
    let data = input.payload.get("data").cloned().unwrap_or(Value::Null);

    debug!(url = %url, method = %method, "Sending webhook");
    let response = client.request(method, url).json(data).send().await?;

    Ok(json!({"status": response.status, "body": response.body}))
}

pub fn destination(http: &HttpConfig) -> Result<Destination, SchemaError> {
    let action = Action::new("send")
        .title("Send")
        .description("Send the mapped payload to the webhook URL.")
        .validate_payload(Schema::compile(send_schema())?)
        .request(send);

    Ok(Destination::new("Webhook")
        .with_slug(SLUG)
        .with_request_timeout(http.request_timeout())
        .with_auth_timeout(http.auth_timeout())
        .validate_settings(Schema::compile(settings_schema())?)
        .extend_request(custom_headers)
        .partner_action(action))
}
