//! Shared fixtures: two destinations modelled on real integrations, both
//! pointed at a wiremock server through their `baseUrl` setting.
#![allow(dead_code)]

use relay::action::{
    Action, ActionDefinition, AutocompleteItem, AutocompleteResponse, CachedRequest,
    ExecuteInput, RequestClient, RequestOptions, StepError,
};
use relay::cache::{Cache, MemoryCache};
use relay::{Destination, Registry, Schema};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

pub const PERSON_TTL: Duration = Duration::from_secs(60);
pub const PIPEDRIVE_ID: &str = "5f7dd6d21ad74f3842b1fc47";

// ---- Pipedrive-like: builder API, cached lookup, autocomplete ----

pub fn pipedrive_settings(server: &MockServer) -> Value {
    json!({
        "baseUrl": format!("{}/api/v1", server.uri()),
        "apiToken": "token-123"
    })
}

fn pipedrive_options(input: &ExecuteInput) -> RequestOptions {
    RequestOptions::new()
        .prefix_url(input.setting_str("baseUrl"))
        .query("api_token", input.setting_str("apiToken"))
}

async fn current_user(client: RequestClient, _input: ExecuteInput) -> Result<Value, StepError> {
    Ok(client.get("users/me").send().await?.body)
}

fn person_schema() -> Value {
    json!({
        "type": "object",
        "required": ["identifier", "name"],
        "properties": {
            "identifier": {"type": "string", "defaultMapping": {"@path": "$.userId"}},
            "name": {"type": "string", "defaultMapping": {"@path": "$.traits.name"}},
            "email": {"type": "string", "defaultMapping": {"@path": "$.traits.email"}},
            "org_id": {"type": "number", "autocomplete": true},
            "add_time": {"type": "string", "defaultMapping": {"@path": "$.timestamp"}}
        }
    })
}

fn person_key(input: &ExecuteInput) -> Option<String> {
    input
        .payload
        .get("identifier")
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn find_person(client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
    let term = input
        .payload
        .get("identifier")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let response = client.get("persons/search").query("term", term).send().await?;
    Ok(response
        .body
        .pointer("/data/items/0/item/id")
        .cloned()
        .unwrap_or(Value::Null))
}

async fn upsert_person(client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
    let mut person = input.payload.clone();
    if let Some(fields) = person.as_object_mut() {
        fields.remove("identifier");
    }

    let response = match input.cached_fields.get("personId").and_then(Value::as_i64) {
        Some(id) => client.put(format!("persons/{}", id)).json(person).send().await?,
        None => client.post("persons").json(person).send().await?,
    };
    Ok(response.body)
}

async fn organizations(
    client: RequestClient,
    input: ExecuteInput,
) -> Result<AutocompleteResponse, StepError> {
    let start = input.page.clone().unwrap_or_else(|| "0".to_string());
    let response = client
        .get("organizations")
        .query("start", start)
        .query("limit", "2")
        .send()
        .await?;

    let items = response
        .body
        .get("data")
        .and_then(Value::as_array)
        .map(|orgs| {
            orgs.iter()
                .map(|org| AutocompleteItem {
                    label: org["name"].as_str().unwrap_or_default().to_string(),
                    value: org["id"].clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let next = response
        .body
        .pointer("/additional_data/pagination/next_start")
        .map(|v| v.to_string());

    Ok(AutocompleteResponse::new(items).with_next_page(next))
}

pub fn create_update_person() -> Action {
    Action::new("createUpdatePerson")
        .title("Create or Update Person")
        .validate_payload(Schema::compile(person_schema()).unwrap())
        .map_field(
            "$.add_time",
            json!({"@timestamp": {"timestamp": {"@path": "$.add_time"}, "format": "YYYY-MM-DD HH:mm:ss"}}),
        )
        .unwrap()
        .cached_request(CachedRequest::new("personId", PERSON_TTL, person_key, find_person))
        .request(upsert_person)
        .autocomplete("org_id", organizations)
}

pub fn pipedrive() -> Destination {
    Destination::new("Pipedrive")
        .validate_settings(
            Schema::compile(json!({
                "type": "object",
                "required": ["baseUrl", "apiToken"],
                "properties": {
                    "baseUrl": {"type": "string"},
                    "apiToken": {"type": "string"}
                }
            }))
            .unwrap(),
        )
        .extend_request(pipedrive_options)
        .api_key_auth(current_user)
        .partner_action(create_update_person())
}

pub fn pipedrive_with_cache(cache: Arc<dyn Cache>) -> Destination {
    pipedrive().with_cache(cache)
}

// ---- Customer.io-like: declarative definition with default mappings ----

pub fn customerio_settings(server: &MockServer) -> Value {
    json!({"baseUrl": server.uri(), "apiKey": "cio-secret"})
}

fn customerio_options(input: &ExecuteInput) -> RequestOptions {
    RequestOptions::new()
        .prefix_url(input.setting_str("baseUrl"))
        .header("x-api-key", input.setting_str("apiKey"))
}

async fn track_event(client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
    let id = input.payload["id"].as_str().unwrap_or_default().to_string();
    let body = json!({
        "name": input.payload["name"],
        "data": input.payload.get("data").cloned().unwrap_or_else(|| json!({})),
        "timestamp": input.payload.get("timestamp"),
    });
    Ok(client
        .post(format!("customers/{}/events", id))
        .json(body)
        .send()
        .await?
        .body)
}

pub fn track_event_definition() -> ActionDefinition {
    ActionDefinition::new(
        "Track Event",
        json!({
            "type": "object",
            "required": ["id", "name"],
            "properties": {
                "id": {"type": "string", "defaultMapping": {"@path": "$.userId"}},
                "name": {"type": "string", "defaultMapping": {"@path": "$.event"}},
                "data": {"type": "object", "defaultMapping": {"@path": "$.properties"}},
                "timestamp": {
                    "type": "string",
                    "defaultMapping": {"@timestamp": {"timestamp": {"@path": "$.timestamp"}, "format": "X"}}
                }
            }
        }),
        track_event,
    )
    .description("Send a tracked event to a customer's activity feed.")
}

pub fn customerio() -> Destination {
    Destination::new("Customer.io")
        .with_slug("customerio")
        .extend_request(customerio_options)
        .partner_action_definition("trackEvent", track_event_definition())
        .unwrap()
}

pub fn track(user_id: &str) -> Value {
    json!({
        "type": "track",
        "event": "Signed Up",
        "userId": user_id,
        "properties": {"plan": "pro"},
        "timestamp": "2021-03-04T05:06:07.089Z"
    })
}

pub fn identify(user_id: &str) -> Value {
    json!({
        "type": "identify",
        "userId": user_id,
        "traits": {"name": "Ada Lovelace", "email": "ada@example.com"},
        "timestamp": "2021-03-04T05:06:07.089Z"
    })
}

pub fn subscribe(action: &str, expression: &str) -> Value {
    json!({"partnerAction": action, "subscribe": expression})
}

pub fn registry() -> Registry {
    let mut registry = Registry::new(Arc::new(MemoryCache::new()));
    registry.register(pipedrive());
    registry.register(customerio());
    registry.alias(PIPEDRIVE_ID, "pipedrive");
    registry
}
