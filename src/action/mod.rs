//! Actions and their step pipelines.
//!
//! An [`Action`] is one operation a destination can perform. It is plain
//! data: an optional payload schema, a default mapping, an ordered list of
//! [`Step`]s and autocomplete handlers. Actions are built either with the
//! builder methods or from a declarative [`ActionDefinition`].
//!
//! ```text
//! execute(input)
//!   |- map          subscription mapping, else the schema's default mapping
//!   |- validate     payload against the schema
//!   |- map-field    rewrite one payload field
//!   |- cached       key(input) -> cache hit, or compute and store for ttl
//!   '- request      perform(client, input)
//! ```
//!
//! Steps run strictly in order. The first failure aborts the invocation
//! with an [`ActionError`] naming the step; nothing is retried.
//!
//! ```rust,ignore
//! let action = Action::new("createUpdatePerson")
//!     .validate_payload(Schema::compile(schema)?)
//!     .map_field("$.add_time", json!({"@timestamp": {...}}))?
//!     .cached_request(CachedRequest::new("personId", Duration::from_secs(60), key, lookup))
//!     .request(|client: RequestClient, input: ExecuteInput| async move {
//!         Ok(client.post("persons").json(input.payload).send().await?.body)
//!     });
//! ```

pub mod autocomplete;
pub mod client;
pub mod step;

pub use autocomplete::{Autocomplete, AutocompleteItem, AutocompleteResponse, Pagination};
pub use client::{
    Exchange, ExchangeLog, HttpResponse, RecordedRequest, RecordedResponse, RequestBuilder,
    RequestClient, RequestExtension, RequestOptions,
};
pub use step::{CachedRequest, KeyFn, Step, StepResult};

use crate::cache::Cache;
use crate::event::{Event, FieldPath, PathError};
use crate::mapping::{self, MappingError, MappingSpec};
use crate::schema::{Schema, SchemaError, ValidationError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-invocation state threaded through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteInput {
    /// The event as received.
    #[serde(skip)]
    pub event: Event,

    /// Starts as the event; replaced by the resolved mapping.
    pub payload: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<MappingSpec>,

    /// Destination settings, subscriptions removed.
    pub settings: Value,

    /// Values produced by cached steps. Write-once per key.
    pub cached_fields: Map<String, Value>,

    /// Pagination cursor, only set for autocomplete.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

impl ExecuteInput {
    pub fn new(event: Event, mapping: Option<MappingSpec>, settings: Value) -> Self {
        Self {
            payload: event.clone(),
            event,
            mapping,
            settings,
            cached_fields: Map::new(),
            page: None,
        }
    }

    /// Input for calls that have no event (authentication tests).
    pub fn from_settings(settings: Value) -> Self {
        Self {
            event: Value::Object(Map::new()),
            payload: Value::Object(Map::new()),
            mapping: None,
            settings,
            cached_fields: Map::new(),
            page: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_page(mut self, page: Option<String>) -> Self {
        self.page = page;
        self
    }

    /// A setting as a string, empty when absent.
    pub fn setting_str(&self, key: &str) -> &str {
        self.settings.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

/// Failure inside a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{method} {url} returned status {status}")]
    Http {
        status: u16,
        method: String,
        url: String,
        body: Value,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("cached field '{0}' was already set by an earlier step")]
    CachedFieldConflict(String),

    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Upstream HTTP status, when the failure came from the destination API.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            StepError::Http { status, .. } => Some(*status),
            StepError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// An action invocation failed at `step`.
#[derive(Debug, Error)]
#[error("step '{step}' failed: {source}")]
pub struct ActionError {
    pub step: &'static str,
    pub source: StepError,
}

/// The terminal work of an action, also used for cached-value lookups and
/// authentication tests.
///
/// Implemented for any `Fn(RequestClient, ExecuteInput) -> impl Future`.
#[async_trait]
pub trait Perform: Send + Sync {
    async fn perform(&self, client: RequestClient, input: ExecuteInput) -> Result<Value, StepError>;
}

#[async_trait]
impl<F, Fut> Perform for F
where
    F: Fn(RequestClient, ExecuteInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
{
    async fn perform(&self, client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
        (self)(client, input).await
    }
}

/// What an invocation needs from its destination: identity for cache keys,
/// the shared cache and the means to build request clients.
#[derive(Clone)]
pub struct ActionRuntime {
    pub destination: String,
    pub cache: Arc<dyn Cache>,
    pub http: reqwest::Client,
    pub base_options: RequestOptions,
    pub extensions: Arc<Vec<RequestExtension>>,
    pub exchanges: ExchangeLog,
}

impl ActionRuntime {
    /// A client whose options come from every extension applied to `input`.
    pub fn client(&self, input: &ExecuteInput) -> RequestClient {
        let options = self
            .extensions
            .iter()
            .fold(self.base_options.clone(), |options, extension| {
                options.merge(extension(input))
            });
        RequestClient::new(self.http.clone(), options, self.exchanges.clone())
    }
}

/// Declarative action contract: schema, perform and autocomplete handlers.
pub struct ActionDefinition {
    pub title: String,
    pub description: String,
    pub schema: Value,
    pub perform: Arc<dyn Perform>,
    pub autocomplete_fields: HashMap<String, Arc<dyn Autocomplete>>,
}

impl ActionDefinition {
    pub fn new(title: impl Into<String>, schema: Value, perform: impl Perform + 'static) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            schema,
            perform: Arc::new(perform),
            autocomplete_fields: HashMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn autocomplete(mut self, field: impl Into<String>, handler: impl Autocomplete + 'static) -> Self {
        self.autocomplete_fields.insert(field.into(), Arc::new(handler));
        self
    }
}

pub struct Action {
    slug: String,
    title: String,
    description: String,
    schema: Option<Schema>,
    default_mapping: Option<MappingSpec>,
    steps: Vec<Step>,
    autocomplete: HashMap<String, Arc<dyn Autocomplete>>,
}

impl Action {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            title: String::new(),
            description: String::new(),
            schema: None,
            default_mapping: None,
            steps: Vec::new(),
            autocomplete: HashMap::new(),
        }
    }

    /// Build an action from a declarative definition: validate against the
    /// schema, default mapping from the schema, then perform.
    pub fn from_definition(
        slug: impl Into<String>,
        definition: ActionDefinition,
    ) -> Result<Self, SchemaError> {
        let schema = Schema::compile(definition.schema)?;
        let mut action = Action::new(slug)
            .title(definition.title)
            .description(definition.description)
            .validate_payload(schema);
        action.steps.push(Step::Request(definition.perform));
        action.autocomplete = definition.autocomplete_fields;
        Ok(action)
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Validate the payload against `schema`. The schema's `defaultMapping`
    /// properties also become the action's default mapping.
    pub fn validate_payload(mut self, schema: Schema) -> Self {
        if self.default_mapping.is_none() {
            self.default_mapping = schema.default_mapping();
        }
        self.steps.push(Step::Validate(schema.clone()));
        self.schema = Some(schema);
        self
    }

    pub fn default_mapping(mut self, mapping: MappingSpec) -> Self {
        self.default_mapping = Some(mapping);
        self
    }

    /// Resolve `spec` against the payload and write it at `target`.
    pub fn map_field(mut self, target: &str, spec: MappingSpec) -> Result<Self, PathError> {
        let target = FieldPath::parse(target)?;
        self.steps.push(Step::MapField { target, spec });
        Ok(self)
    }

    pub fn cached_request(mut self, cached: CachedRequest) -> Self {
        self.steps.push(Step::Cached(cached));
        self
    }

    pub fn request(mut self, perform: impl Perform + 'static) -> Self {
        self.steps.push(Step::Request(Arc::new(perform)));
        self
    }

    pub fn autocomplete(mut self, field: impl Into<String>, handler: impl Autocomplete + 'static) -> Self {
        self.autocomplete.insert(field.into(), Arc::new(handler));
        self
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn title_text(&self) -> &str {
        &self.title
    }

    pub fn description_text(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn autocomplete_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.autocomplete.keys().map(String::as_str).collect();
        fields.sort_unstable();
        fields
    }

    /// Run the pipeline. `input` holds the final payload and cached fields
    /// afterwards.
    pub async fn execute(
        &self,
        runtime: &ActionRuntime,
        input: &mut ExecuteInput,
    ) -> Result<Vec<StepResult>, ActionError> {
        let mut results = Vec::with_capacity(self.steps.len() + 1);

        let mapping = input.mapping.as_ref().or(self.default_mapping.as_ref());
        if let Some(spec) = mapping {
            let payload = mapping::resolve(spec, &input.event)
                .map_err(|e| self.fail("map", StepError::Mapping(e)))?;
            input.payload = payload.unwrap_or_else(|| Value::Object(Map::new()));
            results.push(StepResult::output("Mappings resolved"));
        }

        for step in &self.steps {
            debug!(action = %self.slug, step = step.name(), "Running step");
            let result = step
                .run(runtime, &self.slug, input)
                .await
                .map_err(|e| self.fail(step.name(), e))?;
            results.push(result);
        }

        Ok(results)
    }

    /// Fetch autocomplete suggestions for `field`. With a payload schema,
    /// the field must also be flagged `"autocomplete": true` there.
    pub async fn autocomplete_field(
        &self,
        runtime: &ActionRuntime,
        field: &str,
        input: ExecuteInput,
    ) -> Result<AutocompleteResponse, ActionError> {
        if let Some(schema) = &self.schema {
            if !schema.autocomplete_properties().contains(&field) {
                return Err(self.fail(
                    "autocomplete",
                    StepError::Failed(format!("field '{}' does not support autocomplete", field)),
                ));
            }
        }

        let handler = self.autocomplete.get(field).ok_or_else(|| {
            self.fail(
                "autocomplete",
                StepError::Failed(format!("no autocomplete handler for field '{}'", field)),
            )
        })?;

        let client = runtime.client(&input);
        handler
            .complete(client, input)
            .await
            .map_err(|e| self.fail("autocomplete", e))
    }

    fn fail(&self, step: &'static str, source: StepError) -> ActionError {
        warn!(action = %self.slug, step = step, error = %source, "Step failed");
        ActionError { step, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> ActionRuntime {
        ActionRuntime {
            destination: "test".into(),
            cache: Arc::new(MemoryCache::new()),
            http: reqwest::Client::new(),
            base_options: RequestOptions::new(),
            extensions: Arc::new(Vec::new()),
            exchanges: ExchangeLog::new(),
        }
    }

    async fn echo(_client: RequestClient, input: ExecuteInput) -> Result<Value, StepError> {
        Ok(input.payload)
    }

    #[tokio::test]
    async fn test_mapping_then_perform() {
        let action = Action::new("echo").request(echo);
        let mut input = ExecuteInput::new(
            json!({"traits": {"name": "Ada"}}),
            Some(json!({"name": {"@path": "$.traits.name"}})),
            json!({}),
        );

        let results = action.execute(&runtime(), &mut input).await.unwrap();
        assert_eq!(
            results,
            vec![
                StepResult::output("Mappings resolved"),
                StepResult::output(json!({"name": "Ada"}))
            ]
        );
    }

    #[tokio::test]
    async fn test_without_mapping_payload_is_event() {
        let action = Action::new("echo").request(echo);
        let event = json!({"type": "track"});
        let mut input = ExecuteInput::new(event.clone(), None, json!({}));

        let results = action.execute(&runtime(), &mut input).await.unwrap();
        assert_eq!(results, vec![StepResult::output(event)]);
    }

    #[tokio::test]
    async fn test_default_mapping_from_schema() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": {"data": {"type": "object", "defaultMapping": {"@path": "$.properties"}}}
        }))
        .unwrap();
        let action = Action::new("echo").validate_payload(schema).request(echo);
        let mut input = ExecuteInput::new(json!({"properties": {"plan": "pro"}}), None, json!({}));

        let results = action.execute(&runtime(), &mut input).await.unwrap();
        assert_eq!(results.last(), Some(&StepResult::output(json!({"data": {"plan": "pro"}}))));
    }

    #[tokio::test]
    async fn test_validation_aborts_before_perform() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let schema = Schema::compile(json!({"type": "object", "required": ["email"]})).unwrap();
        let action = Action::new("strict")
            .validate_payload(schema)
            .request(move |_client: RequestClient, _input: ExecuteInput| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StepError>(Value::Null)
                }
            });

        let mut input = ExecuteInput::new(json!({"name": "x"}), None, json!({}));
        let err = action.execute(&runtime(), &mut input).await.unwrap_err();

        assert_eq!(err.step, "validate");
        assert!(matches!(err.source, StepError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_from_definition() {
        let definition = ActionDefinition::new(
            "Echo",
            json!({"type": "object", "properties": {"id": {"type": "number"}}, "required": ["id"]}),
            echo,
        )
        .description("Echoes the payload");
        let action = Action::from_definition("echo", definition).unwrap();

        assert_eq!(action.title_text(), "Echo");
        assert_eq!(action.steps().len(), 2);

        let mut input = ExecuteInput::new(json!({"id": 4}), None, json!({}));
        let results = action.execute(&runtime(), &mut input).await.unwrap();
        assert_eq!(
            results,
            vec![
                StepResult::output("Payload validated"),
                StepResult::output(json!({"id": 4}))
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_autocomplete_field() {
        let action = Action::new("echo").request(echo);
        let err = action
            .autocomplete_field(&runtime(), "org_id", ExecuteInput::default())
            .await
            .unwrap_err();
        assert_eq!(err.step, "autocomplete");
    }

    async fn suggest(
        _client: RequestClient,
        _input: ExecuteInput,
    ) -> Result<AutocompleteResponse, StepError> {
        Ok(AutocompleteResponse::new(vec![AutocompleteItem {
            label: "Acme".into(),
            value: json!(1),
        }]))
    }

    #[tokio::test]
    async fn test_autocomplete_requires_schema_flag() {
        let schema = Schema::compile(json!({
            "type": "object",
            "properties": {
                "org_id": {"type": "number", "autocomplete": true},
                "owner_id": {"type": "number"}
            }
        }))
        .unwrap();
        let action = Action::new("upsert")
            .validate_payload(schema)
            .request(echo)
            .autocomplete("org_id", suggest)
            .autocomplete("owner_id", suggest);

        let response = action
            .autocomplete_field(&runtime(), "org_id", ExecuteInput::default())
            .await
            .unwrap();
        assert_eq!(response.data[0].label, "Acme");

        let err = action
            .autocomplete_field(&runtime(), "owner_id", ExecuteInput::default())
            .await
            .unwrap_err();
        assert_eq!(err.step, "autocomplete");
        assert!(err.to_string().contains("does not support autocomplete"));
    }
}
