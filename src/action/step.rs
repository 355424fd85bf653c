//! Pipeline steps and their results.

use super::{ActionRuntime, ExecuteInput, Perform, StepError};
use crate::cache::qualified_key;
use crate::event::FieldPath;
use crate::mapping::{self, MappingSpec};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Output of one step. `error` is the marker a result carries when it was
/// recorded by a caller as failed; the pipeline itself fails fast instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StepResult {
    pub fn output(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
        }
    }

    /// Sentinel for a subscription whose filter did not match.
    pub fn not_subscribed() -> Self {
        Self::output("not subscribed")
    }
}

/// Derives the cache key from the invocation; `None` skips the cache.
pub type KeyFn = Arc<dyn Fn(&ExecuteInput) -> Option<String> + Send + Sync>;

/// Look a value up in the cache, computing and storing it on a miss.
/// The value lands in `cached_fields[field]` either way.
pub struct CachedRequest {
    pub field: String,
    pub ttl: Duration,
    pub key: KeyFn,
    pub value: Arc<dyn Perform>,
}

impl CachedRequest {
    pub fn new<K>(field: impl Into<String>, ttl: Duration, key: K, value: impl Perform + 'static) -> Self
    where
        K: Fn(&ExecuteInput) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            field: field.into(),
            ttl,
            key: Arc::new(key),
            value: Arc::new(value),
        }
    }

    async fn run(
        &self,
        runtime: &ActionRuntime,
        action: &str,
        input: &mut ExecuteInput,
    ) -> Result<StepResult, StepError> {
        if input.cached_fields.contains_key(&self.field) {
            return Err(StepError::CachedFieldConflict(self.field.clone()));
        }

        let key = (self.key)(input)
            .map(|key| qualified_key(&runtime.destination, action, &self.field, &key));

        if let Some(key) = &key {
            if let Some(hit) = runtime.cache.get(key) {
                debug!(key = %key, "Cache hit");
                input.cached_fields.insert(self.field.clone(), hit);
                return Ok(StepResult::output("Cache hit"));
            }
        }

        let value = self
            .value
            .perform(runtime.client(input), input.clone())
            .await?;

        if let Some(key) = &key {
            debug!(key = %key, ttl_secs = self.ttl.as_secs(), "Cache miss, storing value");
            runtime.cache.set(key, value.clone(), self.ttl);
        }
        input.cached_fields.insert(self.field.clone(), value);

        Ok(StepResult::output("Cache miss"))
    }
}

pub enum Step {
    Validate(Schema),
    MapField { target: FieldPath, spec: MappingSpec },
    Cached(CachedRequest),
    Request(Arc<dyn Perform>),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Validate(_) => "validate",
            Step::MapField { .. } => "map-field",
            Step::Cached(_) => "cached-request",
            Step::Request(_) => "request",
        }
    }

    pub(crate) async fn run(
        &self,
        runtime: &ActionRuntime,
        action: &str,
        input: &mut ExecuteInput,
    ) -> Result<StepResult, StepError> {
        match self {
            Step::Validate(schema) => {
                schema.validate("payload", &input.payload)?;
                Ok(StepResult::output("Payload validated"))
            }
            Step::MapField { target, spec } => {
                match mapping::resolve(spec, &input.payload)? {
                    Some(value) => {
                        target.set(&mut input.payload, value);
                    }
                    None => {
                        target.remove(&mut input.payload);
                    }
                }
                Ok(StepResult::output(format!("Mapped {}", target)))
            }
            Step::Cached(cached) => cached.run(runtime, action, input).await,
            Step::Request(perform) => {
                let client = runtime.client(input);
                let output = perform.perform(client, input.clone()).await?;
                Ok(StepResult::output(output))
            }
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Validate(schema) => f.debug_tuple("Validate").field(schema).finish(),
            Step::MapField { target, spec } => f
                .debug_struct("MapField")
                .field("target", target)
                .field("spec", spec)
                .finish(),
            Step::Cached(cached) => f
                .debug_struct("Cached")
                .field("field", &cached.field)
                .field("ttl", &cached.ttl)
                .finish(),
            Step::Request(_) => f.write_str("Request"),
        }
    }
}
