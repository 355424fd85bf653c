//! Destinations: named bundles of actions.
//!
//! [`Destination::on_event`] is the entry point for delivery. It normalises
//! the subscriptions carried in the raw settings, evaluates every filter and
//! runs the matching actions concurrently.
//!
//! ## Failure policy
//!
//! All subscriptions of an event run to completion, then the results are
//! reassembled in declaration order. If any of them failed, the whole call
//! fails with the first error in that order and no partial results are
//! returned; the caller is expected to redeliver the event.
//!
//! ```rust,ignore
//! let destination = Destination::new("Pipedrive")
//!     .validate_settings(Schema::compile(settings_schema)?)
//!     .extend_request(|input: &ExecuteInput| {
//!         RequestOptions::new()
//!             .prefix_url(format!("https://{}.pipedrive.com/api/v1/", input.setting_str("domain")))
//!             .query("api_token", input.setting_str("apiToken"))
//!     })
//!     .api_key_auth(|client: RequestClient, _input: ExecuteInput| async move {
//!         Ok(client.get("users/me").send().await?.body)
//!     })
//!     .partner_action(create_update_person()?);
//!
//! let results = destination.on_event(&event, &settings, &InvocationContext::new()).await?;
//! ```

use crate::action::{
    Action, ActionDefinition, ActionRuntime, AutocompleteResponse, ExchangeLog, ExecuteInput,
    Perform, RequestExtension, RequestOptions, StepResult,
};
use crate::cache::{Cache, MemoryCache};
use crate::error::DestinationError;
use crate::event::Event;
use crate::filter::Filter;
use crate::schema::{Schema, SchemaError};
use crate::settings::{self, Subscription};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Bounded timeout for credential checks.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(3000);

/// Instrumentation for one completed subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionStats {
    pub duration: Duration,
    pub destination: String,
    pub action: String,
    /// Final input state with private settings redacted.
    pub input: ExecuteInput,
    pub output: Vec<StepResult>,
}

pub type Observer = Arc<dyn Fn(&SubscriptionStats) + Send + Sync>;

/// Per-call options for [`Destination::on_event`].
#[derive(Clone, Default)]
pub struct InvocationContext {
    private_settings: Vec<String>,
    observer: Option<Observer>,
    exchanges: ExchangeLog,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of settings to redact from instrumentation.
    pub fn with_private_settings(mut self, fields: Vec<String>) -> Self {
        self.private_settings = fields;
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&SubscriptionStats) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn private_settings(&self) -> &[String] {
        &self.private_settings
    }

    /// Every HTTP exchange made while handling this call.
    pub fn exchanges(&self) -> &ExchangeLog {
        &self.exchanges
    }
}

pub struct Destination {
    name: String,
    slug: String,
    actions: HashMap<String, Arc<Action>>,
    settings_schema: Option<Schema>,
    extensions: Vec<RequestExtension>,
    authentication: Option<Arc<dyn Perform>>,
    cache: Arc<dyn Cache>,
    http: reqwest::Client,
    request_timeout: Option<Duration>,
    auth_timeout: Duration,
}

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let slug = slugify(&name);
        Self {
            name,
            slug,
            actions: HashMap::new(),
            settings_schema: None,
            extensions: Vec::new(),
            authentication: None,
            cache: Arc::new(MemoryCache::new()),
            http: reqwest::Client::new(),
            request_timeout: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = slug.into();
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Timeout applied to every action request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn validate_settings(mut self, schema: Schema) -> Self {
        self.settings_schema = Some(schema);
        self
    }

    /// Add request options derived from each invocation. Applies to every
    /// action and to the credential test.
    pub fn extend_request<F>(mut self, extension: F) -> Self
    where
        F: Fn(&ExecuteInput) -> RequestOptions + Send + Sync + 'static,
    {
        self.extensions.push(Arc::new(extension));
        self
    }

    /// Configure the credential test.
    pub fn api_key_auth(mut self, test: impl Perform + 'static) -> Self {
        self.authentication = Some(Arc::new(test));
        self
    }

    pub fn partner_action(mut self, action: Action) -> Self {
        debug!(destination = %self.name, action = %action.slug(), "Registered action");
        self.actions.insert(action.slug().to_string(), Arc::new(action));
        self
    }

    pub fn partner_action_definition(
        self,
        slug: &str,
        definition: ActionDefinition,
    ) -> Result<Self, SchemaError> {
        let action = Action::from_definition(slug, definition)?;
        Ok(self.partner_action(action))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn action(&self, slug: &str) -> Option<&Action> {
        self.actions.get(slug).map(Arc::as_ref)
    }

    pub fn action_slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    pub fn settings_schema(&self) -> Option<&Schema> {
        self.settings_schema.as_ref()
    }

    fn runtime(&self, exchanges: ExchangeLog, base_options: RequestOptions) -> ActionRuntime {
        ActionRuntime {
            destination: self.slug.clone(),
            cache: self.cache.clone(),
            http: self.http.clone(),
            base_options,
            extensions: Arc::new(self.extensions.clone()),
            exchanges,
        }
    }

    fn action_options(&self) -> RequestOptions {
        match self.request_timeout {
            Some(timeout) => RequestOptions::new().timeout(timeout),
            None => RequestOptions::new(),
        }
    }

    /// Deliver one event to every subscribed action.
    pub async fn on_event(
        &self,
        event: &Event,
        raw_settings: &Value,
        ctx: &InvocationContext,
    ) -> Result<Vec<StepResult>, DestinationError> {
        let subscriptions = settings::parse_subscriptions(raw_settings)?;
        let destination_settings = settings::destination_settings(raw_settings);

        // Unknown actions and malformed filters fail the whole call before
        // anything runs.
        let mut bound = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let action = self
                .actions
                .get(&subscription.partner_action)
                .cloned()
                .ok_or_else(|| DestinationError::UnknownAction(subscription.partner_action.clone()))?;
            let filter = subscription.subscribe.clone().compile()?;
            bound.push((subscription, filter, action));
        }

        debug!(
            destination = %self.name,
            subscriptions = bound.len(),
            "Dispatching event"
        );

        let runs = bound.iter().map(|(subscription, filter, action)| {
            self.on_subscription(subscription, filter, action, event, &destination_settings, ctx)
        });
        let outcomes = join_all(runs).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.extend(outcome?);
        }
        Ok(results)
    }

    async fn on_subscription(
        &self,
        subscription: &Subscription,
        filter: &Filter,
        action: &Action,
        event: &Event,
        destination_settings: &Value,
        ctx: &InvocationContext,
    ) -> Result<Vec<StepResult>, DestinationError> {
        if !filter.matches(event)? {
            return Ok(vec![StepResult::not_subscribed()]);
        }

        let span = info_span!("subscription", destination = %self.name, action = %action.slug());

        async move {
            let started = Instant::now();
            let runtime = self.runtime(ctx.exchanges.clone(), self.action_options());
            let mut input = ExecuteInput::new(
                event.clone(),
                subscription.mapping.clone(),
                destination_settings.clone(),
            );

            let results = match action.execute(&runtime, &mut input).await {
                Ok(results) => results,
                Err(source) => {
                    error!(step = source.step, error = %source.source, "Action failed");
                    return Err(DestinationError::Action {
                        action: action.slug().to_string(),
                        source,
                    });
                }
            };

            let duration = started.elapsed();
            info!(duration_ms = duration.as_millis() as u64, "Action delivered");

            if let Some(observer) = &ctx.observer {
                input.settings = settings::redact(&input.settings, &ctx.private_settings);
                observer(&SubscriptionStats {
                    duration,
                    destination: self.name.clone(),
                    action: action.slug().to_string(),
                    input,
                    output: results.clone(),
                });
            }

            Ok(results)
        }
        .instrument(span)
        .await
    }

    /// Check the configured credentials. Settings-schema violations are
    /// reported as such; anything that goes wrong while talking to the
    /// destination becomes [`DestinationError::InvalidCredentials`].
    pub async fn test_authentication(&self, raw_settings: &Value) -> Result<(), DestinationError> {
        let destination_settings = settings::destination_settings(raw_settings);

        if let Some(schema) = &self.settings_schema {
            schema.validate("settings", &destination_settings)?;
        }

        let Some(test) = &self.authentication else {
            return Ok(());
        };

        let input = ExecuteInput::from_settings(destination_settings);
        let runtime = self.runtime(
            ExchangeLog::new(),
            RequestOptions::new().timeout(self.auth_timeout),
        );
        let client = runtime.client(&input);

        match test.perform(client, input).await {
            Ok(_) => {
                info!(destination = %self.name, "Credentials verified");
                Ok(())
            }
            Err(e) => {
                warn!(destination = %self.name, error = %e, "Credential test failed");
                Err(DestinationError::InvalidCredentials)
            }
        }
    }

    /// Suggestions for one field of an action.
    pub async fn autocomplete(
        &self,
        action_slug: &str,
        field: &str,
        raw_settings: &Value,
        payload: Value,
        page: Option<String>,
    ) -> Result<AutocompleteResponse, DestinationError> {
        let action = self
            .actions
            .get(action_slug)
            .ok_or_else(|| DestinationError::UnknownAction(action_slug.to_string()))?;

        let input = ExecuteInput::from_settings(settings::destination_settings(raw_settings))
            .with_payload(payload)
            .with_page(page);
        let runtime = self.runtime(ExchangeLog::new(), self.action_options());

        action
            .autocomplete_field(&runtime, field, input)
            .await
            .map_err(|source| DestinationError::Action {
                action: action_slug.to_string(),
                source,
            })
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("slug", &self.slug)
            .field("actions", &self.action_slugs())
            .finish()
    }
}

/// "Customer.io Actions" -> "customer-io-actions"
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
