use super::cloudevent::{
    CloudEvent, CloudEventResponse, Timer, BATCH_RESPONSE_CONTENT_TYPE,
    SINGLE_RESPONSE_CONTENT_TYPE,
};
use super::AppState;
use crate::destination::InvocationContext;
use crate::error::DestinationError;
use crate::event::Event;
use crate::registry::Registry;
use crate::settings;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub const SETTINGS_HEADER: &str = "x-settings";
pub const PRIVATE_SETTINGS_HEADER: &str = "x-private-settings";

/// Request body format, chosen by content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Legacy,
    CloudEvent,
    CloudEventBatch,
}

impl BodyFormat {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return BodyFormat::Legacy;
        };

        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/cloudevents-batch+json" => BodyFormat::CloudEventBatch,
            "application/cloudevents+json" => BodyFormat::CloudEvent,
            _ => BodyFormat::Legacy,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "destinations": state.registry.list(),
    }))
}

/// `POST /destinations/:destination_id`
pub async fn invoke(
    State(state): State<AppState>,
    Path(destination_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timer = Timer::start();
    let format = BodyFormat::from_headers(&headers);
    debug!(destination = %destination_id, format = ?format, "Received invocation");

    let result = match format {
        BodyFormat::Legacy => handle_legacy(&state.registry, &destination_id, &headers, &body).await,
        BodyFormat::CloudEvent => {
            handle_cloudevent(&state.registry, &destination_id, &headers, &body, timer).await
        }
        BodyFormat::CloudEventBatch => {
            handle_batch(&state.registry, &destination_id, &headers, &body, timer).await
        }
    };

    result.unwrap_or_else(|err| {
        warn!(destination = %destination_id, error = %err, "Invocation rejected");
        err.into_response()
    })
}

async fn handle_legacy(
    registry: &Registry,
    destination_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, DestinationError> {
    let destination = registry.get(destination_id)?;
    let settings: Value = json_header(headers, SETTINGS_HEADER, "settings")?
        .unwrap_or_else(|| json!({}));
    let ctx = InvocationContext::new().with_private_settings(private_settings(headers)?);
    let event: Event = parse_body(body)?;

    let results = destination.on_event(&event, &settings, &ctx).await?;

    info!(
        destination = %destination.slug(),
        results = results.len(),
        "Event delivered"
    );
    Ok((StatusCode::OK, Json(results)).into_response())
}

async fn handle_cloudevent(
    registry: &Registry,
    destination_id: &str,
    headers: &HeaderMap,
    body: &[u8],
    timer: Timer,
) -> Result<Response, DestinationError> {
    let private = private_settings(headers)?;
    let raw: Value = parse_body(body)?;
    if !raw.is_object() {
        return Err(not_an_envelope());
    }

    let response = process_raw(registry, destination_id, raw, &private, timer).await;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    Ok((
        status,
        [(header::CONTENT_TYPE, SINGLE_RESPONSE_CONTENT_TYPE)],
        Json(response),
    )
        .into_response())
}

/// Every event gets its own envelope; one failure never affects the rest,
/// including an element that does not decode.
async fn handle_batch(
    registry: &Registry,
    destination_id: &str,
    headers: &HeaderMap,
    body: &[u8],
    timer: Timer,
) -> Result<Response, DestinationError> {
    let private = private_settings(headers)?;
    let events: Vec<Value> = parse_body(body)?;

    let responses = join_all(
        events
            .into_iter()
            .map(|raw| process_raw(registry, destination_id, raw, &private, timer)),
    )
    .await;

    let failed = responses.iter().filter(|r| !r.is_success()).count();
    info!(
        destination = %destination_id,
        events = responses.len(),
        failed,
        "Batch processed"
    );

    Ok((
        StatusCode::CREATED,
        [(header::CONTENT_TYPE, BATCH_RESPONSE_CONTENT_TYPE)],
        Json(responses),
    )
        .into_response())
}

async fn process_raw(
    registry: &Registry,
    destination_id: &str,
    raw: Value,
    private: &[String],
    timer: Timer,
) -> CloudEventResponse {
    match decode_cloudevent(&raw) {
        Ok(event) => process_cloudevent(registry, destination_id, &event, private, timer).await,
        Err(err) => {
            let event = CloudEvent::identity(&raw);
            warn!(id = %event.id, error = %err, "CloudEvent rejected");
            CloudEventResponse::failure(&event, &err, &[], &timer)
        }
    }
}

fn decode_cloudevent(raw: &Value) -> Result<CloudEvent, DestinationError> {
    if !raw.is_object() {
        return Err(not_an_envelope());
    }
    CloudEvent::deserialize(raw).map_err(|e| DestinationError::InvalidBody(e.to_string()))
}

fn not_an_envelope() -> DestinationError {
    DestinationError::InvalidBody("a CloudEvent must be a JSON object".into())
}

async fn process_cloudevent(
    registry: &Registry,
    destination_id: &str,
    event: &CloudEvent,
    private: &[String],
    timer: Timer,
) -> CloudEventResponse {
    let ctx = InvocationContext::new().with_private_settings(private.to_vec());

    let outcome = match registry.get(destination_id) {
        Ok(destination) => destination.on_event(&event.data, &event.settings, &ctx).await,
        Err(err) => Err(err),
    };
    let exchanges = ctx.exchanges().snapshot();

    match outcome {
        Ok(results) => {
            debug!(id = %event.id, results = results.len(), "CloudEvent delivered");
            CloudEventResponse::success(event, results, &exchanges, &timer)
        }
        Err(err) => {
            warn!(id = %event.id, error = %err, "CloudEvent rejected");
            CloudEventResponse::failure(event, &err, &exchanges, &timer)
        }
    }
}

fn json_header<T: DeserializeOwned>(
    headers: &HeaderMap,
    name: &str,
    label: &str,
) -> Result<Option<T>, DestinationError> {
    let Some(raw) = headers.get(name) else {
        return Ok(None);
    };

    let invalid = |reason: String| DestinationError::InvalidHeader {
        header: label.to_string(),
        reason,
    };

    let text = raw.to_str().map_err(|e| invalid(e.to_string()))?;
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| invalid(e.to_string()))
}

fn private_settings(headers: &HeaderMap) -> Result<Vec<String>, DestinationError> {
    let raw: Option<Value> = json_header(headers, PRIVATE_SETTINGS_HEADER, "private-settings")?;
    Ok(raw.as_ref().map(settings::private_fields).unwrap_or_default())
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, DestinationError> {
    serde_json::from_slice(body).map_err(|e| DestinationError::InvalidBody(e.to_string()))
}
