//! CloudEvent request and acknowledgement envelopes.
//!
//! Requests arrive as `application/cloudevents+json` (one envelope) or
//! `application/cloudevents-batch+json` (an array). Every request envelope
//! gets exactly one acknowledgement of type `com.segment.event.ack`.

use crate::action::{Exchange, StepResult};
use crate::error::DestinationError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Instant;

pub const SINGLE_RESPONSE_CONTENT_TYPE: &str = "application/cloudevent+json; charset=utf-8";
pub const BATCH_RESPONSE_CONTENT_TYPE: &str = "application/cloudevents-batch+json; charset=utf-8";

pub const SPEC_VERSION: &str = "1.0";
pub const ACK_TYPE: &str = "com.segment.event.ack";

/// Every failed envelope carries this error type, whatever the cause.
pub const ERROR_TYPE: &str = "MESSAGE_REJECTED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default = "generate_id")]
    pub id: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub destination: String,

    #[serde(default = "default_spec_version")]
    pub specversion: String,

    #[serde(rename = "type", default)]
    pub event_type: String,

    /// The analytics event.
    #[serde(default)]
    pub data: Value,

    /// Destination settings, subscriptions included.
    #[serde(default)]
    pub settings: Value,
}

impl CloudEvent {
    /// The identifying fields of an envelope that could not be decoded.
    /// Fields that are missing or not strings fall back to their defaults.
    pub fn identity(raw: &Value) -> Self {
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            id: text("id").unwrap_or_else(generate_id),
            source: text("source").unwrap_or_default(),
            destination: text("destination").unwrap_or_default(),
            specversion: default_spec_version(),
            event_type: text("type").unwrap_or_default(),
            data: Value::Null,
            settings: Value::Null,
        }
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

/// Wall-clock timing for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub name: String,
    pub start: String,
    /// Milliseconds.
    pub duration: u64,
}

/// Started when a request is received, read when its envelope is built.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn trace(&self) -> Trace {
        Trace {
            name: "invoke".into(),
            start: iso_time(self.started_at),
            duration: self.started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloudEventResponse {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub specversion: String,

    #[serde(rename = "type")]
    pub event_type: String,

    pub time: String,
    pub status: u16,
    pub data: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Trace>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub errortype: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub errormessage: Option<String>,
}

impl CloudEventResponse {
    fn base(event: &CloudEvent, status: u16, data: Value, timer: &Timer) -> Self {
        Self {
            id: event.id.clone(),
            source: event.source.clone(),
            destination: event.destination.clone(),
            specversion: SPEC_VERSION.to_string(),
            event_type: ACK_TYPE.to_string(),
            time: iso_time(Utc::now()),
            status,
            data,
            trace: Some(timer.trace()),
            errortype: None,
            errormessage: None,
        }
    }

    /// A single result is unwrapped so `data.results` mirrors a single
    /// request.
    pub fn success(
        event: &CloudEvent,
        mut results: Vec<StepResult>,
        exchanges: &[Exchange],
        timer: &Timer,
    ) -> Self {
        let results = if results.len() == 1 {
            json!(results.remove(0))
        } else {
            json!(results)
        };

        let mut data = Map::new();
        data.insert("results".into(), results);
        data.extend(tester_data(exchanges));

        Self::base(event, 201, Value::Object(data), timer)
    }

    pub fn failure(
        event: &CloudEvent,
        error: &DestinationError,
        exchanges: &[Exchange],
        timer: &Timer,
    ) -> Self {
        let status = error.status().as_u16();
        let message = error.to_string();

        let mut data = Map::new();
        data.insert("status".into(), json!(status));
        data.insert("name".into(), json!(error.name()));
        data.insert("message".into(), json!(message));
        data.extend(tester_data(exchanges));

        let mut response = Self::base(event, status, Value::Object(data), timer);
        response.errortype = Some(ERROR_TYPE.to_string());
        response.errormessage = Some(message);
        response
    }

    pub fn is_success(&self) -> bool {
        self.errortype.is_none()
    }
}

/// The exchange log in the three shapes the event tester reads.
fn tester_data(exchanges: &[Exchange]) -> Map<String, Value> {
    let requests: Vec<Value> = exchanges.iter().map(|e| json!(e.request)).collect();
    let responses: Vec<Value> = exchanges
        .iter()
        .filter_map(|e| e.response.as_ref())
        .map(|r| json!(r))
        .collect();

    let mut data = Map::new();
    data.insert("debugRequests".into(), json!(exchanges));
    data.insert("requestsToDestination".into(), Value::Array(requests));
    data.insert("responseFromDestination".into(), Value::Array(responses));
    data
}

fn iso_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}
