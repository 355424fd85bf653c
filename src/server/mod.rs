//! HTTP protocol layer.
//!
//! ```text
//! POST /destinations/:destination_id
//!   Content-Type: application/cloudevents+json        -> one ack envelope
//!   Content-Type: application/cloudevents-batch+json  -> one ack per event, 201
//!   anything else                                     -> legacy: raw results, 200
//! GET  /health
//! ```
//!
//! The legacy path reads settings from the `X-Settings` header. All paths
//! accept `X-Private-Settings`, a JSON array of setting names to redact from
//! instrumentation.

pub mod cloudevent;
pub mod handlers;

use crate::registry::Registry;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use cloudevent::{CloudEvent, CloudEventResponse, Trace};
pub use handlers::BodyFormat;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/destinations/:destination_id", post(handlers::invoke))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}
