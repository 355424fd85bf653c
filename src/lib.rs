//! # Relay
//!
//! A destination execution engine: routes analytics events to the
//! destination actions that subscribe to them.
//!
//! ## Architecture
//!
//! ```text
//! HTTP (legacy | CloudEvent | batch) -> Registry -> Destination::on_event
//!     -> subscriptions (filter) -> Action pipeline (map, validate, cache, request)
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Events and path expressions over them
//! - [`filter`]: Subscription expressions
//! - [`mapping`]: Mapping resolver (`@path`, `@timestamp`, `@template`, `@literal`)
//! - [`cache`]: TTL cache shared by cached steps
//! - [`schema`]: JSON Schema validation
//! - [`settings`]: Subscription normalisation and redaction
//! - [`action`]: Actions, step pipeline and the request client
//! - [`destination`]: Destinations and event delivery
//! - [`registry`]: Destination lookup by id or slug
//! - [`server`]: HTTP protocol layer
//! - [`destinations`]: Built-in destinations
//! - [`config`]: TOML configuration
//! - [`error`]: Request-level errors and their HTTP mapping

pub mod action;
pub mod cache;
pub mod config;
pub mod destination;
pub mod destinations;
pub mod error;
pub mod event;
pub mod filter;
pub mod mapping;
pub mod registry;
pub mod schema;
pub mod server;
pub mod settings;

// Re-export commonly used types at crate root
pub use action::{Action, ActionDefinition, ExecuteInput, RequestClient, StepError, StepResult};
pub use cache::{Cache, MemoryCache};
pub use config::RelayConfig;
pub use destination::{Destination, InvocationContext};
pub use error::DestinationError;
pub use event::Event;
pub use filter::Filter;
pub use registry::Registry;
pub use schema::Schema;
