//! Destinations that ship with the server.

pub mod webhook;

use crate::config::HttpConfig;
use crate::destination::Destination;
use tracing::error;

/// Every built-in destination, configured with `http` timeouts.
pub fn builtin(http: &HttpConfig) -> Vec<Destination> {
    let mut destinations = Vec::new();

    match webhook::destination(http) {
        Ok(destination) => destinations.push(destination),
        Err(e) => error!(destination = webhook::SLUG, error = %e, "Failed to build destination"),
    }

    destinations
}
