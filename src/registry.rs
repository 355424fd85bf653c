//! Destination lookup by id or slug.
//!
//! Destinations are registered under their slug. Opaque ids (as sent by the
//! upstream pipeline) are mapped to slugs through aliases, so both
//! `/destinations/5f7dd6d21ad74f3842b1fc47` and `/destinations/pipedrive`
//! reach the same destination.

use crate::cache::Cache;
use crate::destination::Destination;
use crate::error::DestinationError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Registry {
    destinations: HashMap<String, Arc<Destination>>,
    aliases: HashMap<String, String>,
    cache: Arc<dyn Cache>,
}

impl Registry {
    /// Every destination registered here shares `cache`.
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            destinations: HashMap::new(),
            aliases: HashMap::new(),
            cache,
        }
    }

    pub fn register(&mut self, destination: Destination) {
        let destination = destination.with_cache(self.cache.clone());
        info!(
            destination = %destination.name(),
            slug = %destination.slug(),
            actions = ?destination.action_slugs(),
            "Registered destination"
        );
        self.destinations
            .insert(destination.slug().to_string(), Arc::new(destination));
    }

    /// Make `id` resolve to the destination registered as `slug`.
    pub fn alias(&mut self, id: impl Into<String>, slug: impl Into<String>) {
        let (id, slug) = (id.into(), slug.into());
        if !self.destinations.contains_key(&slug) {
            warn!(id = %id, slug = %slug, "Alias points to an unregistered destination");
        }
        self.aliases.insert(id, slug);
    }

    pub fn get(&self, id_or_slug: &str) -> Result<Arc<Destination>, DestinationError> {
        let slug = self
            .aliases
            .get(id_or_slug)
            .map(String::as_str)
            .unwrap_or(id_or_slug);

        self.destinations
            .get(slug)
            .cloned()
            .ok_or_else(|| DestinationError::DestinationNotFound(id_or_slug.to_string()))
    }

    pub fn list(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.destinations.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    pub fn cache(&self) -> Arc<dyn Cache> {
        self.cache.clone()
    }
}
