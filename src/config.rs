//! Configuration module for Relay.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! max_body_bytes = 1048576
//!
//! [http]
//! request_timeout_ms = 10000
//! auth_timeout_ms = 3000
//!
//! [[destinations]]
//! id = "${PIPEDRIVE_DESTINATION_ID}"
//! slug = "pipedrive"
//! ```

use crate::cache::Cache;
use crate::destinations;
use crate::registry::Registry;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub http: HttpConfig,

    /// Destination id -> slug aliases
    #[serde(default)]
    pub destinations: Vec<DestinationAlias>,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Outbound HTTP configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_auth_timeout_ms() -> u64 {
    3000
}

/// Maps an opaque destination id to a registered slug
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DestinationAlias {
    pub id: String,
    pub slug: String,
}

impl RelayConfig {
    /// Build the destination registry from the configuration.
    ///
    /// Registers the built-in destinations with the configured timeouts and
    /// then the id aliases.
    pub fn build_registry(&self, cache: Arc<dyn Cache>) -> Registry {
        let mut registry = Registry::new(cache);

        for destination in destinations::builtin(&self.http) {
            registry.register(destination);
        }

        for alias in &self.destinations {
            // Skip aliases with unsubstituted env vars
            if alias.id.contains("${") {
                warn!(
                    slug = %alias.slug,
                    "Skipping destination alias with unsubstituted id: {}",
                    alias.id
                );
                continue;
            }
            registry.alias(&alias.id, &alias.slug);
        }

        registry
    }

    /// Load configuration from the default path or RELAY_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("RELAY_CONFIG").unwrap_or_else(|_| "config/relay.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: RelayConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            port = config.server.port,
            aliases = config.destinations.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_body_bytes must be greater than zero".into(),
            ));
        }

        if self.http.request_timeout_ms == 0 || self.http.auth_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "http timeouts must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for alias in &self.destinations {
            if alias.id.is_empty() || alias.slug.is_empty() {
                return Err(ConfigError::ValidationError(
                    "destination aliases need both 'id' and 'slug'".into(),
                ));
            }

            if !seen.insert(alias.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Destination id '{}' is aliased more than once",
                    alias.id
                )));
            }

            // Check for unsubstituted env vars
            if alias.id.contains("${") {
                warn!(
                    slug = %alias.slug,
                    id = %alias.id,
                    "Destination id contains unsubstituted environment variable"
                );
            }
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
