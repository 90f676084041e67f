//! Coordinator configuration.

use std::path::Path;

use scope_protocol::ScopeError;
use serde::{Deserialize, Serialize};

pub use scope_services::FailoverConfig;

/// Default prefix of the request attribute that stashes the previous binding.
pub const DEFAULT_REQUEST_KEY_PREFIX: &str = "scope.coordinator.binding@";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// Prefix of the request attribute key; the scope context id is appended.
    pub request_key_prefix: String,
    pub failover: FailoverConfig,
    /// Publish the scope context into the application attributes on start.
    pub bootstrap: bool,
    /// Capacity of the lifecycle notification channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            request_key_prefix: DEFAULT_REQUEST_KEY_PREFIX.into(),
            failover: FailoverConfig::default(),
            bootstrap: true,
            event_capacity: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ScopeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScopeError::config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&content)
            .map_err(|e| ScopeError::config(format!("{}: {}", path.display(), e.message)))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ScopeError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ScopeError::config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if self.request_key_prefix.is_empty() {
            return Err(ScopeError::config("requestKeyPrefix must not be empty"));
        }
        if self.event_capacity == 0 {
            return Err(ScopeError::config("eventCapacity must be at least 1"));
        }
        Ok(())
    }
}
