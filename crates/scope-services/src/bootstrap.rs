//! Application start hook binding an application context to its scope context.

use scope_protocol::{AppContext, ScopeError};
use serde_json::json;
use tracing::info;

use crate::ContainerBootstrap;

/// Attribute under which the bound scope context is published.
pub const SCOPE_CONTEXT_ATTRIBUTE: &str = "scope.context";

/// Publishes the scope context identity into the application attributes so
/// other components of the application can find it.
#[derive(Debug, Clone)]
pub struct AttributeBootstrap {
    context_id: String,
    context_name: String,
}

impl AttributeBootstrap {
    pub fn new(context_id: impl Into<String>, context_name: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            context_name: context_name.into(),
        }
    }
}

impl ContainerBootstrap for AttributeBootstrap {
    fn initialize(&self, app: &AppContext) -> Result<(), ScopeError> {
        if let Some(existing) = app.attribute(SCOPE_CONTEXT_ATTRIBUTE) {
            if existing["id"] != self.context_id {
                return Err(ScopeError::bootstrap(format!(
                    "Application '{}' is already bound to scope context {}",
                    app.name(),
                    existing["id"]
                )));
            }
            return Ok(());
        }

        app.set_attribute(
            SCOPE_CONTEXT_ATTRIBUTE,
            json!({ "id": self.context_id, "name": self.context_name }),
        );
        info!("Application '{}' bound to scope context {}", app.name(), self.context_name);
        Ok(())
    }
}
