//! Host-facing lifecycle listener contract.
//!
//! The host calls these from the thread the event happens on. Every handler
//! runs to completion before the host proceeds. `request_initialized` and
//! `request_destroyed` are paired per request; the host may pass `None` when
//! it has no event object.

use scope_protocol::{AppEvent, RequestEvent, ScopeError, SessionEvent};

pub trait LifecycleListener: Send + Sync {
    fn request_initialized(&self, event: Option<&RequestEvent>) -> Result<(), ScopeError>;

    fn request_destroyed(&self, event: Option<&RequestEvent>) -> Result<(), ScopeError>;

    fn session_created(&self, event: &SessionEvent) -> Result<(), ScopeError>;

    fn session_destroyed(&self, event: &SessionEvent) -> Result<(), ScopeError>;

    fn session_will_passivate(&self, _event: &SessionEvent) -> Result<(), ScopeError> {
        Ok(())
    }

    fn session_did_activate(&self, _event: &SessionEvent) {}

    fn context_initialized(&self, _event: &AppEvent) -> Result<(), ScopeError> {
        Ok(())
    }

    fn context_destroyed(&self, _event: &AppEvent) -> Result<(), ScopeError> {
        Ok(())
    }

    /// Listener name for logging.
    fn name(&self) -> &str;
}
