//! Synthetic requests.
//!
//! Some host events (passivation, application start) run teardown or
//! bootstrap code that expects a request scope, on threads that are not
//! serving a request. The coordinator fabricates a request for them and
//! remembers it per thread until a session end or application stop releases
//! it.

use std::cell::RefCell;
use std::collections::HashSet;

use scope_protocol::ScopeError;
use tracing::{debug, warn};

use crate::coordinator::ScopeLifecycleCoordinator;
use crate::listener::LifecycleListener;

thread_local! {
    /// Request keys of coordinators holding a synthetic request on this thread.
    static SYNTHETIC: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
}

impl ScopeLifecycleCoordinator {
    /// Start a synthetic request unless a request scope is already active.
    /// Returns whether one was fabricated.
    pub fn ensure_request_scope(&self) -> Result<bool, ScopeError> {
        if self.context().scopes().request_context(false).is_some() {
            return Ok(false);
        }

        if let Err(e) = self.request_initialized(None) {
            // Nothing will release a synthetic request that failed to start.
            if let Err(rollback) = self.request_destroyed(None) {
                warn!(
                    code = %rollback.code,
                    context = self.context().name(),
                    error = %rollback,
                    "Failed to roll back synthetic request"
                );
            }
            return Err(e);
        }

        SYNTHETIC.with(|s| s.borrow_mut().insert(self.request_key().as_str().to_string()));
        debug!(context = self.context().name(), "Synthetic request started");
        Ok(true)
    }

    /// End the synthetic request fabricated on this thread, if any.
    /// Returns whether one was released.
    pub fn release_synthetic_request(&self) -> Result<bool, ScopeError> {
        let fabricated = SYNTHETIC.with(|s| s.borrow_mut().remove(self.request_key().as_str()));
        if !fabricated {
            return Ok(false);
        }

        debug!(context = self.context().name(), "Releasing synthetic request");
        self.request_destroyed(None)?;
        Ok(true)
    }

    pub fn has_synthetic_request(&self) -> bool {
        SYNTHETIC.with(|s| s.borrow().contains(self.request_key().as_str()))
    }
}
