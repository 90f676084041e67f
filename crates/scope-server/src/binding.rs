//! Thread binding — the scope context current on each worker thread.
//!
//! Worker threads are pooled by the host, so a binding left behind by one
//! request is observed by the next request served on the same thread. Every
//! `enter` must be paired with a `restore` of the value it returned.

use std::cell::RefCell;
use std::sync::Arc;

use scope_services::ScopeService;
use tracing::trace;

use crate::context::ScopeContext;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ScopeContext>>> = const { RefCell::new(None) };
}

/// Capability to read and swap the calling thread's current scope context.
///
/// The slot itself is process-wide and thread-local; holders of this handle
/// never own the bound context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadBinding;

impl ThreadBinding {
    pub fn new() -> Self {
        Self
    }

    /// Bind `context` to the calling thread, returning the previous binding.
    pub fn enter(&self, context: Option<Arc<ScopeContext>>) -> Option<Arc<ScopeContext>> {
        trace!(context = ?context.as_ref().map(|c| c.name().to_string()), "Entering scope context");
        CURRENT.with(|slot| slot.replace(context))
    }

    /// Put back a binding previously returned by [`ThreadBinding::enter`].
    pub fn restore(&self, previous: Option<Arc<ScopeContext>>) {
        // Drop whatever was current outside of the slot borrow.
        let _replaced = self.enter(previous);
    }

    pub fn current(&self) -> Option<Arc<ScopeContext>> {
        CURRENT.with(|slot| slot.borrow().clone())
    }

    /// Whether `context` is the calling thread's current binding.
    pub fn is_current(&self, context: &ScopeContext) -> bool {
        CURRENT.with(|slot| slot.borrow().as_deref().is_some_and(|c| c.same_as(context)))
    }
}

/// Request-end cleanup guard.
///
/// On drop, removes the thread-locals of every scope service in the
/// context lineage and restores the stashed binding. Dropping also happens
/// while unwinding, so the cleanup runs whatever happened to the request-end
/// steps before it.
pub(crate) struct RequestCleanup {
    binding: ThreadBinding,
    scopes: Vec<Arc<dyn ScopeService>>,
    previous: Option<Arc<ScopeContext>>,
}

impl RequestCleanup {
    pub(crate) fn new(
        binding: ThreadBinding,
        scopes: Vec<Arc<dyn ScopeService>>,
        previous: Option<Arc<ScopeContext>>,
    ) -> Self {
        Self {
            binding,
            scopes,
            previous,
        }
    }
}

impl Drop for RequestCleanup {
    fn drop(&mut self) {
        for scopes in &self.scopes {
            scopes.remove_thread_locals();
        }
        self.binding.restore(self.previous.take());
    }
}
