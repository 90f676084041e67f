//! Scope lifecycle coordinator.
//!
//! Keeps the request and session scopes of one [`ScopeContext`] (and its
//! ancestors) in step with the host's request and session lifecycle:
//!
//! - request start binds the context to the worker thread and starts the
//!   request scopes, ancestors first;
//! - request end ends them, own scope first, then always clears the scope
//!   services' thread-locals and restores the thread's previous binding;
//! - session end destroys the session's conversations, immediately or, when
//!   a request scope is active on the thread, once that request ends.

use std::sync::Arc;

use scope_protocol::{
    AppEvent, LifecycleEvent, Request, RequestEvent, ScopeError, ScopeErrorCode, ScopeKey,
    ScopeKind, Session, SessionEvent,
};
use scope_services::{ConversationRegistry, EventBus, ScopeService, expression};
use tracing::{debug, error, trace, warn};

use crate::binding::{RequestCleanup, ThreadBinding};
use crate::config::CoordinatorConfig;
use crate::context::ScopeContext;
use crate::listener::LifecycleListener;

/// Request attribute key under which the coordinator stashes the binding it
/// replaced. Unique per bound scope context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn for_context(prefix: &str, context: &ScopeContext) -> Self {
        Self(format!("{prefix}{}", context.id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binding that was current when a request started.
#[derive(Clone)]
struct StashedBinding(Option<Arc<ScopeContext>>);

pub struct ScopeLifecycleCoordinator {
    context: Arc<ScopeContext>,
    binding: ThreadBinding,
    request_key: RequestKey,
}

impl ScopeLifecycleCoordinator {
    pub fn new(context: Arc<ScopeContext>) -> Self {
        Self::with_config(context, &CoordinatorConfig::default())
    }

    pub fn with_config(context: Arc<ScopeContext>, config: &CoordinatorConfig) -> Self {
        let request_key = RequestKey::for_context(&config.request_key_prefix, &context);
        Self {
            context,
            binding: ThreadBinding::new(),
            request_key,
        }
    }

    pub fn with_binding(mut self, binding: ThreadBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn context(&self) -> &Arc<ScopeContext> {
        &self.context
    }

    pub fn request_key(&self) -> &RequestKey {
        &self.request_key
    }

    pub fn binding(&self) -> ThreadBinding {
        self.binding
    }

    /// Scope services of the bound context, own service first.
    fn lineage_scopes(&self) -> Vec<Arc<dyn ScopeService>> {
        std::iter::once(self.context.scopes().clone())
            .chain(self.context.ancestors().iter().map(|a| a.scopes().clone()))
            .collect()
    }

    fn start_scopes(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        for ancestor in self.context.ancestors().iter().rev() {
            ancestor.scopes().start_scope(kind, key)?;
        }
        self.context.scopes().start_scope(kind, key)
    }

    /// End own scope, then the ancestors' nearest first. Every scope is
    /// ended; the first failure is returned.
    fn end_scopes(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        let own = self.context.scopes().end_scope(kind, key);
        own.and(self.end_ancestor_scopes(kind, key))
    }

    fn end_ancestor_scopes(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        let mut first_error = None;
        for ancestor in self.context.ancestors() {
            if let Err(e) = ancestor.scopes().end_scope(kind, key) {
                warn!(context = ancestor.name(), scope = %kind, error = %e, "Failed to end ancestor scope");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn end_request(&self, request: Option<&Request>) -> Result<(), ScopeError> {
        if let (Some(request), Some(failover)) = (request, self.context.failover()) {
            if failover.is_failover_enabled() {
                if let Some(session) = request.session(false) {
                    failover.mark_session_idle(&session);
                }
            }
        }

        if let Some(released) = expression::release_thread_store() {
            trace!(released, "Expression cache released");
        }

        self.end_scopes(ScopeKind::Request, ScopeKey::from_request(request))
    }

    fn end_session(&self, session: &Session) -> Result<(), ScopeError> {
        let key = ScopeKey::Session(session);
        let scopes = self.context.scopes();

        // The scope service expects the session scope to be current on this
        // thread before it can be torn down.
        scopes.start_scope(ScopeKind::Session, key)?;

        // Ancestors end before conversation cleanup, own scope after it.
        let ancestors = self.end_ancestor_scopes(ScopeKind::Session, key);

        // The session may be unusable once this handler returns.
        let session_id = session.id().to_string();

        let conversations = if scopes.request_context(false).is_some() {
            let registry = self.context.conversations().clone();
            let events = self.context.events().clone();
            let deferred_id = session_id.clone();
            let pushed = scopes.push_deferred_action(Box::new(move || {
                destroy_conversations(registry.as_ref(), events.as_ref(), &deferred_id).map(|_| ())
            }));
            if pushed.is_ok() {
                debug!(session_id = %session_id, "Conversation cleanup deferred to request end");
            }
            pushed
        } else {
            destroy_conversations(
                self.context.conversations().as_ref(),
                self.context.events().as_ref(),
                &session_id,
            )
            .map(|_| ())
        };

        // Own scope is ended even when conversation cleanup failed.
        let ended = scopes.end_scope(ScopeKind::Session, key);
        ancestors.and(conversations).and(ended)
    }
}

/// Remove every conversation of `session_id` from the registry, destroy
/// each context and fire `ConversationDestroyed` with the conversation id.
///
/// A failing conversation does not stop the others; the first failure is
/// returned after all were attempted. Returns the number destroyed.
pub fn destroy_conversations(
    registry: &dyn ConversationRegistry,
    events: &dyn EventBus,
    session_id: &str,
) -> Result<usize, ScopeError> {
    let entries = registry.remove_all_for_session(session_id);
    if entries.is_empty() {
        return Ok(0);
    }

    let mut destroyed = 0;
    let mut first_error = None;
    for (conversation, context) in entries {
        let outcome = context
            .destroy()
            .and_then(|()| events.fire(conversation.id(), LifecycleEvent::ConversationDestroyed));
        match outcome {
            Ok(()) => destroyed += 1,
            Err(e) => {
                error!(
                    code = %ScopeErrorCode::ConversationDestroy,
                    conversation_id = conversation.id(),
                    session_id,
                    error = %e,
                    "Failed to destroy conversation"
                );
                first_error.get_or_insert(e);
            }
        }
    }

    debug!(session_id, destroyed, "Conversations destroyed");
    match first_error {
        Some(e) => Err(ScopeError::conversation_destroy(format!(
            "Failed to destroy conversations of session {session_id}"
        ))
        .caused_by(e)),
        None => Ok(destroyed),
    }
}

impl LifecycleListener for ScopeLifecycleCoordinator {
    fn request_initialized(&self, event: Option<&RequestEvent>) -> Result<(), ScopeError> {
        let request = event.map(|e| e.request().as_ref());

        let previous = self.binding.enter(Some(self.context.clone()));
        // Without an event the previous binding cannot be stashed; the
        // matching request end then restores an empty binding.
        if let Some(request) = request {
            request.set_attribute(self.request_key.as_str(), StashedBinding(previous));
        }

        debug!(
            context = self.context.name(),
            remote_addr = request.map_or("null", |r| r.remote_addr()),
            "Starting a new request"
        );

        // Sessions are not touched here; they are created lazily on first use.
        self.start_scopes(ScopeKind::Request, ScopeKey::from_request(request))
            .map_err(|e| {
                error!(
                    code = %ScopeErrorCode::RequestStart,
                    context = self.context.name(),
                    request = request.map_or("null", |r| r.id()),
                    error = %e,
                    "Failed to start request scope"
                );
                ScopeError::request_start(format!(
                    "Failed to start request scope of {}",
                    self.context.name()
                ))
                .caused_by(e)
            })
    }

    fn request_destroyed(&self, event: Option<&RequestEvent>) -> Result<(), ScopeError> {
        let request = event.map(|e| e.request().as_ref());

        debug!(
            context = self.context.name(),
            remote_addr = request.map_or("null", |r| r.remote_addr()),
            "Destroying a request"
        );

        let previous = request
            .and_then(|r| r.attribute::<StashedBinding>(self.request_key.as_str()))
            .and_then(|stashed| stashed.0);
        let _cleanup = RequestCleanup::new(self.binding, self.lineage_scopes(), previous);

        self.end_request(request).map_err(|e| {
            warn!(
                code = %ScopeErrorCode::RequestEnd,
                context = self.context.name(),
                error = %e,
                "Failed to end request scope"
            );
            ScopeError::request_end(format!("Failed to end request scope of {}", self.context.name()))
                .caused_by(e)
        })
    }

    fn session_created(&self, event: &SessionEvent) -> Result<(), ScopeError> {
        let session = event.session();
        debug!(session_id = session.id(), "Starting a session");

        self.start_scopes(ScopeKind::Session, ScopeKey::Session(session))
            .map_err(|e| {
                error!(
                    code = %ScopeErrorCode::SessionStart,
                    session_id = session.id(),
                    error = %e,
                    "Failed to start session scope"
                );
                ScopeError::session_start(format!("Failed to start session scope {}", session.id()))
                    .caused_by(e)
            })
    }

    fn session_destroyed(&self, event: &SessionEvent) -> Result<(), ScopeError> {
        let session = event.session();
        debug!(session_id = session.id(), "Destroying a session");

        let result = self.end_session(session).map_err(|e| {
            if e.code == ScopeErrorCode::ConversationDestroy {
                return e;
            }
            error!(
                code = %ScopeErrorCode::SessionEnd,
                session_id = session.id(),
                error = %e,
                "Failed to end session scope"
            );
            ScopeError::session_end(format!("Failed to end session scope {}", session.id())).caused_by(e)
        });

        if let Err(e) = self.release_synthetic_request() {
            warn!(code = %e.code, error = %e, "Failed to release synthetic request");
        }

        result
    }

    fn session_will_passivate(&self, event: &SessionEvent) -> Result<(), ScopeError> {
        trace!(session_id = event.session().id(), "Session will passivate");
        self.ensure_request_scope().map(|_| ())
    }

    fn session_did_activate(&self, event: &SessionEvent) {
        if let Some(failover) = self.context.failover() {
            if failover.is_failover_enabled() || failover.is_passivation_enabled() {
                failover.on_session_activated(event.session());
            }
        }
    }

    fn context_initialized(&self, event: &AppEvent) -> Result<(), ScopeError> {
        if let Some(bootstrap) = self.context.bootstrap() {
            if let Err(e) = bootstrap.initialize(event.app()) {
                warn!(
                    code = %e.code,
                    app = event.app().name(),
                    error = %e,
                    "Container bootstrap failed"
                );
            }
        }
        self.ensure_request_scope().map(|_| ())
    }

    fn context_destroyed(&self, event: &AppEvent) -> Result<(), ScopeError> {
        trace!(app = event.app().name(), "Application context destroyed");
        self.release_synthetic_request().map(|_| ())
    }

    fn name(&self) -> &str {
        self.context.name()
    }
}

impl std::fmt::Debug for ScopeLifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeLifecycleCoordinator")
            .field("context", &self.context)
            .field("request_key", &self.request_key)
            .finish()
    }
}
