//! In-memory scope service.
//!
//! Request scopes live in a thread-local table keyed by service id, so two
//! services (a parent and a child container) active on the same thread never
//! see each other's scopes. Session scopes are shared across threads in a
//! concurrent map, since a session can end on a thread that never served it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scope_protocol::{LifecycleEvent, ScopeError, ScopeKey, ScopeKind};
use tracing::{debug, warn};

use crate::{ActiveRequestScope, DeferredAction, EventBus, ScopeService};

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SCOPES: RefCell<HashMap<u64, ThreadScopes>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct ThreadScopes {
    request: Option<RequestScope>,
    /// Session whose scope was last started on this thread.
    session: Option<String>,
}

struct RequestScope {
    key: String,
    started_at: DateTime<Utc>,
    deferred: Vec<DeferredAction>,
}

impl RequestScope {
    fn snapshot(&self) -> ActiveRequestScope {
        ActiveRequestScope {
            key: self.key.clone(),
            started_at: self.started_at,
            pending_actions: self.deferred.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionScope {
    started_at: DateTime<Utc>,
}

pub struct InMemoryScopeService {
    id: u64,
    name: String,
    sessions: DashMap<String, SessionScope>,
    events: Option<Arc<dyn EventBus>>,
}

impl InMemoryScopeService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            sessions: DashMap::new(),
            events: None,
        }
    }

    /// Publish request/session initialized and destroyed notifications.
    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// When the session scope was started, if it is active.
    pub fn session_started_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|s| s.started_at)
    }

    /// Session whose scope was last started on the calling thread.
    pub fn current_session(&self) -> Option<String> {
        self.with_thread(|scopes| scopes.and_then(|s| s.session.clone()))
    }

    fn with_thread<R>(&self, f: impl FnOnce(Option<&ThreadScopes>) -> R) -> R {
        THREAD_SCOPES.with(|table| f(table.borrow().get(&self.id)))
    }

    fn with_thread_mut<R>(&self, f: impl FnOnce(&mut ThreadScopes) -> R) -> R {
        THREAD_SCOPES.with(|table| f(table.borrow_mut().entry(self.id).or_default()))
    }

    fn fire(&self, subject: &str, event: LifecycleEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.fire(subject, event) {
                warn!(service = %self.name, error = %e, "Failed to publish {}", event.method());
            }
        }
    }

    fn start_request(&self, key: ScopeKey<'_>) -> ActiveRequestScope {
        let (snapshot, started) = self.with_thread_mut(|scopes| {
            if let Some(existing) = &scopes.request {
                return (existing.snapshot(), false);
            }
            let scope = RequestScope {
                key: key.describe(),
                started_at: Utc::now(),
                deferred: Vec::new(),
            };
            let snapshot = scope.snapshot();
            scopes.request = Some(scope);
            (snapshot, true)
        });

        if started {
            debug!(service = %self.name, key = %snapshot.key, "Request scope started");
            self.fire(&snapshot.key, LifecycleEvent::RequestInitialized);
        } else {
            debug!(service = %self.name, key = %snapshot.key, "Request scope already active");
        }
        snapshot
    }

    fn end_request(&self) -> Result<(), ScopeError> {
        // Take the scope out before running actions so they may touch this
        // service without re-entering the thread-local borrow.
        let Some(scope) = self.with_thread_mut(|scopes| scopes.request.take()) else {
            debug!(service = %self.name, "No request scope to end");
            return Ok(());
        };

        let pending = scope.deferred.len();
        let mut first_error = None;
        for action in scope.deferred {
            if let Err(e) = action() {
                warn!(service = %self.name, error = %e, "Deferred action failed");
                first_error.get_or_insert(e);
            }
        }

        debug!(service = %self.name, key = %scope.key, pending, "Request scope ended");
        self.fire(&scope.key, LifecycleEvent::RequestDestroyed);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn start_session(&self, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        let session_id = key
            .session_id()
            .ok_or_else(|| ScopeError::invalid_state(format!("Session scope keyed by {}", key.describe())))?;

        let mut inserted = false;
        self.sessions.entry(session_id.to_string()).or_insert_with(|| {
            inserted = true;
            SessionScope { started_at: Utc::now() }
        });
        self.with_thread_mut(|scopes| scopes.session = Some(session_id.to_string()));

        if inserted {
            debug!(service = %self.name, session_id, "Session scope started");
            self.fire(session_id, LifecycleEvent::SessionInitialized);
        }
        Ok(())
    }

    fn end_session(&self, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        let session_id = key
            .session_id()
            .ok_or_else(|| ScopeError::invalid_state(format!("Session scope keyed by {}", key.describe())))?;

        self.with_thread_mut(|scopes| {
            if scopes.session.as_deref() == Some(session_id) {
                scopes.session = None;
            }
        });

        if self.sessions.remove(session_id).is_some() {
            debug!(service = %self.name, session_id, "Session scope ended");
            self.fire(session_id, LifecycleEvent::SessionDestroyed);
        } else {
            debug!(service = %self.name, session_id, "Session scope already ended");
        }
        Ok(())
    }
}

impl ScopeService for InMemoryScopeService {
    fn start_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        match kind {
            ScopeKind::Request => {
                self.start_request(key);
                Ok(())
            }
            ScopeKind::Session => self.start_session(key),
        }
    }

    fn end_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        match kind {
            ScopeKind::Request => self.end_request(),
            ScopeKind::Session => self.end_session(key),
        }
    }

    fn remove_thread_locals(&self) {
        let removed = THREAD_SCOPES.with(|table| table.borrow_mut().remove(&self.id));
        if let Some(scopes) = removed {
            if let Some(request) = scopes.request {
                if !request.deferred.is_empty() {
                    warn!(
                        service = %self.name,
                        key = %request.key,
                        dropped = request.deferred.len(),
                        "Dropping deferred actions of a request scope that never ended"
                    );
                }
            }
        }
    }

    fn request_context(&self, create: bool) -> Option<ActiveRequestScope> {
        let active = self.with_thread(|scopes| {
            scopes.and_then(|s| s.request.as_ref()).map(RequestScope::snapshot)
        });
        match active {
            Some(scope) => Some(scope),
            None if create => Some(self.start_request(ScopeKey::Detached)),
            None => None,
        }
    }

    fn push_deferred_action(&self, action: DeferredAction) -> Result<(), ScopeError> {
        self.with_thread_mut(|scopes| match scopes.request.as_mut() {
            Some(scope) => {
                scope.deferred.push(action);
                Ok(())
            }
            None => Err(ScopeError::invalid_state("No active request scope on this thread")),
        })
    }
}

impl std::fmt::Debug for InMemoryScopeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryScopeService")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
