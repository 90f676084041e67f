//! Host object model — the request, session and application objects a host
//! hands to lifecycle listeners.
//!
//! The host owns these objects; listeners only read them and stash
//! attributes on them. Interior mutability lets a host share one request or
//! session across the listener chain behind an `Arc`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

/// Type-erased request attribute value.
pub type Attribute = Arc<dyn Any + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// A host session.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_accessed: RwLock<DateTime<Utc>>,
    valid: AtomicBool,
    attributes: RwLock<HashMap<String, Value>>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_accessed: RwLock::new(now),
            valid: AtomicBool::new(true),
            attributes: RwLock::new(HashMap::new()),
        }
    }

    /// Create a session with a random identifier.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        *self.last_accessed.read()
    }

    pub fn touch(&self) {
        *self.last_accessed.write() = Utc::now();
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the session invalid. Attributes are dropped.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        self.attributes.write().clear();
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.write().insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request
// ─────────────────────────────────────────────────────────────────────────────

/// A host request. Sessions are attached lazily through [`Request::session`].
pub struct Request {
    id: String,
    remote_addr: String,
    attributes: RwLock<HashMap<String, Attribute>>,
    session: RwLock<Option<Arc<Session>>>,
}

impl Request {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr: remote_addr.into(),
            attributes: RwLock::new(HashMap::new()),
            session: RwLock::new(None),
        }
    }

    /// Attach an existing session (e.g. one resolved from a cookie).
    pub fn with_session(self, session: Arc<Session>) -> Self {
        *self.session.write() = Some(session);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.attributes.write().insert(key.into(), Arc::new(value));
    }

    /// Typed attribute lookup. Returns `None` when absent or of another type.
    pub fn attribute<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        let attributes = self.attributes.read();
        attributes.get(key)?.downcast_ref::<T>().cloned()
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.read().contains_key(key)
    }

    pub fn remove_attribute(&self, key: &str) -> bool {
        self.attributes.write().remove(key).is_some()
    }

    /// The session bound to this request. With `create` a new session is
    /// generated when none exists or the existing one was invalidated.
    pub fn session(&self, create: bool) -> Option<Arc<Session>> {
        {
            let session = self.session.read();
            if let Some(s) = session.as_ref() {
                if s.is_valid() {
                    return Some(s.clone());
                }
            }
        }

        if !create {
            return None;
        }

        let session = Arc::new(Session::generate());
        *self.session.write() = Some(session.clone());
        Some(session)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attributes = self.attributes.read();
        let mut keys: Vec<&String> = attributes.keys().collect();
        keys.sort();
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("attributes", &keys)
            .field("session", &self.session.read().as_ref().map(|s| s.id().to_string()))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Application context
// ─────────────────────────────────────────────────────────────────────────────

/// Container-wide context for one deployed application.
#[derive(Debug)]
pub struct AppContext {
    name: String,
    attributes: RwLock<HashMap<String, Value>>,
}

impl AppContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attributes.write().insert(key.into(), value);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.read().get(key).cloned()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.write().remove(key)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// Request lifecycle event.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    request: Arc<Request>,
}

impl RequestEvent {
    pub fn new(request: Arc<Request>) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }
}

/// Session lifecycle event.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    session: Arc<Session>,
}

impl SessionEvent {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// Application (container-wide) lifecycle event.
#[derive(Debug, Clone)]
pub struct AppEvent {
    app: Arc<AppContext>,
}

impl AppEvent {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.app
    }
}
