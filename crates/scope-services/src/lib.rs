//! Scope collaborators.
//!
//! The coordinator never manages scopes itself. It drives the collaborators
//! declared here: a [`ScopeService`] that owns scope state, an optional
//! [`FailoverService`], a [`ConversationRegistry`], an [`EventBus`] for
//! lifecycle notifications and a [`ContainerBootstrap`] run once per
//! application. Each trait ships with an in-memory implementation.

pub mod bootstrap;
pub mod contexts;
pub mod conversation;
pub mod events;
pub mod expression;
pub mod failover;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scope_protocol::{AppContext, LifecycleEvent, ScopeError, ScopeKey, ScopeKind, Session};

pub use bootstrap::AttributeBootstrap;
pub use contexts::InMemoryScopeService;
pub use conversation::{Conversation, ConversationScope, InMemoryConversationRegistry};
pub use events::BroadcastEventBus;
pub use failover::{FailoverConfig, InMemoryFailoverService};

/// Zero-argument callback queued on a request scope and run when it ends.
pub type DeferredAction = Box<dyn FnOnce() -> Result<(), ScopeError> + Send>;

/// Snapshot of the request scope active on the calling thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRequestScope {
    /// Describes what the scope was started for (see [`ScopeKey::describe`]).
    pub key: String,
    pub started_at: DateTime<Utc>,
    /// Deferred actions waiting for the scope to end.
    pub pending_actions: usize,
}

/// Owns request and session scope state.
///
/// Request scopes are per thread: start, end and `request_context` act on
/// the calling thread only. Session scopes are shared across threads.
pub trait ScopeService: Send + Sync {
    /// Start a scope. Starting an already active scope is a no-op.
    fn start_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError>;

    /// End a scope. Ending a request scope drains its deferred actions.
    fn end_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError>;

    /// Drop every thread-local this service holds for the calling thread.
    fn remove_thread_locals(&self);

    /// The active request scope. With `create`, one is started when absent.
    fn request_context(&self, create: bool) -> Option<ActiveRequestScope>;

    /// Queue an action on the active request scope.
    fn push_deferred_action(&self, action: DeferredAction) -> Result<(), ScopeError>;
}

/// Session replication and passivation bookkeeping.
pub trait FailoverService: Send + Sync {
    fn is_failover_enabled(&self) -> bool;
    fn is_passivation_enabled(&self) -> bool;
    fn mark_session_idle(&self, session: &Session);
    fn on_session_activated(&self, session: &Session);
}

/// Live state of one conversation.
pub trait ConversationContext: Send + Sync {
    fn destroy(&self) -> Result<(), ScopeError>;
}

/// A conversation handle paired with its context.
pub type ConversationEntry = (Arc<Conversation>, Arc<dyn ConversationContext>);

/// Session id → conversations index.
pub trait ConversationRegistry: Send + Sync {
    fn register(&self, conversation: Arc<Conversation>, context: Arc<dyn ConversationContext>);

    /// Atomically remove and return every conversation of a session.
    fn remove_all_for_session(&self, session_id: &str) -> Vec<ConversationEntry>;

    fn count_for_session(&self, session_id: &str) -> usize;
}

/// Lifecycle notification sink.
pub trait EventBus: Send + Sync {
    fn fire(&self, subject: &str, event: LifecycleEvent) -> Result<(), ScopeError>;
}

/// One-time container bootstrap, run when an application context starts.
pub trait ContainerBootstrap: Send + Sync {
    fn initialize(&self, app: &AppContext) -> Result<(), ScopeError>;
}
