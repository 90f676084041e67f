//! Lifecycle notification names and payloads.
//!
//! Notifications are fire-and-forget messages published when a scope is
//! initialized or destroyed. Observers subscribe to these for cleanup hooks
//! and bookkeeping.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// All lifecycle notification names, grouped by scope.
pub struct Notifications;

impl Notifications {
    // ── Request ─────────────────────────────────────────────────────────
    pub const REQUEST_INITIALIZED: &str = "request/initialized";
    pub const REQUEST_DESTROYED: &str = "request/destroyed";

    // ── Session ─────────────────────────────────────────────────────────
    pub const SESSION_INITIALIZED: &str = "session/initialized";
    pub const SESSION_DESTROYED: &str = "session/destroyed";

    // ── Conversation ────────────────────────────────────────────────────
    pub const CONVERSATION_DESTROYED: &str = "conversation/destroyed";
}

/// Lifecycle event qualifier fired on the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    RequestInitialized,
    RequestDestroyed,
    SessionInitialized,
    SessionDestroyed,
    ConversationDestroyed,
}

impl LifecycleEvent {
    pub fn method(&self) -> &'static str {
        match self {
            Self::RequestInitialized => Notifications::REQUEST_INITIALIZED,
            Self::RequestDestroyed => Notifications::REQUEST_DESTROYED,
            Self::SessionInitialized => Notifications::SESSION_INITIALIZED,
            Self::SessionDestroyed => Notifications::SESSION_DESTROYED,
            Self::ConversationDestroyed => Notifications::CONVERSATION_DESTROYED,
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            Notifications::REQUEST_INITIALIZED => Some(Self::RequestInitialized),
            Notifications::REQUEST_DESTROYED => Some(Self::RequestDestroyed),
            Notifications::SESSION_INITIALIZED => Some(Self::SessionInitialized),
            Notifications::SESSION_DESTROYED => Some(Self::SessionDestroyed),
            Notifications::CONVERSATION_DESTROYED => Some(Self::ConversationDestroyed),
            _ => None,
        }
    }
}

/// A published lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleNotification {
    pub method: String,
    /// Identifier of the object the event is about (conversation id,
    /// session id or request key).
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl LifecycleNotification {
    pub fn new(event: LifecycleEvent, subject: impl Into<String>) -> Self {
        Self {
            method: event.method().into(),
            subject: subject.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn event(&self) -> Option<LifecycleEvent> {
        LifecycleEvent::from_method(&self.method)
    }

    /// JSON form used by log sinks.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "method": self.method,
            "subject": self.subject,
            "params": self.params,
        })
    }
}
