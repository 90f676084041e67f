//! Conversations — long-lived scopes spanning several requests of a session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use scope_protocol::ScopeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{ConversationContext, ConversationEntry, ConversationRegistry};

/// Conversation handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    id: String,
    session_id: String,
    started_at: DateTime<Utc>,
}

impl Conversation {
    /// Begin a conversation with a generated id.
    pub fn begin(session_id: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), session_id)
    }

    pub fn with_id(id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Bean storage for one conversation.
#[derive(Debug, Default)]
pub struct ConversationScope {
    beans: RwLock<HashMap<String, Value>>,
    destroyed: AtomicBool,
}

impl ConversationScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, bean: Value) -> Result<(), ScopeError> {
        if self.is_destroyed() {
            return Err(ScopeError::invalid_state("Conversation scope already destroyed"));
        }
        self.beans.write().insert(name.into(), bean);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.beans.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.beans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.read().is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

impl ConversationContext for ConversationScope {
    fn destroy(&self) -> Result<(), ScopeError> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let released = {
            let mut beans = self.beans.write();
            let count = beans.len();
            beans.clear();
            count
        };
        debug!(released, "Conversation scope destroyed");
        Ok(())
    }
}

/// Conversation registry backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryConversationRegistry {
    by_session: DashMap<String, Vec<ConversationEntry>>,
}

impl InMemoryConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with at least one conversation.
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }
}

impl ConversationRegistry for InMemoryConversationRegistry {
    fn register(&self, conversation: Arc<Conversation>, context: Arc<dyn ConversationContext>) {
        let session_id = conversation.session_id().to_string();
        debug!(conversation_id = conversation.id(), session_id = %session_id, "Conversation registered");
        self.by_session.entry(session_id).or_default().push((conversation, context));
    }

    fn remove_all_for_session(&self, session_id: &str) -> Vec<ConversationEntry> {
        self.by_session
            .remove(session_id)
            .map(|(_, entries)| entries)
            .unwrap_or_default()
    }

    fn count_for_session(&self, session_id: &str) -> usize {
        self.by_session.get(session_id).map(|e| e.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryConversationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryConversationRegistry")
            .field("sessions", &self.by_session.len())
            .finish()
    }
}
