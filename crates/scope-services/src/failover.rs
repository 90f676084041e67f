//! Failover bookkeeping: idle and activation tracking for replicated sessions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use scope_protocol::Session;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::FailoverService;

/// Failover and passivation switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverConfig {
    /// Track session idleness for replication.
    pub enabled: bool,
    /// Support passivating sessions to a secondary store.
    pub passivation: bool,
}

impl FailoverConfig {
    pub fn is_active(&self) -> bool {
        self.enabled || self.passivation
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFailoverService {
    config: FailoverConfig,
    idle: DashMap<String, DateTime<Utc>>,
    activations: DashMap<String, u32>,
}

impl InMemoryFailoverService {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            idle: DashMap::new(),
            activations: DashMap::new(),
        }
    }

    /// When the session was last marked idle.
    pub fn idle_since(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.idle.get(session_id).map(|t| *t)
    }

    pub fn idle_sessions(&self) -> usize {
        self.idle.len()
    }

    /// How many times the session was reactivated.
    pub fn activations(&self, session_id: &str) -> u32 {
        self.activations.get(session_id).map(|c| *c).unwrap_or(0)
    }
}

impl FailoverService for InMemoryFailoverService {
    fn is_failover_enabled(&self) -> bool {
        self.config.enabled
    }

    fn is_passivation_enabled(&self) -> bool {
        self.config.passivation
    }

    fn mark_session_idle(&self, session: &Session) {
        debug!(session_id = session.id(), "Session idle");
        self.idle.insert(session.id().to_string(), Utc::now());
    }

    fn on_session_activated(&self, session: &Session) {
        debug!(session_id = session.id(), "Session activated");
        self.idle.remove(session.id());
        *self.activations.entry(session.id().to_string()).or_insert(0) += 1;
    }
}
