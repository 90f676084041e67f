//! Scope context — one isolated scope registry and its collaborators.

use std::sync::Arc;

use scope_services::{
    AttributeBootstrap, BroadcastEventBus, ContainerBootstrap, ConversationRegistry, EventBus,
    FailoverService, InMemoryConversationRegistry, InMemoryFailoverService, InMemoryScopeService,
    ScopeService,
};

use crate::config::CoordinatorConfig;

/// Scope context a coordinator binds to.
///
/// A context may have a parent (the application-wide container of a
/// deployed module). Parent scopes start before and end after the child's.
pub struct ScopeContext {
    id: String,
    name: String,
    parent: Option<Arc<ScopeContext>>,
    scopes: Arc<dyn ScopeService>,
    conversations: Arc<dyn ConversationRegistry>,
    events: Arc<dyn EventBus>,
    failover: Option<Arc<dyn FailoverService>>,
    bootstrap: Option<Arc<dyn ContainerBootstrap>>,
}

impl ScopeContext {
    pub fn new(
        name: impl Into<String>,
        scopes: Arc<dyn ScopeService>,
        conversations: Arc<dyn ConversationRegistry>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            parent: None,
            scopes,
            conversations,
            events,
            failover: None,
            bootstrap: None,
        }
    }

    /// Build a context backed by the in-memory collaborators.
    pub fn in_memory(
        name: impl Into<String>,
        config: &CoordinatorConfig,
        events: Arc<BroadcastEventBus>,
    ) -> Self {
        let name = name.into();
        let scopes = InMemoryScopeService::new(name.clone()).with_events(events.clone());
        let mut context = Self::new(
            name,
            Arc::new(scopes),
            Arc::new(InMemoryConversationRegistry::new()),
            events,
        );

        if config.failover.is_active() {
            context.failover = Some(Arc::new(InMemoryFailoverService::new(config.failover.clone())));
        }
        if config.bootstrap {
            context.bootstrap = Some(Arc::new(AttributeBootstrap::new(
                context.id.clone(),
                context.name.clone(),
            )));
        }
        context
    }

    pub fn with_parent(mut self, parent: Arc<ScopeContext>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_failover(mut self, failover: Arc<dyn FailoverService>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn ContainerBootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ScopeContext>> {
        self.parent.as_ref()
    }

    /// Ancestors, nearest first.
    pub fn ancestors(&self) -> Vec<Arc<ScopeContext>> {
        let mut ancestors = Vec::new();
        let mut next = self.parent.clone();
        while let Some(parent) = next {
            next = parent.parent.clone();
            ancestors.push(parent);
        }
        ancestors
    }

    pub fn scopes(&self) -> &Arc<dyn ScopeService> {
        &self.scopes
    }

    pub fn conversations(&self) -> &Arc<dyn ConversationRegistry> {
        &self.conversations
    }

    pub fn events(&self) -> &Arc<dyn EventBus> {
        &self.events
    }

    pub fn failover(&self) -> Option<&Arc<dyn FailoverService>> {
        self.failover.as_ref()
    }

    pub fn bootstrap(&self) -> Option<&Arc<dyn ContainerBootstrap>> {
        self.bootstrap.as_ref()
    }

    /// Identity comparison (two handles to the same context).
    pub fn same_as(&self, other: &ScopeContext) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for ScopeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent", &self.parent.as_ref().map(|p| p.name().to_string()))
            .field("failover", &self.failover.is_some())
            .field("bootstrap", &self.bootstrap.is_some())
            .finish()
    }
}
