//! Deployed applications, each a child scope context with its own coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use scope_protocol::{AppContext, AppEvent, ScopeError};
use scope_services::BroadcastEventBus;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::context::ScopeContext;
use crate::coordinator::ScopeLifecycleCoordinator;
use crate::listener::LifecycleListener;

/// A deployed application and how many deploys still reference it.
struct DeploymentEntry {
    coordinator: Arc<ScopeLifecycleCoordinator>,
    app: Arc<AppContext>,
    refcount: usize,
}

/// Deploys applications as child scope contexts of one shared
/// application-wide context.
///
/// Deploying a name that is already deployed reuses it and bumps its
/// refcount. The application is started (`context_initialized`) on first
/// deploy and stopped (`context_destroyed`) when the last reference is
/// undeployed. Both run on the calling thread, outside the lock, and deploy
/// leaves no request scope behind on that thread.
pub struct DeploymentRegistry {
    config: CoordinatorConfig,
    events: Arc<BroadcastEventBus>,
    parent: Arc<ScopeContext>,
    deployments: RwLock<HashMap<String, DeploymentEntry>>,
}

impl DeploymentRegistry {
    pub fn new(config: CoordinatorConfig) -> Self {
        let events = Arc::new(BroadcastEventBus::new(config.event_capacity));
        let parent_config = CoordinatorConfig {
            bootstrap: false,
            ..config.clone()
        };
        let parent = Arc::new(ScopeContext::in_memory("application", &parent_config, events.clone()));

        Self {
            config,
            events,
            parent,
            deployments: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<BroadcastEventBus> {
        &self.events
    }

    /// The application-wide context every deployment is a child of.
    pub fn parent(&self) -> &Arc<ScopeContext> {
        &self.parent
    }

    /// Deploy an application, returning its coordinator.
    pub fn deploy(&self, name: &str) -> Result<Arc<ScopeLifecycleCoordinator>, ScopeError> {
        {
            let mut deployments = self.deployments.write();
            if let Some(entry) = deployments.get_mut(name) {
                entry.refcount += 1;
                info!("Deployment reused: {} (refcount: {})", name, entry.refcount);
                return Ok(entry.coordinator.clone());
            }
        }

        let context = ScopeContext::in_memory(name, &self.config, self.events.clone())
            .with_parent(self.parent.clone());
        let coordinator = Arc::new(ScopeLifecycleCoordinator::with_config(Arc::new(context), &self.config));
        let app = Arc::new(AppContext::new(name));

        coordinator.context_initialized(&AppEvent::new(app.clone()))?;
        // The start-up request only has to outlive the bootstrap. Releasing it
        // here keeps it off this thread whichever thread later undeploys.
        if let Err(e) = coordinator.release_synthetic_request() {
            warn!(code = %e.code, app = name, error = %e, "Failed to release start-up request");
        }

        let mut deployments = self.deployments.write();
        if let Some(entry) = deployments.get_mut(name) {
            // Lost a race with a concurrent deploy of the same name.
            entry.refcount += 1;
            let winner = entry.coordinator.clone();
            drop(deployments);
            if let Err(e) = coordinator.context_destroyed(&AppEvent::new(app)) {
                warn!("Failed to stop duplicate deployment {}: {}", name, e);
            }
            return Ok(winner);
        }

        deployments.insert(
            name.to_string(),
            DeploymentEntry {
                coordinator: coordinator.clone(),
                app,
                refcount: 1,
            },
        );
        info!("Deployed: {} (context: {})", name, coordinator.context().id());
        Ok(coordinator)
    }

    /// Undeploy one reference; stops the application when it reaches 0.
    pub fn undeploy(&self, name: &str) -> Result<(), ScopeError> {
        let to_stop = {
            let mut deployments = self.deployments.write();
            let Some(entry) = deployments.get_mut(name) else {
                return Err(ScopeError::invalid_state(format!("Application '{name}' is not deployed")));
            };
            entry.refcount -= 1;
            if entry.refcount == 0 {
                deployments.remove(name)
            } else {
                info!("Deployment refcount decremented: {} (refcount: {})", name, entry.refcount);
                None
            }
        };

        if let Some(entry) = to_stop {
            entry.coordinator.context_destroyed(&AppEvent::new(entry.app))?;
            info!("Undeployed: {}", name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ScopeLifecycleCoordinator>> {
        self.deployments.read().get(name).map(|e| e.coordinator.clone())
    }

    pub fn app(&self, name: &str) -> Option<Arc<AppContext>> {
        self.deployments.read().get(name).map(|e| e.app.clone())
    }

    /// Deployed application names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.deployments.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every deployment regardless of refcount.
    pub fn shutdown_all(&self) {
        let entries: Vec<_> = {
            let mut deployments = self.deployments.write();
            deployments.drain().collect()
        };

        for (name, entry) in entries {
            info!("Stopping deployment: {}", name);
            if let Err(e) = entry.coordinator.context_destroyed(&AppEvent::new(entry.app)) {
                warn!("Failed to stop {}: {}", name, e);
            }
        }
    }
}
