//! Scope Server — binds scope contexts to the host's request and session
//! lifecycle.
//!
//! The server owns the per-application coordinators, the thread binding they
//! share and the deployment registry, and provides the `LifecycleListener`
//! implementation the host calls into.

pub mod binding;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod listener;
pub mod registry;
pub mod synthetic;

pub use binding::ThreadBinding;
pub use config::{CoordinatorConfig, FailoverConfig};
pub use context::ScopeContext;
pub use coordinator::{RequestKey, ScopeLifecycleCoordinator, destroy_conversations};
pub use listener::LifecycleListener;
pub use registry::DeploymentRegistry;
