//! Scope protocol types.
//!
//! The single source of truth for the host object model (requests, sessions,
//! application contexts and their events), scope kinds, lifecycle
//! notification names and error codes shared by the coordinator and its
//! collaborators.

pub mod error;
pub mod host;
pub mod notifications;
pub mod scope;

pub use error::{ScopeError, ScopeErrorCode};
pub use host::{AppContext, AppEvent, Request, RequestEvent, Session, SessionEvent};
pub use notifications::{LifecycleEvent, LifecycleNotification, Notifications};
pub use scope::{ScopeKey, ScopeKind};
