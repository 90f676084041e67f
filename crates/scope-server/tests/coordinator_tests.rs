//! Coordinator tests — thread binding, scope ordering across a context
//! lineage, deferred conversation cleanup, synthetic requests, config and
//! the deployment registry.
//!
//! Every `#[test]` runs on its own thread, so thread-locals start clean.

use std::sync::Arc;

use parking_lot::Mutex;
use scope_protocol::{
    AppContext, AppEvent, LifecycleEvent, Request, RequestEvent, ScopeError, ScopeErrorCode,
    ScopeKey, ScopeKind, Session, SessionEvent,
};
use scope_server::{
    CoordinatorConfig, DeploymentRegistry, LifecycleListener, ScopeContext,
    ScopeLifecycleCoordinator, ThreadBinding,
};
use scope_services::{
    ActiveRequestScope, BroadcastEventBus, ContainerBootstrap, Conversation, ConversationContext,
    ConversationRegistry, ConversationScope, DeferredAction, FailoverConfig,
    InMemoryConversationRegistry, InMemoryFailoverService, InMemoryScopeService, ScopeService,
    expression,
};
use serde_json::json;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    request_start: bool,
    request_end: bool,
}

/// Scope service that records every start, end and cleanup into a journal
/// shared by the whole lineage.
struct Journaled {
    label: &'static str,
    inner: InMemoryScopeService,
    journal: Journal,
    faults: Faults,
}

impl Journaled {
    fn record(&self, entry: impl std::fmt::Display) {
        self.journal.lock().push(format!("{} {}", self.label, entry));
    }
}

impl ScopeService for Journaled {
    fn start_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        self.record(format_args!("start {kind}"));
        if kind == ScopeKind::Request && self.faults.request_start {
            return Err(ScopeError::service("request start refused"));
        }
        self.inner.start_scope(kind, key)
    }

    fn end_scope(&self, kind: ScopeKind, key: ScopeKey<'_>) -> Result<(), ScopeError> {
        self.record(format_args!("end {kind}"));
        if kind == ScopeKind::Request && self.faults.request_end {
            return Err(ScopeError::service("request end refused"));
        }
        self.inner.end_scope(kind, key)
    }

    fn remove_thread_locals(&self) {
        self.record("cleanup");
        self.inner.remove_thread_locals();
    }

    fn request_context(&self, create: bool) -> Option<ActiveRequestScope> {
        self.inner.request_context(create)
    }

    fn push_deferred_action(&self, action: DeferredAction) -> Result<(), ScopeError> {
        self.inner.push_deferred_action(action)
    }
}

struct Fixture {
    journal: Journal,
    scopes: Arc<Journaled>,
    conversations: Arc<InMemoryConversationRegistry>,
    events: Arc<BroadcastEventBus>,
    context: Arc<ScopeContext>,
}

impl Fixture {
    fn new(label: &'static str) -> Self {
        Self::build(label, Journal::default(), Faults::default(), |c| c)
    }

    fn build(
        label: &'static str,
        journal: Journal,
        faults: Faults,
        customize: impl FnOnce(ScopeContext) -> ScopeContext,
    ) -> Self {
        let scopes = Arc::new(Journaled {
            label,
            inner: InMemoryScopeService::new(label),
            journal: journal.clone(),
            faults,
        });
        let conversations = Arc::new(InMemoryConversationRegistry::new());
        let events = Arc::new(BroadcastEventBus::new(64));
        let context = ScopeContext::new(label, scopes.clone(), conversations.clone(), events.clone());

        Self {
            journal,
            scopes,
            conversations,
            events,
            context: Arc::new(customize(context)),
        }
    }

    fn coordinator(&self) -> ScopeLifecycleCoordinator {
        ScopeLifecycleCoordinator::new(self.context.clone())
    }

    /// Drain the journal.
    fn entries(&self) -> Vec<String> {
        std::mem::take(&mut *self.journal.lock())
    }
}

fn request_for(session: Option<&Arc<Session>>) -> RequestEvent {
    let request = Request::new("10.0.0.1");
    let request = match session {
        Some(session) => request.with_session(session.clone()),
        None => request,
    };
    RequestEvent::new(Arc::new(request))
}

fn session_event(session: &Arc<Session>) -> SessionEvent {
    SessionEvent::new(session.clone())
}

/// Conversation context whose teardown always fails.
struct Stuck;

impl ConversationContext for Stuck {
    fn destroy(&self) -> Result<(), ScopeError> {
        Err(ScopeError::service("conversation stuck"))
    }
}

/// Conversation context that records its teardown into a journal.
struct JournaledConversation {
    journal: Journal,
}

impl ConversationContext for JournaledConversation {
    fn destroy(&self) -> Result<(), ScopeError> {
        self.journal.lock().push("conversation destroyed".into());
        Ok(())
    }
}

struct Refusing;

impl ContainerBootstrap for Refusing {
    fn initialize(&self, _app: &AppContext) -> Result<(), ScopeError> {
        Err(ScopeError::bootstrap("container refused to start"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread binding
// ─────────────────────────────────────────────────────────────────────────────

mod binding {
    use super::*;

    #[test]
    fn request_without_prior_binding_restores_none() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();

        let event = request_for(Some(&session));
        coordinator.request_initialized(Some(&event)).unwrap();
        assert!(coordinator.binding().is_current(&fx.context));

        coordinator.request_destroyed(Some(&event)).unwrap();
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn request_restores_prior_binding() {
        let fx = Fixture::new("app");
        let other = Fixture::new("other");
        let coordinator = fx.coordinator();

        let binding = ThreadBinding::new();
        binding.enter(Some(other.context.clone()));

        let event = request_for(None);
        coordinator.request_initialized(Some(&event)).unwrap();
        assert!(binding.is_current(&fx.context));
        coordinator.request_destroyed(Some(&event)).unwrap();

        assert!(binding.is_current(&other.context));
    }

    #[test]
    fn missing_event_loses_prior_binding() {
        let fx = Fixture::new("app");
        let other = Fixture::new("other");
        let coordinator = fx.coordinator();

        let binding = ThreadBinding::new();
        binding.enter(Some(other.context.clone()));

        coordinator.request_initialized(None).unwrap();
        coordinator.request_destroyed(None).unwrap();

        assert!(binding.current().is_none());
    }

    #[test]
    fn nested_coordinators_unwind_in_order() {
        let outer = Fixture::new("outer");
        let inner = Fixture::new("inner");
        let (a, b) = (outer.coordinator(), inner.coordinator());
        assert_ne!(a.request_key(), b.request_key());

        // One request dispatched across two applications.
        let event = request_for(None);
        a.request_initialized(Some(&event)).unwrap();
        b.request_initialized(Some(&event)).unwrap();
        assert!(b.binding().is_current(&inner.context));

        b.request_destroyed(Some(&event)).unwrap();
        assert!(a.binding().is_current(&outer.context));
        a.request_destroyed(Some(&event)).unwrap();
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn request_key_is_prefixed_context_id() {
        let fx = Fixture::new("app");
        let config = CoordinatorConfig {
            request_key_prefix: "custom@".into(),
            ..CoordinatorConfig::default()
        };
        let coordinator = ScopeLifecycleCoordinator::with_config(fx.context.clone(), &config);
        assert_eq!(coordinator.request_key().as_str(), format!("custom@{}", fx.context.id()));
        assert_eq!(coordinator.name(), "app");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request lifecycle
// ─────────────────────────────────────────────────────────────────────────────

mod request {
    use super::*;

    #[test]
    fn start_failure_is_reported_as_request_start() {
        let fx = Fixture::build(
            "app",
            Journal::default(),
            Faults { request_start: true, ..Faults::default() },
            |c| c,
        );
        let coordinator = fx.coordinator();
        let event = request_for(None);

        let err = coordinator.request_initialized(Some(&event)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestStart);
        assert_eq!(err.root_cause().message, "request start refused");

        // The host still pairs the end, which puts the binding back.
        coordinator.request_destroyed(Some(&event)).unwrap();
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn cleanup_runs_when_end_fails() {
        let fx = Fixture::build(
            "app",
            Journal::default(),
            Faults { request_end: true, ..Faults::default() },
            |c| c,
        );
        let coordinator = fx.coordinator();
        let event = request_for(None);

        coordinator.request_initialized(Some(&event)).unwrap();
        let err = coordinator.request_destroyed(Some(&event)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestEnd);

        let cleanups = fx.entries().iter().filter(|e| *e == "app cleanup").count();
        assert_eq!(cleanups, 1);
        assert!(fx.scopes.request_context(false).is_none());
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn failing_deferred_action_still_cleans_up() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let event = request_for(None);

        coordinator.request_initialized(Some(&event)).unwrap();
        fx.scopes
            .push_deferred_action(Box::new(|| Err(ScopeError::service("deferred failed"))))
            .unwrap();

        let err = coordinator.request_destroyed(Some(&event)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestEnd);
        assert_eq!(err.root_cause().message, "deferred failed");
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn expression_cache_is_released() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let event = request_for(None);

        coordinator.request_initialized(Some(&event)).unwrap();
        expression::with_thread_store(true, |store| store.cache("#{a}", json!(1)));
        coordinator.request_destroyed(Some(&event)).unwrap();

        assert!(!expression::has_thread_store());
    }

    #[test]
    fn failover_marks_session_idle_at_request_end() {
        let failover = Arc::new(InMemoryFailoverService::new(FailoverConfig {
            enabled: true,
            passivation: false,
        }));
        let fx = Fixture::build("app", Journal::default(), Faults::default(), |c| {
            c.with_failover(failover.clone())
        });
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));

        let event = request_for(Some(&session));
        coordinator.request_initialized(Some(&event)).unwrap();
        coordinator.request_destroyed(Some(&event)).unwrap();
        assert!(failover.idle_since("s-1").is_some());

        coordinator.session_did_activate(&session_event(&session));
        assert_eq!(failover.activations("s-1"), 1);
    }

    #[test]
    fn passivation_only_failover_skips_idle_marking() {
        let failover = Arc::new(InMemoryFailoverService::new(FailoverConfig {
            enabled: false,
            passivation: true,
        }));
        let fx = Fixture::build("app", Journal::default(), Faults::default(), |c| {
            c.with_failover(failover.clone())
        });
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));

        let event = request_for(Some(&session));
        coordinator.request_initialized(Some(&event)).unwrap();
        coordinator.request_destroyed(Some(&event)).unwrap();
        assert_eq!(failover.idle_sessions(), 0);

        coordinator.session_did_activate(&session_event(&session));
        assert_eq!(failover.activations("s-1"), 1);
    }

    #[test]
    fn activation_without_failover_is_ignored() {
        let fx = Fixture::new("app");
        let session = Arc::new(Session::new("s-1"));
        fx.coordinator().session_did_activate(&session_event(&session));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context lineage ordering
// ─────────────────────────────────────────────────────────────────────────────

mod lineage {
    use super::*;

    fn parent_and_child(parent_faults: Faults) -> (Fixture, Fixture) {
        let journal = Journal::default();
        let parent = Fixture::build("parent", journal.clone(), parent_faults, |c| c);
        let parent_context = parent.context.clone();
        let child = Fixture::build("child", journal, Faults::default(), |c| c.with_parent(parent_context));
        (parent, child)
    }

    #[test]
    fn request_scopes_start_parent_first_and_end_child_first() {
        let (_parent, child) = parent_and_child(Faults::default());
        let coordinator = child.coordinator();
        let event = request_for(None);

        coordinator.request_initialized(Some(&event)).unwrap();
        assert_eq!(child.entries(), ["parent start request", "child start request"]);

        coordinator.request_destroyed(Some(&event)).unwrap();
        assert_eq!(
            child.entries(),
            ["child end request", "parent end request", "child cleanup", "parent cleanup"]
        );
    }

    #[test]
    fn session_end_releases_parent_before_conversations_and_own_scope() {
        let (parent, child) = parent_and_child(Faults::default());
        let coordinator = child.coordinator();
        let session = Arc::new(Session::new("s-1"));

        coordinator.session_created(&session_event(&session)).unwrap();
        assert_eq!(child.entries(), ["parent start session", "child start session"]);
        assert!(parent.scopes.inner.is_session_active("s-1"));

        child.conversations.register(
            Arc::new(Conversation::begin("s-1")),
            Arc::new(JournaledConversation { journal: child.journal.clone() }),
        );
        coordinator.session_destroyed(&session_event(&session)).unwrap();
        assert_eq!(
            child.entries(),
            [
                "child start session",
                "parent end session",
                "conversation destroyed",
                "child end session",
            ]
        );
        assert!(!parent.scopes.inner.is_session_active("s-1"));
        assert!(!child.scopes.inner.is_session_active("s-1"));
    }

    #[test]
    fn failing_child_request_end_still_ends_parent() {
        let (parent, child) = parent_and_child(Faults::default());
        let coordinator = child.coordinator();
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();
        child.conversations.register(Arc::new(Conversation::begin("s-1")), Arc::new(Stuck));

        let event = request_for(None);
        coordinator.request_initialized(Some(&event)).unwrap();
        let parent_ran = Arc::new(Mutex::new(false));
        let flag = parent_ran.clone();
        parent
            .scopes
            .push_deferred_action(Box::new(move || {
                *flag.lock() = true;
                Ok(())
            }))
            .unwrap();

        // Conversation cleanup is deferred onto the child's request scope.
        coordinator.session_destroyed(&session_event(&session)).unwrap();
        child.entries();

        let err = coordinator.request_destroyed(Some(&event)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestEnd);
        assert_eq!(err.root_cause().message, "conversation stuck");
        assert_eq!(
            child.entries(),
            ["child end request", "parent end request", "child cleanup", "parent cleanup"]
        );
        assert!(*parent_ran.lock());
        assert!(parent.scopes.request_context(false).is_none());
    }

    #[test]
    fn parent_start_failure_stops_child_start() {
        let (_parent, child) = parent_and_child(Faults { request_start: true, ..Faults::default() });
        let coordinator = child.coordinator();
        let event = request_for(None);

        let err = coordinator.request_initialized(Some(&event)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestStart);
        assert_eq!(child.entries(), ["parent start request"]);

        coordinator.request_destroyed(Some(&event)).unwrap();
        let ended = child.entries();
        assert!(ended.contains(&"child cleanup".to_string()));
        assert!(ended.contains(&"parent cleanup".to_string()));
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let root = Fixture::new("root");
        let root_context = root.context.clone();
        let middle = Fixture::build("middle", Journal::default(), Faults::default(), |c| {
            c.with_parent(root_context)
        });
        let middle_context = middle.context.clone();
        let leaf = Fixture::build("leaf", Journal::default(), Faults::default(), |c| {
            c.with_parent(middle_context)
        });

        let names: Vec<_> = leaf.context.ancestors().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, ["middle", "root"]);
        assert!(root.context.ancestors().is_empty());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session end and conversations
// ─────────────────────────────────────────────────────────────────────────────

mod conversations {
    use super::*;

    use scope_services::events::NotificationReceiver;

    fn destroyed_notifications(rx: &mut NotificationReceiver) -> usize {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|n| n.event() == Some(LifecycleEvent::ConversationDestroyed))
            .count()
    }

    #[test]
    fn cleanup_is_deferred_while_a_request_is_active() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let mut rx = fx.events.subscribe();

        let s1 = Arc::new(Session::new("s-1"));
        let s2 = Arc::new(Session::new("s-2"));
        coordinator.session_created(&session_event(&s1)).unwrap();
        let wizard = Arc::new(ConversationScope::new());
        wizard.put("step", json!(2)).unwrap();
        fx.conversations.register(Arc::new(Conversation::with_id("c-1", "s-1")), wizard.clone());

        // R1 serves an unrelated session when S1 ends on the same thread.
        let r1 = request_for(Some(&s2));
        coordinator.request_initialized(Some(&r1)).unwrap();
        coordinator.session_destroyed(&session_event(&s1)).unwrap();

        assert!(!wizard.is_destroyed());
        assert_eq!(fx.conversations.count_for_session("s-1"), 1);
        assert!(!fx.scopes.inner.is_session_active("s-1"));

        coordinator.request_destroyed(Some(&r1)).unwrap();
        assert!(wizard.is_destroyed());
        assert_eq!(fx.conversations.count_for_session("s-1"), 0);
        assert_eq!(destroyed_notifications(&mut rx), 1);

        // A later request finds nothing left to run.
        let r2 = request_for(Some(&s2));
        coordinator.request_initialized(Some(&r2)).unwrap();
        coordinator.request_destroyed(Some(&r2)).unwrap();
        assert_eq!(destroyed_notifications(&mut rx), 0);
    }

    #[test]
    fn cleanup_is_immediate_without_a_request() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let mut rx = fx.events.subscribe();

        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();
        let scopes: Vec<_> = (0..3).map(|_| Arc::new(ConversationScope::new())).collect();
        for scope in &scopes {
            fx.conversations.register(Arc::new(Conversation::begin("s-1")), scope.clone());
        }

        coordinator.session_destroyed(&session_event(&session)).unwrap();
        assert!(scopes.iter().all(|s| s.is_destroyed()));
        assert_eq!(destroyed_notifications(&mut rx), 3);
        assert!(fx.scopes.request_context(false).is_none());
    }

    #[test]
    fn cleanup_runs_on_a_thread_that_never_served_the_session() {
        let fx = Fixture::new("app");
        let coordinator = Arc::new(fx.coordinator());
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();
        let scope = Arc::new(ConversationScope::new());
        fx.conversations.register(Arc::new(Conversation::begin("s-1")), scope.clone());

        let (c, s) = (coordinator.clone(), session.clone());
        std::thread::spawn(move || c.session_destroyed(&session_event(&s)))
            .join()
            .unwrap()
            .unwrap();

        assert!(scope.is_destroyed());
        assert!(!fx.scopes.inner.is_session_active("s-1"));
    }

    #[test]
    fn failing_conversation_does_not_stop_the_others() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();

        let healthy = Arc::new(ConversationScope::new());
        fx.conversations.register(Arc::new(Conversation::with_id("c-stuck", "s-1")), Arc::new(Stuck));
        fx.conversations.register(Arc::new(Conversation::with_id("c-ok", "s-1")), healthy.clone());

        let err = coordinator.session_destroyed(&session_event(&session)).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::ConversationDestroy);
        assert_eq!(err.root_cause().message, "conversation stuck");

        assert!(healthy.is_destroyed());
        assert_eq!(fx.conversations.count_for_session("s-1"), 0);
        assert!(!fx.scopes.inner.is_session_active("s-1"));
    }

    #[test]
    fn destroy_conversations_reports_count() {
        let registry = InMemoryConversationRegistry::new();
        let events = BroadcastEventBus::default();
        for _ in 0..2 {
            registry.register(Arc::new(Conversation::begin("s-1")), Arc::new(ConversationScope::new()));
        }

        assert_eq!(scope_server::destroy_conversations(&registry, &events, "s-1").unwrap(), 2);
        assert_eq!(scope_server::destroy_conversations(&registry, &events, "s-1").unwrap(), 0);
        assert_eq!(events.fired(), 2);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic requests
// ─────────────────────────────────────────────────────────────────────────────

mod synthetic {
    use super::*;

    #[test]
    fn passivation_request_is_released_by_session_end() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();

        coordinator.session_will_passivate(&session_event(&session)).unwrap();
        assert!(coordinator.has_synthetic_request());
        assert!(fx.scopes.request_context(false).is_some());
        assert!(coordinator.binding().is_current(&fx.context));

        coordinator.session_destroyed(&session_event(&session)).unwrap();
        assert!(!coordinator.has_synthetic_request());
        assert!(fx.scopes.request_context(false).is_none());
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn passivation_conversations_are_destroyed_with_the_synthetic_request() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let session = Arc::new(Session::new("s-1"));
        coordinator.session_created(&session_event(&session)).unwrap();
        let scope = Arc::new(ConversationScope::new());
        fx.conversations.register(Arc::new(Conversation::begin("s-1")), scope.clone());

        coordinator.session_will_passivate(&session_event(&session)).unwrap();
        coordinator.session_destroyed(&session_event(&session)).unwrap();

        assert!(scope.is_destroyed());
    }

    #[test]
    fn passivation_inside_a_request_fabricates_nothing() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();
        let event = request_for(None);

        coordinator.request_initialized(Some(&event)).unwrap();
        assert!(!coordinator.ensure_request_scope().unwrap());
        assert!(!coordinator.has_synthetic_request());
        coordinator.request_destroyed(Some(&event)).unwrap();
    }

    #[test]
    fn repeated_passivation_reuses_the_synthetic_request() {
        let fx = Fixture::new("app");
        let coordinator = fx.coordinator();

        assert!(coordinator.ensure_request_scope().unwrap());
        assert!(!coordinator.ensure_request_scope().unwrap());
        assert!(coordinator.release_synthetic_request().unwrap());
        assert!(!coordinator.release_synthetic_request().unwrap());
    }

    #[test]
    fn failed_synthetic_start_is_rolled_back() {
        let fx = Fixture::build(
            "app",
            Journal::default(),
            Faults { request_start: true, ..Faults::default() },
            |c| c,
        );
        let coordinator = fx.coordinator();

        let err = coordinator.ensure_request_scope().unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestStart);
        assert!(!coordinator.has_synthetic_request());
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn failed_rollback_reports_the_start_error() {
        let fx = Fixture::build(
            "app",
            Journal::default(),
            Faults { request_start: true, request_end: true },
            |c| c,
        );
        let coordinator = fx.coordinator();

        let err = coordinator.ensure_request_scope().unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::RequestStart);
        let cleanups = fx.entries().iter().filter(|e| *e == "app cleanup").count();
        assert_eq!(cleanups, 1);
        assert!(!coordinator.has_synthetic_request());
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn application_start_request_is_released_on_stop() {
        let fx = Fixture::build("app", Journal::default(), Faults::default(), |c| {
            c.with_bootstrap(Arc::new(scope_services::AttributeBootstrap::new("ctx-1", "app")))
        });
        let coordinator = fx.coordinator();
        let app = AppEvent::new(Arc::new(AppContext::new("shop")));

        coordinator.context_initialized(&app).unwrap();
        assert!(coordinator.has_synthetic_request());
        assert_eq!(app.app().attribute("scope.context").unwrap()["id"], "ctx-1");

        coordinator.context_destroyed(&app).unwrap();
        assert!(!coordinator.has_synthetic_request());
        assert!(ThreadBinding::new().current().is_none());
    }

    #[test]
    fn bootstrap_failure_does_not_fail_application_start() {
        let fx = Fixture::build("app", Journal::default(), Faults::default(), |c| {
            c.with_bootstrap(Arc::new(Refusing))
        });
        let coordinator = fx.coordinator();
        let app = AppEvent::new(Arc::new(AppContext::new("shop")));

        coordinator.context_initialized(&app).unwrap();
        assert!(coordinator.has_synthetic_request());
        coordinator.context_destroyed(&app).unwrap();
    }

    #[test]
    fn synthetic_requests_are_per_thread() {
        let fx = Fixture::new("app");
        let coordinator = Arc::new(fx.coordinator());
        assert!(coordinator.ensure_request_scope().unwrap());

        let other = coordinator.clone();
        let seen = std::thread::spawn(move || other.has_synthetic_request()).join().unwrap();
        assert!(!seen);

        coordinator.release_synthetic_request().unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

mod config {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "failover": {{ "passivation": true }} }}"#).unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert!(config.failover.passivation);
        assert!(!config.failover.enabled);
        assert!(config.bootstrap);
        assert_eq!(config.request_key_prefix, CoordinatorConfig::default().request_key_prefix);
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = CoordinatorConfig::from_json_str(r#"{ "eventCapacity": 0 }"#).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::Config);

        let err = CoordinatorConfig::from_json_str(r#"{ "requestKeyPrefix": "" }"#).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::Config);

        let err = CoordinatorConfig::from_json_str("not json").unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::Config);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CoordinatorConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::Config);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = CoordinatorConfig {
            failover: FailoverConfig { enabled: true, passivation: true },
            bootstrap: false,
            ..CoordinatorConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"requestKeyPrefix\""));
        assert_eq!(CoordinatorConfig::from_json_str(&text).unwrap(), config);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Deployment registry
// ─────────────────────────────────────────────────────────────────────────────

mod registry {
    use super::*;

    #[test]
    fn deploy_is_refcounted() {
        let registry = DeploymentRegistry::new(CoordinatorConfig::default());
        let first = registry.deploy("shop").unwrap();
        let second = registry.deploy("shop").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.undeploy("shop").unwrap();
        assert!(registry.get("shop").is_some());
        registry.undeploy("shop").unwrap();
        assert!(registry.get("shop").is_none());

        let err = registry.undeploy("shop").unwrap_err();
        assert_eq!(err.code, ScopeErrorCode::InvalidState);
    }

    #[test]
    fn deployments_are_children_of_the_application_context() {
        let registry = DeploymentRegistry::new(CoordinatorConfig::default());
        let shop = registry.deploy("shop").unwrap();
        let admin = registry.deploy("admin").unwrap();

        let parent = shop.context().parent().unwrap();
        assert!(parent.same_as(registry.parent()));
        assert!(admin.context().parent().unwrap().same_as(registry.parent()));
        assert!(!shop.context().same_as(admin.context()));
        assert_eq!(registry.names(), ["admin", "shop"]);

        let published = registry.app("shop").unwrap().attribute("scope.context").unwrap();
        assert_eq!(published["id"], shop.context().id());

        registry.shutdown_all();
        assert!(registry.names().is_empty());
    }

    #[test]
    fn deploy_leaves_no_request_on_the_deploying_thread() {
        let registry = DeploymentRegistry::new(CoordinatorConfig::default());
        let shop = registry.deploy("shop").unwrap();

        assert!(!shop.has_synthetic_request());
        assert!(shop.context().scopes().request_context(false).is_none());
        assert!(registry.parent().scopes().request_context(false).is_none());
        assert!(ThreadBinding::new().current().is_none());
        // Bootstrap still ran inside the start-up request.
        assert!(registry.app("shop").unwrap().attribute("scope.context").is_some());
    }

    #[test]
    fn undeploy_from_another_thread_leaves_deploy_thread_clean() {
        use std::sync::mpsc;

        let registry = Arc::new(DeploymentRegistry::new(CoordinatorConfig::default()));
        let (deployed_tx, deployed_rx) = mpsc::channel();
        let (undeployed_tx, undeployed_rx) = mpsc::channel::<()>();

        let deployer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let app = registry.deploy("app").unwrap();
                deployed_tx.send(()).unwrap();
                undeployed_rx.recv().unwrap();
                (
                    ThreadBinding::new().current().is_none(),
                    app.context().scopes().request_context(false).is_none(),
                    app.has_synthetic_request(),
                )
            })
        };

        deployed_rx.recv().unwrap();
        registry.undeploy("app").unwrap();
        assert!(registry.names().is_empty());
        undeployed_tx.send(()).unwrap();

        assert_eq!(deployer.join().unwrap(), (true, true, false));
    }

    #[test]
    fn scope_notifications_reach_subscribers() {
        let registry = DeploymentRegistry::new(CoordinatorConfig::default());
        let mut rx = registry.events().subscribe();
        let shop = registry.deploy("shop").unwrap();

        let session = Arc::new(Session::new("s-1"));
        shop.session_created(&session_event(&session)).unwrap();
        shop.session_destroyed(&session_event(&session)).unwrap();

        let methods: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).map(|n| n.method).collect();
        assert!(methods.iter().any(|m| m == "session/initialized"));
        assert!(methods.iter().any(|m| m == "session/destroyed"));
        assert!(methods.iter().any(|m| m == "request/initialized"));
    }
}
