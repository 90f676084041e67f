//! Scope Host — drives the scope lifecycle coordinator from a simulated
//! servlet-style worker pool.
//!
//! Deploys a set of applications, opens sessions, serves requests from a
//! pool of blocking worker threads (each request may begin a conversation
//! and populate the expression cache), evicts sessions out of band through
//! the passivation path, and prints a JSON summary.
//!
//! Usage:
//!   scope-host                                   # 2 apps, 4 workers, 200 requests
//!   scope-host --apps 3 --workers 8              # Larger pool
//!   scope-host --failover --passivation          # Enable failover bookkeeping
//!   scope-host --config coordinator.json         # Load coordinator config

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use rand::Rng;
use scope_protocol::{LifecycleEvent, Request, RequestEvent, Session, SessionEvent};
use scope_server::{
    CoordinatorConfig, DeploymentRegistry, LifecycleListener, ScopeLifecycleCoordinator,
    ThreadBinding,
};
use scope_services::{Conversation, ConversationRegistry, ConversationScope, expression};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scope-host", about = "Scope Host — request/session scope lifecycle simulator")]
struct Cli {
    /// Coordinator configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of applications to deploy
    #[arg(long, default_value = "2")]
    apps: usize,

    /// Worker threads serving requests
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Total requests to serve
    #[arg(long, default_value = "200")]
    requests: usize,

    /// Sessions opened per application
    #[arg(long, default_value = "8")]
    sessions: usize,

    /// Enable failover bookkeeping (overrides the config file)
    #[arg(long)]
    failover: bool,

    /// Enable passivation support (overrides the config file)
    #[arg(long)]
    passivation: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ./scope-host.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

/// One deployed application and the sessions opened against it.
struct Deployment {
    coordinator: Arc<ScopeLifecycleCoordinator>,
    sessions: Vec<Arc<Session>>,
}

#[derive(Default)]
struct Stats {
    served: AtomicUsize,
    failed: AtomicUsize,
    conversations: AtomicUsize,
    leaked_bindings: AtomicUsize,
    evicted: AtomicUsize,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_file_arg) = cli.log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            PathBuf::from("scope-host.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<CoordinatorConfig> {
    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => CoordinatorConfig::default(),
    };
    if cli.failover {
        config.failover.enabled = true;
    }
    if cli.passivation {
        config.failover.passivation = true;
    }
    config.validate()?;
    Ok(config)
}

/// Serve one request end to end on the calling worker thread.
fn serve_request(deployment: &Deployment, session: &Arc<Session>, stats: &Stats) {
    let coordinator = &deployment.coordinator;
    let request = Arc::new(Request::new("127.0.0.1").with_session(session.clone()));
    let event = RequestEvent::new(request);
    let before = ThreadBinding::new().current().map(|c| c.id().to_string());

    // The host always pairs request end with request start.
    let started = coordinator.request_initialized(Some(&event));
    if started.is_ok() {
        session.touch();
        expression::with_thread_store(true, |store| {
            store.cache("#{session.id}", json!(session.id()));
        });

        let mut rng = rand::rng();
        if rng.random_bool(0.3) {
            let scope = Arc::new(ConversationScope::new());
            if scope.put("wizard.step", json!(rng.random_range(1..5))).is_ok() {
                coordinator.context().conversations().register(
                    Arc::new(Conversation::begin(session.id())),
                    scope,
                );
                stats.conversations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let ended = coordinator.request_destroyed(Some(&event));

    match started.and(ended) {
        Ok(()) => {
            stats.served.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!("Request failed: {}", e);
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    let after = ThreadBinding::new().current().map(|c| c.id().to_string());
    if before != after {
        error!("Thread binding leaked across request boundary");
        stats.leaked_bindings.fetch_add(1, Ordering::Relaxed);
    }
}

/// End a session from a thread that is not serving a request, going through
/// passivation first the way a session store would on eviction.
fn evict_session(deployment: &Deployment, session: &Arc<Session>, stats: &Stats) {
    let coordinator = &deployment.coordinator;
    let event = SessionEvent::new(session.clone());

    if let Err(e) = coordinator.session_will_passivate(&event) {
        warn!("Passivation of {} failed: {}", session.id(), e);
    }
    match coordinator.session_destroyed(&event) {
        Ok(()) => {
            session.invalidate();
            stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => warn!("Eviction of {} failed: {}", session.id(), e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = load_config(&cli)?;
    info!(
        "Starting scope host: {} apps, {} workers, {} requests (failover: {}, passivation: {})",
        cli.apps, cli.workers, cli.requests, config.failover.enabled, config.failover.passivation
    );

    let registry = Arc::new(DeploymentRegistry::new(config));

    // Collect lifecycle notifications until every sender is gone.
    let mut rx = registry.events().subscribe();
    let collector = tokio::spawn(async move {
        let mut counts: HashMap<String, u64> = HashMap::new();
        loop {
            match rx.recv().await {
                Ok(notification) => *counts.entry(notification.method).or_insert(0) += 1,
                Err(RecvError::Lagged(skipped)) => *counts.entry("lagged".into()).or_insert(0) += skipped,
                Err(RecvError::Closed) => break,
            }
        }
        counts
    });

    let mut deployments = Vec::with_capacity(cli.apps);
    for i in 0..cli.apps {
        let coordinator = registry.deploy(&format!("app-{i}"))?;
        let mut sessions = Vec::with_capacity(cli.sessions);
        for _ in 0..cli.sessions {
            let session = Arc::new(Session::generate());
            coordinator.session_created(&SessionEvent::new(session.clone()))?;
            sessions.push(session);
        }
        deployments.push(Deployment { coordinator, sessions });
    }
    let deployments = Arc::new(deployments);
    let stats = Arc::new(Stats::default());

    // Requests are handed out from a shared counter so the pool drains the
    // same total regardless of worker count.
    let remaining = Arc::new(Mutex::new(cli.requests));
    let mut workers = Vec::with_capacity(cli.workers);
    let worker_count = if deployments.is_empty() { 0 } else { cli.workers.max(1) };
    for _ in 0..worker_count {
        let deployments = deployments.clone();
        let stats = stats.clone();
        let remaining = remaining.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            loop {
                {
                    let mut left = remaining.lock();
                    if *left == 0 {
                        break;
                    }
                    *left -= 1;
                }
                let mut rng = rand::rng();
                let deployment = &deployments[rng.random_range(0..deployments.len())];
                if deployment.sessions.is_empty() {
                    continue;
                }
                let session = &deployment.sessions[rng.random_range(0..deployment.sessions.len())];
                if session.is_valid() {
                    serve_request(deployment, session, &stats);
                }
            }
        }));
    }

    // Evict half of each application's sessions while the pool is busy.
    let evictor = {
        let deployments = deployments.clone();
        let stats = stats.clone();
        tokio::task::spawn_blocking(move || {
            for deployment in deployments.iter() {
                for session in deployment.sessions.iter().step_by(2) {
                    evict_session(deployment, session, &stats);
                }
            }
        })
    };

    for worker in workers {
        worker.await.context("Worker panicked")?;
    }
    evictor.await.context("Evictor panicked")?;

    // Expire what is left.
    for deployment in deployments.iter() {
        for session in deployment.sessions.iter().filter(|s| s.is_valid()) {
            if let Err(e) = deployment.coordinator.session_destroyed(&SessionEvent::new(session.clone())) {
                warn!("Expiry of {} failed: {}", session.id(), e);
            }
            session.invalidate();
        }
    }

    let names = registry.names();
    registry.shutdown_all();
    let fired = registry.events().fired();
    drop(deployments);
    drop(registry);

    let counts = match tokio::time::timeout(Duration::from_secs(5), collector).await {
        Ok(joined) => joined.context("Notification collector panicked")?,
        Err(_) => {
            warn!("Notification channel still open after shutdown");
            HashMap::new()
        }
    };
    let summary = json!({
        "applications": names,
        "requests": {
            "served": stats.served.load(Ordering::Relaxed),
            "failed": stats.failed.load(Ordering::Relaxed),
            "leakedBindings": stats.leaked_bindings.load(Ordering::Relaxed),
        },
        "sessions": {
            "evicted": stats.evicted.load(Ordering::Relaxed),
        },
        "conversations": {
            "begun": stats.conversations.load(Ordering::Relaxed),
            "destroyed": counts.get(LifecycleEvent::ConversationDestroyed.method()).copied().unwrap_or(0),
        },
        "notifications": {
            "fired": fired,
            "byMethod": counts,
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
