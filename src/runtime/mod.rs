//! Engine orchestrator and public API
//!
//! This module provides the [`Engine`] that owns the worker pool, the lock
//! table and the session registry for one service, and exposes the
//! interface for embedding it: spawning sessions, delivering messages,
//! inspecting and killing sessions, and shutting down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// Submodules
pub mod context;
pub(crate) mod dispatcher;
pub mod error;
pub(crate) mod locks;
pub mod monitor;
pub(crate) mod scheduler;
pub mod service;
pub mod session;
pub mod storage;
pub mod transport;

use context::{ExecutionContext, KillReason};
use dispatcher::Dispatcher;
use locks::LockTable;
use monitor::{Monitor, MonitorEvent};
use scheduler::Scheduler;
use session::{Session, SessionOutcome};
use transport::SessionMessage;

use crate::interpreter::{Fault, Node, Value};

// Re-export commonly used types
pub use context::{ContextId, ContextState};
pub use error::{ConfigError, DispatchError, EngineError, EngineResult, TransportError};
pub use monitor::RecordingMonitor;
pub use service::{CorrelationSet, ExecutionMode, ServiceDefinition};
pub use session::{SessionHandle, SessionId, SessionReport};
pub use storage::{load_config, write_config};
pub use transport::{CommChannel, LocalPort, Message, MessageId, OutputPort, ReplyChannel, ResponseWaker};

/// Configuration for a Weft engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads in the pool
    pub workers: usize,

    /// Continuations a context may run before yielding its worker
    pub quantum: usize,

    /// How long shutdown waits for sessions to drain
    pub shutdown_timeout_ms: u64,

    /// How long start-up waits for the init behaviour
    pub init_timeout_ms: u64,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            quantum: 64,
            shutdown_timeout_ms: 5000,
            init_timeout_ms: 5000,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.quantum == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        Ok(())
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`.
///
/// The default level is `debug` when `config.debug` is set and `info`
/// otherwise. Calling this more than once is harmless.
pub fn init_tracing(config: &EngineConfig) {
    use tracing_subscriber::EnvFilter;

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .try_init();
}

/// State shared by the engine, its contexts and its channels.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) service: Arc<ServiceDefinition>,
    pub(crate) locks: LockTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) scheduler: Scheduler,
    monitor: Option<Arc<dyn Monitor>>,
    template: RwLock<Value>,
    next_session: AtomicU64,
    shutting_down: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Report a monitoring event, best-effort.
    pub(crate) fn fire(&self, event: MonitorEvent) {
        monitor::fire(self.monitor.as_deref(), event);
    }

    /// Route an inbound message (used by [`Engine::deliver`] and local ports).
    pub(crate) fn route(
        self: &Arc<Self>,
        message: transport::Message,
        reply: Option<Arc<dyn transport::ReplyChannel>>,
    ) -> error::DispatchResult<Option<SessionId>> {
        self.dispatcher.route(self, SessionMessage::new(message, reply))
    }

    /// Create a session running `behaviour`, optionally with a first message.
    pub(crate) fn spawn_session(
        self: &Arc<Self>,
        behaviour: Arc<Node>,
        initial: Option<SessionMessage>,
    ) -> Arc<Session> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let session = Session::new(id, self.template.read().clone());
        if let Some(message) = initial {
            session.enqueue(message);
        }
        let root = ExecutionContext::root(Arc::clone(&session), Arc::clone(self), behaviour);
        session.set_root(Arc::clone(&root));
        self.dispatcher.insert(Arc::clone(&session));
        tracing::info!("{} started ({})", id, self.service.name());
        self.scheduler.schedule(root);
        session
    }

    /// Called by a root context once its queue has drained.
    pub(crate) fn session_finished(self: &Arc<Self>, session: &Arc<Session>, reason: Option<KillReason>) {
        let outcome = match reason {
            None => SessionOutcome::Completed,
            Some(KillReason::Fault(fault)) => {
                tracing::error!(
                    "{} ended by unhandled fault {} ({:?})",
                    session.id(),
                    fault.name,
                    fault.value.content()
                );
                SessionOutcome::Faulted(fault)
            }
            Some(KillReason::Terminated(fault)) => SessionOutcome::Killed(format!("terminated by {}", fault.name)),
            Some(KillReason::Exit) => SessionOutcome::Exited,
            Some(KillReason::Shutdown) => SessionOutcome::Killed("shutdown".to_string()),
            Some(KillReason::Fatal(detail)) => SessionOutcome::Killed(detail),
        };
        tracing::info!(
            "{} finished after {} ms: {:?}",
            session.id(),
            session.age().num_milliseconds(),
            outcome
        );
        if self.service.mode() == ExecutionMode::Sequential {
            self.dispatcher.retire_sequential(self, session, || {
                session.finish(outcome);
            });
        } else {
            self.dispatcher.remove(session.id());
            session.finish(outcome);
        }
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    service: ServiceDefinition,
    config: EngineConfig,
    monitor: Option<Arc<dyn Monitor>>,
}

impl EngineBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Report operation events to `monitor`.
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Start the worker pool, run the init behaviour, and (in single mode)
    /// start the only session.
    pub fn start(self) -> EngineResult<Engine> {
        let config = self.config;
        config.validate()?;

        let pool = scheduler::build_worker_pool(&config)?;
        let shared = Arc::new(Shared {
            scheduler: Scheduler::new(pool.handle().clone(), config.quantum),
            service: Arc::new(self.service),
            locks: LockTable::new(),
            dispatcher: Dispatcher::new(),
            monitor: self.monitor,
            template: RwLock::new(Value::new()),
            next_session: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            config,
        });
        let engine = Engine {
            shared,
            pool: Some(pool),
        };
        let service = Arc::clone(&engine.shared.service);
        tracing::info!(
            "engine for '{}' started: {:?} mode, {} workers",
            service.name(),
            service.mode(),
            engine.shared.config.workers
        );

        if let Some(init) = service.init() {
            let session = engine.shared.spawn_session(Arc::clone(init), None);
            let timeout = Duration::from_millis(engine.shared.config.init_timeout_ms);
            match session.wait(timeout) {
                Some(report) if report.is_completed() => {
                    *engine.shared.template.write() = report.state;
                }
                Some(report) => {
                    return Err(EngineError::Init(format!("init ended with {:?}", report.outcome)));
                }
                None => {
                    return Err(EngineError::Init(format!("init did not finish within {:?}", timeout)));
                }
            }
        }

        if service.mode() == ExecutionMode::Single {
            engine.shared.spawn_session(Arc::clone(service.main()), None);
        }

        Ok(engine)
    }
}

/// A running service: worker pool, lock table and live sessions.
pub struct Engine {
    shared: Arc<Shared>,
    pool: Option<tokio::runtime::Runtime>,
}

impl Engine {
    /// Start building an engine for `service`.
    pub fn builder(service: ServiceDefinition) -> EngineBuilder {
        EngineBuilder {
            service,
            config: EngineConfig::default(),
            monitor: None,
        }
    }

    /// Start an engine with the given configuration and no monitor.
    pub fn start(service: ServiceDefinition, config: EngineConfig) -> EngineResult<Self> {
        Self::builder(service).config(config).start()
    }

    /// The service being run.
    pub fn service(&self) -> &ServiceDefinition {
        &self.shared.service
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start a session of the main behaviour with an empty inbox.
    pub fn spawn_session(&self) -> SessionHandle {
        let session = self
            .shared
            .spawn_session(Arc::clone(self.shared.service.main()), None);
        SessionHandle::new(session)
    }

    /// Deliver an inbound message.
    ///
    /// Returns the session it was routed to, or `None` when it waits in the
    /// sequential-mode backlog. Rejections are also answered on `reply`.
    pub fn deliver(
        &self,
        message: Message,
        reply: Option<Arc<dyn ReplyChannel>>,
    ) -> Result<Option<SessionId>, DispatchError> {
        self.shared.route(message, reply)
    }

    /// Handle on a live session.
    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.shared.dispatcher.get(id).map(SessionHandle::new)
    }

    /// Ids of live sessions, oldest first.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        self.shared
            .dispatcher
            .live()
            .iter()
            .map(|session| session.id())
            .collect()
    }

    /// Starter messages waiting for a sequential-mode slot.
    pub fn backlog(&self) -> usize {
        self.shared.dispatcher.backlog_len()
    }

    /// Kill a live session. Returns false when no such session runs.
    pub fn kill_session(&self, id: SessionId, fault: Fault) -> bool {
        match self.session(id) {
            Some(handle) => {
                handle.kill(fault);
                true
            }
            None => false,
        }
    }

    /// Whether the lock `id` is currently held.
    pub fn is_locked(&self, id: &str) -> bool {
        self.shared.locks.is_held(id)
    }

    /// Contexts queued on the lock `id`.
    pub fn lock_waiters(&self, id: &str) -> usize {
        self.shared.locks.waiting(id)
    }

    /// Output port delivering to this engine from another one in-process.
    pub fn local_port(&self, id: impl Into<String>) -> LocalPort {
        LocalPort::new(id, Arc::clone(&self.shared))
    }

    /// Kill every session, wait for them to drain, and stop the worker pool.
    pub fn shutdown(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let sessions = self.shared.dispatcher.live();
        for session in &sessions {
            if let Some(root) = session.root() {
                root.kill(KillReason::Shutdown);
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.shared.config.shutdown_timeout_ms);
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if session.wait(remaining).is_none() {
                tracing::warn!("{} did not drain before shutdown timeout", session.id());
            }
        }

        let dropped = self.shared.dispatcher.clear_backlog();
        if dropped > 0 {
            tracing::warn!("{} backlogged message(s) dropped at shutdown", dropped);
        }

        pool.shutdown_timeout(Duration::from_millis(100));
        self.shared.locks.clear();
        tracing::info!("engine for '{}' stopped", self.shared.service.name());
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
