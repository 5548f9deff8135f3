//! Sessions and their inboxes
//!
//! A session is one independent execution of the service behaviour. It owns
//! the value tree shared by its contexts and an inbox holding messages that
//! arrived before anyone asked for them, plus the pending receives of its
//! contexts. Each inbox has its own lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::context::{ContextId, ContextState, ExecutionContext, KillReason};
use super::transport::SessionMessage;
use crate::interpreter::{Fault, Value};

static NEXT_RECEIVE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a session, increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The behaviour ran to completion
    Completed,
    /// A fault reached the root with no handler
    Faulted(Fault),
    /// `exit` was executed
    Exited,
    /// Killed from outside, by shutdown, or by a panic
    Killed(String),
}

/// Final outcome and value tree of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    /// How the session ended
    pub outcome: SessionOutcome,
    /// Value tree at the end
    pub state: Value,
}

impl SessionReport {
    /// True for [`SessionOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }

    /// Name of the fault that ended the session, if any.
    pub fn fault_name(&self) -> Option<&str> {
        match &self.outcome {
            SessionOutcome::Faulted(fault) => Some(&fault.name),
            _ => None,
        }
    }
}

/// A context waiting for one of several operations.
pub(crate) struct PendingReceive {
    id: u64,
    context: Arc<ExecutionContext>,
    operations: Vec<String>,
    slot: Mutex<Option<SessionMessage>>,
}

impl PendingReceive {
    /// Take the delivered message, if any.
    pub(crate) fn take(&self) -> Option<SessionMessage> {
        self.slot.lock().take()
    }

    fn accepts(&self, operation: &str) -> bool {
        self.operations.iter().any(|op| op == operation)
    }
}

/// Outcome of registering a receive.
pub(crate) enum Registration {
    /// A queued message matched immediately
    Ready(SessionMessage),
    /// The receive is pending
    Pending(Arc<PendingReceive>),
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<SessionMessage>,
    waiters: Vec<Arc<PendingReceive>>,
}

/// One running instance of the service behaviour.
pub(crate) struct Session {
    id: SessionId,
    state: Mutex<Value>,
    inbox: Mutex<Inbox>,
    root: Mutex<Option<Arc<ExecutionContext>>>,
    report: Mutex<Option<SessionReport>>,
    finished: Condvar,
    started_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(id: SessionId, state: Value) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(state),
            inbox: Mutex::new(Inbox::default()),
            root: Mutex::new(None),
            report: Mutex::new(None),
            finished: Condvar::new(),
            started_at: Utc::now(),
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn root(&self) -> Option<Arc<ExecutionContext>> {
        self.root.lock().clone()
    }

    pub(crate) fn set_root(&self, root: Arc<ExecutionContext>) {
        *self.root.lock() = Some(root);
    }

    /// Queue a message before any context runs.
    pub(crate) fn enqueue(&self, message: SessionMessage) {
        self.inbox.lock().queue.push_back(message);
    }

    /// Register `context` as waiting for any of `operations`.
    ///
    /// Queued messages are checked first, oldest first. A context keeps at
    /// most one pending receive per operation: an older registration naming
    /// any of the same operations is replaced.
    pub(crate) fn register(&self, context: &Arc<ExecutionContext>, operations: Vec<String>) -> Registration {
        let mut inbox = self.inbox.lock();

        let mut stale = Vec::new();
        inbox.waiters.retain(|waiter| {
            let overlaps = waiter.context.id() == context.id()
                && operations.iter().any(|op| waiter.accepts(op));
            if overlaps {
                stale.push(Arc::clone(waiter));
            }
            !overlaps
        });
        for waiter in stale {
            if let Some(message) = waiter.take() {
                inbox.queue.push_front(message);
            }
        }

        if let Some(position) = inbox
            .queue
            .iter()
            .position(|message| operations.iter().any(|op| op == message.operation()))
        {
            if let Some(message) = inbox.queue.remove(position) {
                return Registration::Ready(message);
            }
        }

        let pending = Arc::new(PendingReceive {
            id: NEXT_RECEIVE_ID.fetch_add(1, Ordering::Relaxed),
            context: Arc::clone(context),
            operations,
            slot: Mutex::new(None),
        });
        inbox.waiters.push(Arc::clone(&pending));
        Registration::Pending(pending)
    }

    /// Re-check a receive registered earlier.
    ///
    /// Returns the message handed to it, if any. A receive that was replaced
    /// by a newer overlapping registration of the same context is registered
    /// again.
    pub(crate) fn renew(&self, context: &Arc<ExecutionContext>, pending: &Arc<PendingReceive>) -> Registration {
        {
            let inbox = self.inbox.lock();
            if let Some(message) = pending.take() {
                return Registration::Ready(message);
            }
            if inbox.waiters.iter().any(|waiter| waiter.id == pending.id) {
                return Registration::Pending(Arc::clone(pending));
            }
        }
        tracing::debug!("{}: receive {} was replaced, registering again", self.id, pending.id);
        self.register(context, pending.operations.clone())
    }

    /// Hand a message to the oldest pending receive naming its operation,
    /// or queue it. The matched receive is removed with all its operations.
    pub(crate) fn deliver(&self, message: SessionMessage) {
        let matched = {
            let mut inbox = self.inbox.lock();
            match inbox
                .waiters
                .iter()
                .position(|waiter| waiter.accepts(message.operation()))
            {
                Some(position) => {
                    let waiter = inbox.waiters.remove(position);
                    *waiter.slot.lock() = Some(message);
                    Some(waiter)
                }
                None => {
                    inbox.queue.push_back(message);
                    None
                }
            }
        };
        if let Some(waiter) = matched {
            tracing::debug!(
                "{}: message delivered to {} (receive {})",
                self.id,
                waiter.context.id(),
                waiter.id
            );
            waiter.context.resume();
        }
    }

    /// Withdraw a pending receive. A message it was handed but never
    /// consumed goes back to the front of the queue.
    pub(crate) fn cancel(&self, pending: &Arc<PendingReceive>) {
        let mut inbox = self.inbox.lock();
        inbox.waiters.retain(|waiter| waiter.id != pending.id);
        if let Some(message) = pending.take() {
            inbox.queue.push_front(message);
        }
    }

    pub(crate) fn has_waiter_for(&self, operation: &str) -> bool {
        self.inbox
            .lock()
            .waiters
            .iter()
            .any(|waiter| waiter.accepts(operation))
    }

    pub(crate) fn pending_operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .inbox
            .lock()
            .waiters
            .iter()
            .flat_map(|waiter| waiter.operations.iter().cloned())
            .collect();
        ops.sort();
        ops
    }

    pub(crate) fn queued_messages(&self) -> usize {
        self.inbox.lock().queue.len()
    }

    /// Record the final report and wake every waiter. Drops the root context
    /// and any leftover receives so nothing keeps the session alive.
    pub(crate) fn finish(&self, outcome: SessionOutcome) -> SessionReport {
        let state = self.state.lock().clone();
        let report = SessionReport { outcome, state };
        self.root.lock().take();
        {
            let mut inbox = self.inbox.lock();
            inbox.waiters.clear();
            if !inbox.queue.is_empty() {
                tracing::warn!("{}: {} undelivered message(s) dropped", self.id, inbox.queue.len());
                inbox.queue.clear();
            }
        }
        *self.report.lock() = Some(report.clone());
        self.finished.notify_all();
        report
    }

    pub(crate) fn report(&self) -> Option<SessionReport> {
        self.report.lock().clone()
    }

    pub(crate) fn wait(&self, timeout: Duration) -> Option<SessionReport> {
        let deadline = Instant::now() + timeout;
        let mut report = self.report.lock();
        while report.is_none() {
            if self.finished.wait_until(&mut report, deadline).timed_out() {
                break;
            }
        }
        report.clone()
    }

    pub(crate) fn age(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// Public handle on a session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Block until the session ends or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<SessionReport> {
        self.session.wait(timeout)
    }

    /// Final report, if the session has ended.
    pub fn report(&self) -> Option<SessionReport> {
        self.session.report()
    }

    /// Whether the session has ended.
    pub fn is_done(&self) -> bool {
        self.session.report().is_some()
    }

    /// Copy of the current value tree.
    pub fn state_snapshot(&self) -> Value {
        self.session.with_state(|state| state.clone())
    }

    /// Operations the session's contexts are currently waiting for.
    pub fn pending_operations(&self) -> Vec<String> {
        self.session.pending_operations()
    }

    /// Messages queued in the inbox with no receive waiting for them.
    pub fn queued_messages(&self) -> usize {
        self.session.queued_messages()
    }

    /// State of the root context (`Done` once the session ended).
    pub fn root_state(&self) -> ContextState {
        self.session
            .root()
            .map_or(ContextState::Done, |root| root.state())
    }

    /// Kill the session; scopes being unwound run their compensations.
    pub fn kill(&self, fault: Fault) {
        if let Some(root) = self.session.root() {
            root.kill(KillReason::Terminated(fault));
        }
    }

    /// Id of the root context while the session runs.
    pub fn root_context(&self) -> Option<ContextId> {
        self.session.root().map(|root| root.id())
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id())
            .field("done", &self.is_done())
            .finish()
    }
}
