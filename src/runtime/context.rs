//! Execution contexts
//!
//! A context is one thread of control inside a session: the root behaviour
//! or one branch of a parallel. It owns a continuation queue, a stack of
//! scope frames and a kill flag. Contexts never block a worker; when a
//! continuation has to wait it re-queues itself and the context parks until
//! the dispatcher, the lock table or a channel resumes it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Shared;
use super::locks::LockWaiter;
use super::session::Session;
use crate::interpreter::exec::{Continuation, Flow};
use crate::interpreter::{Fault, Node, Value};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Observable state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Queued or running on a worker
    Runnable,
    /// Parked until resumed
    Suspended,
    /// Draining after a kill; only unkillable continuations still run
    Killed,
    /// Queue drained
    Done,
}

/// Why a context is being unwound.
#[derive(Debug, Clone, PartialEq)]
pub enum KillReason {
    /// A fault raised by this context, eligible for scope handlers
    Fault(Fault),
    /// Killed from outside (sibling fault, explicit kill); runs compensations only
    Terminated(Fault),
    /// `exit` was executed somewhere in the session
    Exit,
    /// The engine is shutting down
    Shutdown,
    /// A node panicked
    Fatal(String),
}

impl KillReason {
    /// Exit, shutdown and fatal kills skip handlers and compensations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, KillReason::Exit | KillReason::Shutdown | KillReason::Fatal(_))
    }

    /// Reason passed on to the branches of a parallel.
    pub(crate) fn for_branch(&self) -> KillReason {
        match self {
            KillReason::Fault(fault) | KillReason::Terminated(fault) => {
                KillReason::Terminated(fault.clone())
            }
            other => other.clone(),
        }
    }

    fn merge_into(self, slot: &mut Option<KillReason>) {
        let replace = match slot {
            None => true,
            Some(current) => self.is_terminal() && !current.is_terminal(),
        };
        if replace {
            *slot = Some(self);
        }
    }
}

/// Handlers and compensations of one open scope.
pub(crate) struct ScopeFrame {
    pub(crate) id: String,
    handlers: HashMap<String, Arc<Node>>,
    compensations: HashMap<String, Arc<Node>>,
}

impl ScopeFrame {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            handlers: HashMap::new(),
            compensations: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ready,
    Suspended,
    Done,
}

pub(crate) enum Quantum {
    /// Budget exhausted, more work queued
    Yielded,
    /// Suspended or finished; someone else reschedules it
    Parked,
}

struct ContextInner {
    queue: VecDeque<Continuation>,
    scopes: Vec<ScopeFrame>,
    kill: Option<KillReason>,
    status: Status,
    wake_pending: bool,
    /// Join this branch reports to when it finishes
    join: Option<Arc<ParallelJoin>>,
    /// Join this context is currently waiting on
    active_join: Option<Arc<ParallelJoin>>,
}

/// One thread of control inside a session.
pub struct ExecutionContext {
    id: ContextId,
    session: Arc<Session>,
    parent: Option<Arc<ExecutionContext>>,
    shared: Arc<Shared>,
    inner: Mutex<ContextInner>,
}

/// Scope id of the frame wrapping a session's root behaviour.
pub(crate) const ROOT_SCOPE: &str = "main";

impl ExecutionContext {
    fn with_queue(
        session: Arc<Session>,
        parent: Option<Arc<ExecutionContext>>,
        shared: Arc<Shared>,
        queue: VecDeque<Continuation>,
        scopes: Vec<ScopeFrame>,
        join: Option<Arc<ParallelJoin>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            session,
            parent,
            shared,
            inner: Mutex::new(ContextInner {
                queue,
                scopes,
                kill: None,
                status: Status::Ready,
                wake_pending: false,
                join,
                active_join: None,
            }),
        })
    }

    /// Root context running `behaviour` inside the session's root scope.
    pub(crate) fn root(session: Arc<Session>, shared: Arc<Shared>, behaviour: Arc<Node>) -> Arc<Self> {
        let queue = VecDeque::from(vec![
            Continuation::Run(behaviour),
            Continuation::scope_exit(ROOT_SCOPE),
        ]);
        Self::with_queue(session, None, shared, queue, vec![ScopeFrame::new(ROOT_SCOPE)], None)
    }

    /// Branch context of a parallel; it shares the parent's session and
    /// installs into the parent's frames until it opens its own scope.
    pub(crate) fn branch(parent: &Arc<Self>, node: Arc<Node>, join: Arc<ParallelJoin>) -> Arc<Self> {
        Self::with_queue(
            Arc::clone(&parent.session),
            Some(Arc::clone(parent)),
            Arc::clone(&parent.shared),
            VecDeque::from(vec![Continuation::Run(node)]),
            Vec::new(),
            Some(join),
        )
    }

    /// Context id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> ContextState {
        let inner = self.inner.lock();
        match inner.status {
            Status::Done => ContextState::Done,
            _ if inner.kill.is_some() => ContextState::Killed,
            Status::Suspended => ContextState::Suspended,
            Status::Ready => ContextState::Runnable,
        }
    }

    pub(crate) fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Run `f` against the session value tree.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        self.session.with_state(f)
    }

    /// Queue `continuations` to run next, in the given order.
    pub(crate) fn push_next(&self, continuations: Vec<Continuation>) {
        let mut inner = self.inner.lock();
        for continuation in continuations.into_iter().rev() {
            inner.queue.push_front(continuation);
        }
    }

    pub(crate) fn push_front(&self, continuation: Continuation) {
        self.inner.lock().queue.push_front(continuation);
    }

    pub(crate) fn kill_reason(&self) -> Option<KillReason> {
        self.inner.lock().kill.clone()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.inner.lock().kill.is_some()
    }

    /// Clear the kill flag, returning what it held.
    pub(crate) fn clear_kill(&self) -> Option<KillReason> {
        self.inner.lock().kill.take()
    }

    /// Put back a kill reason cleared earlier, unless a stronger one arrived.
    pub(crate) fn restore_kill(&self, reason: KillReason) {
        reason.merge_into(&mut self.inner.lock().kill);
    }

    fn raise(&self, fault: Fault) {
        let mut inner = self.inner.lock();
        if inner.kill.is_some() {
            tracing::debug!("{}: fault {} raised while already unwinding", self.id, fault.name);
        }
        KillReason::Fault(fault).merge_into(&mut inner.kill);
    }

    /// Request cooperative cancellation of this context.
    pub(crate) fn kill(self: &Arc<Self>, reason: KillReason) {
        let (schedule, join) = {
            let mut inner = self.inner.lock();
            if inner.status == Status::Done {
                return;
            }
            reason.clone().merge_into(&mut inner.kill);
            let schedule = match inner.status {
                Status::Suspended => {
                    inner.status = Status::Ready;
                    true
                }
                Status::Ready => {
                    inner.wake_pending = true;
                    false
                }
                Status::Done => false,
            };
            (schedule, inner.active_join.clone())
        };
        if let Some(join) = join {
            join.kill_branches(&reason.for_branch());
        }
        if schedule {
            self.shared.scheduler.schedule(Arc::clone(self));
        }
    }

    /// Kill this context and the session root (and through it every branch).
    pub(crate) fn kill_session(self: &Arc<Self>, reason: KillReason) {
        self.kill(reason.clone());
        if let Some(root) = self.session.root() {
            if root.id != self.id {
                root.kill(reason);
            }
        }
    }

    /// Make a suspended context runnable again.
    pub(crate) fn resume(self: &Arc<Self>) {
        let schedule = {
            let mut inner = self.inner.lock();
            match inner.status {
                Status::Suspended => {
                    inner.status = Status::Ready;
                    true
                }
                Status::Ready => {
                    inner.wake_pending = true;
                    false
                }
                Status::Done => false,
            }
        };
        if schedule {
            self.shared.scheduler.schedule(Arc::clone(self));
        }
    }

    pub(crate) fn push_scope(&self, id: &str) {
        self.inner.lock().scopes.push(ScopeFrame::new(id));
    }

    /// Close the innermost own frame; when merging, its compensations move
    /// to the enclosing frame.
    pub(crate) fn pop_scope(&self, merge: bool) {
        let frame = self.inner.lock().scopes.pop();
        let Some(frame) = frame else {
            tracing::warn!("{}: scope exit without an open frame", self.id);
            return;
        };
        if merge && !frame.compensations.is_empty() {
            let compensations = frame.compensations;
            self.with_frame(move |parent| parent.compensations.extend(compensations));
        }
    }

    /// Run `f` on the innermost frame visible to this context.
    fn with_frame<R>(&self, f: impl FnOnce(&mut ScopeFrame) -> R) -> Option<R> {
        {
            let mut inner = self.inner.lock();
            if let Some(frame) = inner.scopes.last_mut() {
                return Some(f(frame));
            }
        }
        self.parent.as_ref().and_then(|parent| parent.with_frame(f))
    }

    /// Bind a fault handler, or the frame's compensation when `fault` is `None`.
    pub(crate) fn install(&self, fault: Option<&str>, handler: Arc<Node>) {
        let installed = self.with_frame(|frame| match fault {
            Some(name) => {
                frame.handlers.insert(name.to_string(), handler);
            }
            None => {
                let id = frame.id.clone();
                frame.compensations.insert(id, handler);
            }
        });
        if installed.is_none() {
            tracing::warn!("{}: install outside of any scope ignored", self.id);
        }
    }

    /// Handler currently bound for `fault` (or the compensation for `None`).
    pub(crate) fn current_handler(&self, fault: Option<&str>) -> Option<Arc<Node>> {
        self.with_frame(|frame| match fault {
            Some(name) => frame.handlers.get(name).cloned(),
            None => frame.compensations.get(&frame.id).cloned(),
        })
        .flatten()
    }

    /// Remove and return the compensation recorded for a child scope.
    pub(crate) fn take_compensation(&self, scope: &str) -> Option<Arc<Node>> {
        self.with_frame(|frame| frame.compensations.remove(scope)).flatten()
    }

    /// Handler of the innermost own frame for `fault`, falling back to the
    /// default handler. The frame's handlers are cleared either way.
    pub(crate) fn take_fault_handler(&self, fault: &str) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        let frame = inner.scopes.last_mut()?;
        let handler = frame
            .handlers
            .remove(fault)
            .or_else(|| frame.handlers.remove(crate::interpreter::fault::DEFAULT_HANDLER));
        frame.handlers.clear();
        handler
    }

    /// Compensation the innermost own frame installed for itself.
    pub(crate) fn take_own_compensation(&self) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        let frame = inner.scopes.last_mut()?;
        let id = frame.id.clone();
        frame.compensations.remove(&id)
    }

    pub(crate) fn set_active_join(&self, join: Arc<ParallelJoin>) {
        self.inner.lock().active_join = Some(join);
    }

    pub(crate) fn clear_active_join(&self) {
        self.inner.lock().active_join = None;
    }

    /// Pop the next continuation to run, discarding killable ones while killed.
    fn next_continuation(&self) -> (Option<Continuation>, Vec<Continuation>) {
        let mut discarded = Vec::new();
        let mut inner = self.inner.lock();
        loop {
            match inner.queue.pop_front() {
                None => {
                    inner.status = Status::Done;
                    return (None, discarded);
                }
                Some(continuation) if inner.kill.is_some() && continuation.is_killable() => {
                    discarded.push(continuation);
                }
                Some(continuation) => return (Some(continuation), discarded),
            }
        }
    }

    /// Park after a suspending step. Returns false when a wake-up already
    /// arrived and the context should keep running.
    fn park(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.wake_pending {
            inner.wake_pending = false;
            false
        } else {
            inner.status = Status::Suspended;
            true
        }
    }

    /// Run up to `quantum` continuations.
    pub(crate) fn run_quantum(self: &Arc<Self>, quantum: usize) -> Quantum {
        for _ in 0..quantum {
            let (next, discarded) = self.next_continuation();
            for continuation in discarded {
                continuation.discard(self);
            }
            let Some(continuation) = next else {
                self.finish();
                return Quantum::Parked;
            };

            match catch_unwind(AssertUnwindSafe(|| continuation.step(self))) {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Suspend)) => {
                    if self.park() {
                        return Quantum::Parked;
                    }
                }
                Ok(Err(fault)) => self.raise(fault),
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|text| text.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        "session {} {}: node execution panicked: {}",
                        self.session.id(),
                        self.id,
                        detail
                    );
                    self.kill_session(KillReason::Fatal(detail));
                }
            }
        }
        Quantum::Yielded
    }

    fn finish(self: &Arc<Self>) {
        let (join, reason) = {
            let mut inner = self.inner.lock();
            inner.active_join = None;
            (inner.join.take(), inner.kill.clone())
        };
        match join {
            Some(join) => join.branch_finished(self.id, reason),
            None => self.shared.session_finished(&self.session, reason),
        }
    }
}

/// Lock-table handle of a context waiting in a `synchronized` block.
pub(crate) struct LockClaim(pub(crate) Arc<ExecutionContext>);

impl LockWaiter for LockClaim {
    fn waiter_id(&self) -> u64 {
        self.0.id.0
    }

    fn wake(&self) {
        self.0.resume();
    }
}

/// Join point of a parallel: counts finished branches and keeps the first fault.
pub(crate) struct ParallelJoin {
    parent: Arc<ExecutionContext>,
    state: Mutex<JoinState>,
}

struct JoinState {
    remaining: usize,
    fault: Option<Fault>,
    branches: Vec<Arc<ExecutionContext>>,
}

impl ParallelJoin {
    pub(crate) fn new(parent: &Arc<ExecutionContext>, branches: usize) -> Arc<Self> {
        Arc::new(Self {
            parent: Arc::clone(parent),
            state: Mutex::new(JoinState {
                remaining: branches,
                fault: None,
                branches: Vec::with_capacity(branches),
            }),
        })
    }

    pub(crate) fn add_branch(&self, branch: Arc<ExecutionContext>) {
        self.state.lock().branches.push(branch);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state.lock().remaining == 0
    }

    pub(crate) fn take_fault(&self) -> Option<Fault> {
        self.state.lock().fault.take()
    }

    pub(crate) fn kill_branches(&self, reason: &KillReason) {
        let branches = self.state.lock().branches.clone();
        for branch in branches {
            branch.kill(reason.clone());
        }
    }

    fn branch_finished(&self, branch: ContextId, outcome: Option<KillReason>) {
        let (first_fault, siblings, complete) = {
            let mut state = self.state.lock();
            state.remaining = state.remaining.saturating_sub(1);
            state.branches.retain(|ctx| ctx.id != branch);
            let mut first_fault = None;
            if let Some(KillReason::Fault(fault)) = outcome {
                if state.fault.is_none() {
                    state.fault = Some(fault.clone());
                    first_fault = Some(fault);
                }
            }
            let siblings = if first_fault.is_some() {
                state.branches.clone()
            } else {
                Vec::new()
            };
            (first_fault, siblings, state.remaining == 0)
        };
        if let Some(fault) = first_fault {
            tracing::debug!("parallel branch {} faulted with {}, terminating siblings", branch, fault.name);
            for sibling in siblings {
                sibling.kill(KillReason::Terminated(fault.clone()));
            }
        }
        if complete {
            self.parent.resume();
        }
    }
}
