//! Continuation step semantics
//!
//! Every node runs as one or more [`Continuation`]s on the queue of an
//! [`ExecutionContext`]. A step mutates the session value tree and queues
//! what comes next at the front of the queue; it never calls into child
//! nodes directly, so kill checks and yields happen between every step and
//! the Rust stack stays flat however long a sequence or loop runs.
//!
//! Waiting steps (inputs, locks, joins, responses) re-queue themselves and
//! return [`Flow::Suspend`]; they re-poll their condition when resumed, so
//! spurious wake-ups are harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::comm;
use super::fault::Fault;
use super::node::{ChoiceBranch, ExprRef, Node, Receive};
use super::path::VariablePath;
use super::types::OperationSpec;
use super::value::{Scalar, Value};
use crate::runtime::context::{ExecutionContext, KillReason, LockClaim, ParallelJoin};
use crate::runtime::locks::Acquire;
use crate::runtime::session::{PendingReceive, Registration};
use crate::runtime::transport::{CommChannel, Message, SessionMessage};

/// What the context does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Keep running the queue
    Continue,
    /// Park until resumed
    Suspend,
}

/// Which part of a scope just finished.
#[derive(Debug, Clone)]
pub(crate) enum ScopePhase {
    /// The scope body
    Body,
    /// A fault handler run in place of propagation
    Handler,
    /// The scope's own compensation, run while unwinding `reason`
    Compensation(KillReason),
}

/// One queued unit of work.
pub(crate) enum Continuation {
    /// Start a node
    Run(Arc<Node>),
    /// Run the children of a sequence from `index` on
    SequenceStep { node: Arc<Node>, index: usize },
    /// Re-check a while loop
    WhileStep { node: Arc<Node> },
    /// Re-check a for loop; the post step is queued with the body
    ForStep { node: Arc<Node> },
    /// Next element of a vector snapshot
    ForEachArrayStep { node: Arc<Node>, len: usize, index: usize },
    /// Next child name of a key snapshot
    ForEachFieldStep {
        node: Arc<Node>,
        keys: Vec<String>,
        index: usize,
    },
    /// Close a scope frame
    ScopeExit { id: String, phase: ScopePhase },
    /// Wait for the branches of a parallel
    Join(Arc<ParallelJoin>),
    /// Wait for a lock hand-off
    LockAwait { id: String, body: Arc<Node> },
    /// Release a lock on every exit path
    LockRelease { id: String },
    /// Wait for an input of a one-way, request-response or choice node
    Await {
        node: Arc<Node>,
        pending: Option<Arc<PendingReceive>>,
    },
    /// Wait for a provide or until input
    Provide {
        node: Arc<Node>,
        provide: Option<Arc<PendingReceive>>,
        until: Option<Arc<PendingReceive>>,
    },
    /// Send the reply of a request-response input
    ReplyExit {
        operation: Arc<OperationSpec>,
        output: Option<ExprRef>,
        request: SessionMessage,
    },
    /// Wait until a notification has left
    SendAwait { operation: String, sent: Arc<AtomicBool> },
    /// Wait for the response of a solicit-response
    Response {
        node: Arc<Node>,
        request: Message,
        channel: Arc<dyn CommChannel>,
    },
}

impl Continuation {
    /// Exit continuation of a scope body.
    pub(crate) fn scope_exit(id: &str) -> Self {
        Continuation::ScopeExit {
            id: id.to_string(),
            phase: ScopePhase::Body,
        }
    }

    /// Whether a kill discards this continuation instead of running it.
    pub(crate) fn is_killable(&self) -> bool {
        match self {
            Continuation::Run(node) => node.is_killable(),
            Continuation::SequenceStep { node, index } => match node.as_ref() {
                Node::Sequence(children) => children.iter().skip(*index).all(|child| child.is_killable()),
                _ => true,
            },
            Continuation::ScopeExit { .. }
            | Continuation::Join(_)
            | Continuation::LockAwait { .. }
            | Continuation::LockRelease { .. }
            | Continuation::ReplyExit { .. } => false,
            _ => true,
        }
    }

    /// Clean up after a continuation dropped by a kill.
    pub(crate) fn discard(self, ctx: &Arc<ExecutionContext>) {
        match self {
            Continuation::Await {
                pending: Some(pending),
                ..
            } => ctx.session().cancel(&pending),
            Continuation::Provide { provide, until, .. } => {
                for pending in provide.iter().chain(until.iter()) {
                    ctx.session().cancel(pending);
                }
            }
            Continuation::Response { request, channel, .. } => channel.cancel_waiter(&request),
            _ => {}
        }
    }

    /// Execute one step.
    pub(crate) fn step(self, ctx: &Arc<ExecutionContext>) -> Result<Flow, Fault> {
        match self {
            Continuation::Run(node) => run(ctx, node),
            Continuation::SequenceStep { node, index } => sequence_step(ctx, node, index),
            Continuation::WhileStep { node } => while_step(ctx, node),
            Continuation::ForStep { node } => for_step(ctx, node),
            Continuation::ForEachArrayStep { node, len, index } => for_each_array_step(ctx, node, len, index),
            Continuation::ForEachFieldStep { node, keys, index } => for_each_field_step(ctx, node, keys, index),
            Continuation::ScopeExit { id, phase } => scope_exit(ctx, id, phase),
            Continuation::Join(join) => join_step(ctx, join),
            Continuation::LockAwait { id, body } => lock_await(ctx, id, body),
            Continuation::LockRelease { id } => {
                ctx.shared().locks.release(&id);
                Ok(Flow::Continue)
            }
            Continuation::Await { node, pending } => await_input(ctx, node, pending),
            Continuation::Provide { node, provide, until } => provide_step(ctx, node, provide, until),
            Continuation::ReplyExit {
                operation,
                output,
                request,
            } => comm::reply_exit(ctx, &operation, output.as_ref(), request),
            Continuation::SendAwait { operation, sent } => {
                if sent.load(Ordering::SeqCst) {
                    tracing::debug!("{}: {} sent", ctx.id(), operation);
                    return Ok(Flow::Continue);
                }
                ctx.push_front(Continuation::SendAwait { operation, sent });
                Ok(Flow::Suspend)
            }
            Continuation::Response {
                node,
                request,
                channel,
            } => comm::await_response(ctx, node, request, channel),
        }
    }
}

fn evaluate(ctx: &ExecutionContext, expression: &ExprRef) -> Result<Value, Fault> {
    ctx.with_state(|state| expression.evaluate(state))
}

fn run(ctx: &Arc<ExecutionContext>, node: Arc<Node>) -> Result<Flow, Fault> {
    match node.as_ref() {
        Node::Null => {}
        Node::Exit => {
            tracing::debug!("session {}: exit", ctx.session().id());
            ctx.kill_session(KillReason::Exit);
        }
        Node::Sequence(_) => return sequence_step(ctx, node, 0),
        Node::Parallel(children) => fork(ctx, children),
        Node::If {
            condition,
            then,
            otherwise,
        } => {
            if evaluate(ctx, condition)?.is_truthy() {
                ctx.push_front(Continuation::Run(Arc::clone(then)));
            } else if let Some(otherwise) = otherwise {
                ctx.push_front(Continuation::Run(Arc::clone(otherwise)));
            }
        }
        Node::While { .. } => return while_step(ctx, node),
        Node::For { init, .. } => {
            let init = Arc::clone(init);
            ctx.push_next(vec![Continuation::Run(init), Continuation::ForStep { node }]);
        }
        Node::ForEachArray { target, .. } => {
            let len = ctx.with_state(|state| target.vector_len(state));
            return for_each_array_step(ctx, node, len, 0);
        }
        Node::ForEachField { target, .. } => {
            let keys = ctx.with_state(|state| target.child_names(state));
            return for_each_field_step(ctx, node, keys, 0);
        }
        Node::Assign { target, expression } => ctx.with_state(|state| {
            let value = expression.evaluate(state)?;
            target.assign(state, value.content().clone());
            Ok::<_, Fault>(())
        })?,
        Node::DeepCopy { target, expression } => ctx.with_state(|state| {
            let value = expression.evaluate(state)?;
            target.deep_copy(state, &value);
            Ok::<_, Fault>(())
        })?,
        Node::Increment(path) => ctx.with_state(|state| step_number(state, path, 1))?,
        Node::Decrement(path) => ctx.with_state(|state| step_number(state, path, -1))?,
        Node::Undef(path) => ctx.with_state(|state| path.remove(state)),
        Node::Scope { id, body } => {
            ctx.push_scope(id);
            ctx.push_next(vec![Continuation::Run(Arc::clone(body)), Continuation::scope_exit(id)]);
        }
        Node::Install(bindings) => {
            for binding in bindings {
                let fault = binding.fault.as_deref();
                let current = ctx.current_handler(fault);
                let handler = binding.handler.bind_current_handler(current.as_ref());
                tracing::debug!("{}: install {}", ctx.id(), fault.unwrap_or("compensation"));
                ctx.install(fault, handler);
            }
        }
        Node::CurrentHandler => {
            tracing::debug!("{}: cH outside of an install does nothing", ctx.id());
        }
        Node::Throw { fault, expression } => {
            let value = match expression {
                Some(expression) => evaluate(ctx, expression)?,
                None => Value::new(),
            };
            return Err(Fault::with_value(fault.clone(), value));
        }
        Node::Compensate(scope) => match ctx.take_compensation(scope) {
            Some(compensation) => {
                tracing::debug!("{}: compensating {}", ctx.id(), scope);
                ctx.push_front(Continuation::Run(compensation));
            }
            None => tracing::debug!("{}: no compensation recorded for {}", ctx.id(), scope),
        },
        Node::Synchronized { id, body } => {
            let claim = Arc::new(LockClaim(Arc::clone(ctx)));
            match ctx.shared().locks.acquire(id, claim) {
                Acquire::Acquired => enter_lock(ctx, id, body),
                Acquire::Queued => {
                    ctx.push_front(Continuation::LockAwait {
                        id: id.clone(),
                        body: Arc::clone(body),
                    });
                    return Ok(Flow::Suspend);
                }
            }
        }
        Node::OneWay(_) | Node::RequestResponse(_) | Node::Choice(_) => {
            return await_input(ctx, node, None);
        }
        Node::ProvideUntil { .. } => return provide_step(ctx, node, None, None),
        Node::Notification(_) => return comm::notify(ctx, &node),
        Node::SolicitResponse(_) => return comm::solicit(ctx, node),
    }
    Ok(Flow::Continue)
}

fn step_number(state: &mut Value, path: &VariablePath, delta: i64) -> Result<(), Fault> {
    let node = path.get_or_create(state);
    let next = match node.content() {
        Scalar::Void => Scalar::Int(delta),
        Scalar::Int(num) => Scalar::Int(
            num.checked_add(delta)
                .ok_or_else(|| Fault::arithmetic(format!("integer overflow at {}", path)))?,
        ),
        Scalar::Double(num) => Scalar::Double(num + delta as f64),
        other => {
            return Err(Fault::arithmetic(format!(
                "cannot increment non-numeric value '{}' at {}",
                other, path
            )));
        }
    };
    node.set_content(next);
    Ok(())
}

fn sequence_step(ctx: &Arc<ExecutionContext>, node: Arc<Node>, index: usize) -> Result<Flow, Fault> {
    let Node::Sequence(children) = node.as_ref() else {
        return Ok(Flow::Continue);
    };
    let Some(child) = children.get(index) else {
        return Ok(Flow::Continue);
    };
    let child = Arc::clone(child);
    if index + 1 < children.len() {
        ctx.push_next(vec![
            Continuation::Run(child),
            Continuation::SequenceStep { node, index: index + 1 },
        ]);
    } else {
        ctx.push_front(Continuation::Run(child));
    }
    Ok(Flow::Continue)
}

fn while_step(ctx: &Arc<ExecutionContext>, node: Arc<Node>) -> Result<Flow, Fault> {
    let Node::While { condition, body } = node.as_ref() else {
        return Ok(Flow::Continue);
    };
    if evaluate(ctx, condition)?.is_truthy() {
        let body = Arc::clone(body);
        ctx.push_next(vec![Continuation::Run(body), Continuation::WhileStep { node }]);
    }
    Ok(Flow::Continue)
}

fn for_step(ctx: &Arc<ExecutionContext>, node: Arc<Node>) -> Result<Flow, Fault> {
    let Node::For {
        condition,
        post,
        body,
        ..
    } = node.as_ref()
    else {
        return Ok(Flow::Continue);
    };
    if evaluate(ctx, condition)?.is_truthy() {
        let (body, post) = (Arc::clone(body), Arc::clone(post));
        ctx.push_next(vec![
            Continuation::Run(body),
            Continuation::Run(post),
            Continuation::ForStep { node },
        ]);
    }
    Ok(Flow::Continue)
}

fn for_each_array_step(
    ctx: &Arc<ExecutionContext>,
    node: Arc<Node>,
    len: usize,
    index: usize,
) -> Result<Flow, Fault> {
    let Node::ForEachArray { target, item, body } = node.as_ref() else {
        return Ok(Flow::Continue);
    };
    if index >= len {
        return Ok(Flow::Continue);
    }
    ctx.with_state(|state| {
        let element = target.at(index).value_of(state);
        item.replace(state, element);
    });
    let body = Arc::clone(body);
    ctx.push_next(vec![
        Continuation::Run(body),
        Continuation::ForEachArrayStep {
            node,
            len,
            index: index + 1,
        },
    ]);
    Ok(Flow::Continue)
}

fn for_each_field_step(
    ctx: &Arc<ExecutionContext>,
    node: Arc<Node>,
    keys: Vec<String>,
    index: usize,
) -> Result<Flow, Fault> {
    let Node::ForEachField { key, body, .. } = node.as_ref() else {
        return Ok(Flow::Continue);
    };
    let Some(name) = keys.get(index) else {
        return Ok(Flow::Continue);
    };
    ctx.with_state(|state| key.assign(state, Scalar::Str(name.clone())));
    let body = Arc::clone(body);
    ctx.push_next(vec![
        Continuation::Run(body),
        Continuation::ForEachFieldStep {
            node,
            keys,
            index: index + 1,
        },
    ]);
    Ok(Flow::Continue)
}

fn fork(ctx: &Arc<ExecutionContext>, children: &[Arc<Node>]) {
    if children.is_empty() {
        return;
    }
    let join = ParallelJoin::new(ctx, children.len());
    ctx.set_active_join(Arc::clone(&join));
    ctx.push_front(Continuation::Join(Arc::clone(&join)));

    let branches: Vec<Arc<ExecutionContext>> = children
        .iter()
        .map(|child| {
            let branch = ExecutionContext::branch(ctx, Arc::clone(child), Arc::clone(&join));
            join.add_branch(Arc::clone(&branch));
            branch
        })
        .collect();
    tracing::debug!("{}: forked {} branches", ctx.id(), branches.len());

    // A kill that raced with the fork never saw these branches.
    if let Some(reason) = ctx.kill_reason() {
        join.kill_branches(&reason.for_branch());
    }
    for branch in branches {
        ctx.shared().scheduler.schedule(branch);
    }
}

fn join_step(ctx: &Arc<ExecutionContext>, join: Arc<ParallelJoin>) -> Result<Flow, Fault> {
    if !join.is_complete() {
        ctx.push_front(Continuation::Join(join));
        return Ok(Flow::Suspend);
    }
    ctx.clear_active_join();
    match join.take_fault() {
        Some(fault) => Err(fault),
        None => Ok(Flow::Continue),
    }
}

fn scope_exit(ctx: &Arc<ExecutionContext>, id: String, phase: ScopePhase) -> Result<Flow, Fault> {
    match phase {
        ScopePhase::Body => match ctx.kill_reason() {
            None => ctx.pop_scope(true),
            Some(KillReason::Fault(fault)) => match ctx.take_fault_handler(&fault.name) {
                Some(handler) => {
                    tracing::debug!("scope {}: handling {}", id, fault.name);
                    ctx.clear_kill();
                    ctx.with_state(|state| {
                        let scope = VariablePath::root().child(&id);
                        scope.child(&fault.name).replace(state, fault.value.clone());
                        scope
                            .child(super::fault::DEFAULT_HANDLER)
                            .assign(state, Scalar::Str(fault.name.clone()));
                    });
                    ctx.push_next(vec![
                        Continuation::Run(handler),
                        Continuation::ScopeExit {
                            id,
                            phase: ScopePhase::Handler,
                        },
                    ]);
                }
                None => compensate(ctx, id, KillReason::Fault(fault)),
            },
            Some(reason @ KillReason::Terminated(_)) => compensate(ctx, id, reason),
            Some(_) => ctx.pop_scope(false),
        },
        ScopePhase::Handler => match ctx.kill_reason() {
            None => ctx.pop_scope(true),
            Some(reason) if !reason.is_terminal() => compensate(ctx, id, reason),
            Some(_) => ctx.pop_scope(false),
        },
        ScopePhase::Compensation(reason) => {
            let during = ctx.clear_kill();
            ctx.restore_kill(reason);
            match during {
                Some(stronger) if stronger.is_terminal() => ctx.restore_kill(stronger),
                Some(KillReason::Fault(fault) | KillReason::Terminated(fault)) => {
                    tracing::warn!("compensation of scope {} failed with {}", id, fault.name);
                }
                _ => {}
            }
        }
    }
    Ok(Flow::Continue)
}

/// Close a failed scope, running its own compensation with the kill flag
/// cleared before `reason` is restored.
fn compensate(ctx: &Arc<ExecutionContext>, id: String, reason: KillReason) {
    let compensation = ctx.take_own_compensation();
    ctx.pop_scope(false);
    let Some(compensation) = compensation else {
        return;
    };
    tracing::debug!("scope {}: running compensation", id);
    ctx.clear_kill();
    ctx.push_next(vec![
        Continuation::Run(compensation),
        Continuation::ScopeExit {
            id,
            phase: ScopePhase::Compensation(reason),
        },
    ]);
}

fn enter_lock(ctx: &Arc<ExecutionContext>, id: &str, body: &Arc<Node>) {
    tracing::debug!("{}: holding lock '{}'", ctx.id(), id);
    ctx.push_next(vec![
        Continuation::Run(Arc::clone(body)),
        Continuation::LockRelease { id: id.to_string() },
    ]);
}

fn lock_await(ctx: &Arc<ExecutionContext>, id: String, body: Arc<Node>) -> Result<Flow, Fault> {
    let locks = &ctx.shared().locks;
    if ctx.is_killed() {
        tracing::debug!("{}: killed while waiting for lock '{}'", ctx.id(), id);
        locks.abandon(&id, ctx.id().0);
        return Ok(Flow::Continue);
    }
    if locks.take_grant(&id, ctx.id().0) {
        enter_lock(ctx, &id, &body);
        return Ok(Flow::Continue);
    }
    ctx.push_front(Continuation::LockAwait { id, body });
    Ok(Flow::Suspend)
}

/// Input guards of a one-way, request-response or choice node.
fn guards(node: &Node) -> Vec<(&Receive, Option<&Arc<Node>>)> {
    match node {
        Node::OneWay(receive) | Node::RequestResponse(receive) => vec![(receive, None)],
        Node::Choice(branches) => branch_guards(branches),
        _ => Vec::new(),
    }
}

fn branch_guards(branches: &[ChoiceBranch]) -> Vec<(&Receive, Option<&Arc<Node>>)> {
    branches
        .iter()
        .map(|branch| (&branch.guard, Some(&branch.body)))
        .collect()
}

fn operation_names(guards: &[(&Receive, Option<&Arc<Node>>)]) -> Vec<String> {
    guards
        .iter()
        .map(|(guard, _)| guard.operation.name().to_string())
        .collect()
}

fn select<'a>(
    guards: &[(&'a Receive, Option<&'a Arc<Node>>)],
    operation: &str,
) -> Result<(&'a Receive, Option<Arc<Node>>), Fault> {
    guards
        .iter()
        .find(|(guard, _)| guard.operation.name() == operation)
        .map(|(guard, then)| (*guard, then.cloned()))
        .ok_or_else(|| Fault::correlation_error(format!("no branch accepts {}", operation)))
}

fn await_input(
    ctx: &Arc<ExecutionContext>,
    node: Arc<Node>,
    pending: Option<Arc<PendingReceive>>,
) -> Result<Flow, Fault> {
    let inbound = match pending {
        Some(pending) => match pending.take() {
            Some(inbound) => inbound,
            None => {
                ctx.push_front(Continuation::Await {
                    node,
                    pending: Some(pending),
                });
                return Ok(Flow::Suspend);
            }
        },
        None => {
            let operations = operation_names(&guards(&node));
            match ctx.session().register(ctx, operations) {
                Registration::Ready(inbound) => inbound,
                Registration::Pending(pending) => {
                    ctx.push_front(Continuation::Await {
                        node,
                        pending: Some(pending),
                    });
                    return Ok(Flow::Suspend);
                }
            }
        }
    };
    let branches = guards(&node);
    let (guard, then) = select(&branches, inbound.operation())?;
    comm::fire_guard(ctx, guard, then, inbound, Vec::new());
    Ok(Flow::Continue)
}

/// Poll a pending receive, registering it first or again when needed.
enum Poll {
    Fired(SessionMessage),
    Waiting(Arc<PendingReceive>),
}

fn poll(
    ctx: &Arc<ExecutionContext>,
    pending: Option<Arc<PendingReceive>>,
    branches: &[ChoiceBranch],
) -> Poll {
    let registration = match pending {
        Some(pending) => ctx.session().renew(ctx, &pending),
        None => ctx
            .session()
            .register(ctx, operation_names(&branch_guards(branches))),
    };
    match registration {
        Registration::Ready(inbound) => Poll::Fired(inbound),
        Registration::Pending(pending) => Poll::Waiting(pending),
    }
}

/// `provide [..] until [..]`: the until set is polled first, so an until
/// message wins over a provide message that arrived in the same window; the
/// provide message then goes back to the inbox.
fn provide_step(
    ctx: &Arc<ExecutionContext>,
    node: Arc<Node>,
    provide: Option<Arc<PendingReceive>>,
    until: Option<Arc<PendingReceive>>,
) -> Result<Flow, Fault> {
    let Node::ProvideUntil {
        provide: provide_branches,
        until: until_branches,
    } = node.as_ref()
    else {
        return Ok(Flow::Continue);
    };

    let until = match poll(ctx, until, until_branches) {
        Poll::Fired(inbound) => {
            if let Some(pending) = &provide {
                ctx.session().cancel(pending);
            }
            let guards = branch_guards(until_branches);
            let (guard, then) = select(&guards, inbound.operation())?;
            tracing::debug!("{}: until branch {} fired", ctx.id(), inbound.operation());
            comm::fire_guard(ctx, guard, then, inbound, Vec::new());
            return Ok(Flow::Continue);
        }
        Poll::Waiting(pending) => pending,
    };

    match poll(ctx, provide, provide_branches) {
        Poll::Fired(inbound) => {
            let guards = branch_guards(provide_branches);
            let (guard, then) = select(&guards, inbound.operation())?;
            let again = Continuation::Provide {
                node: Arc::clone(&node),
                provide: None,
                until: Some(until),
            };
            comm::fire_guard(ctx, guard, then, inbound, vec![again]);
            Ok(Flow::Continue)
        }
        Poll::Waiting(pending) => {
            ctx.push_front(Continuation::Provide {
                node,
                provide: Some(pending),
                until: Some(until),
            });
            Ok(Flow::Suspend)
        }
    }
}
