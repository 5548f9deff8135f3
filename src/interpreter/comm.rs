//! Communication steps
//!
//! Inbound inputs bind the request payload and, for request-response, run
//! the body and send the reply from an unkillable tail so a fault or kill is
//! still answered. Outbound nodes evaluate their payload, check it against
//! the declared request type, and hand it to the output port's channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::exec::{Continuation, Flow};
use super::fault::Fault;
use super::node::{ExprRef, Node, Receive};
use super::types::OperationSpec;
use super::value::Value;
use crate::runtime::context::{ExecutionContext, KillReason};
use crate::runtime::monitor::{EventKind, EventStatus, MonitorEvent};
use crate::runtime::transport::{CommChannel, Message, MessageId, ResponseWaker, SessionMessage};

fn report(
    ctx: &ExecutionContext,
    kind: EventKind,
    operation: &str,
    message: MessageId,
    status: EventStatus,
    detail: impl Into<String>,
) {
    ctx.shared().fire(MonitorEvent::new(
        kind,
        operation,
        ctx.session().id(),
        message,
        status,
        detail,
    ));
}

/// Bind a delivered message and queue what follows its guard.
///
/// `then` runs after the input (after the reply for request-response) and
/// `tail` after that.
pub(crate) fn fire_guard(
    ctx: &Arc<ExecutionContext>,
    guard: &Receive,
    then: Option<Arc<Node>>,
    inbound: SessionMessage,
    tail: Vec<Continuation>,
) {
    let operation = guard.operation.name();
    tracing::debug!(
        "session {} {}: received {} {}",
        ctx.session().id(),
        ctx.id(),
        operation,
        inbound.message.id
    );
    if let Some(input) = &guard.input {
        ctx.with_state(|state| input.replace(state, inbound.message.value.clone()));
    }
    report(
        ctx,
        EventKind::OperationStarted,
        operation,
        inbound.message.id,
        EventStatus::Success,
        "",
    );

    let mut next = Vec::with_capacity(tail.len() + 3);
    match &guard.reply {
        None => {
            report(
                ctx,
                EventKind::OperationEnded,
                operation,
                inbound.message.id,
                EventStatus::Success,
                "",
            );
        }
        Some(reply) => {
            next.push(Continuation::Run(Arc::clone(&reply.body)));
            next.push(Continuation::ReplyExit {
                operation: Arc::clone(&guard.operation),
                output: reply.output.clone(),
                request: inbound,
            });
        }
    }
    next.extend(then.map(Continuation::Run));
    next.extend(tail);
    ctx.push_next(next);
}

/// Reply to a fault with the fault itself when declared, otherwise with a
/// generic `TypeMismatch` that leaks nothing about the cause.
fn fault_reply(operation: &OperationSpec, request: &Message, fault: &Fault) -> (Message, EventStatus, String) {
    match operation.check_fault(fault) {
        Ok(()) => (
            Message::fault_response(request, fault.clone()),
            EventStatus::Fault,
            fault.name.clone(),
        ),
        Err(mismatch) => {
            tracing::warn!(
                "fault {} is not declared by {} ({}); replying with an internal error",
                fault.name,
                operation.name(),
                mismatch
            );
            (
                Message::fault_response(request, Fault::type_mismatch("Internal server error")),
                EventStatus::Error,
                fault.name.clone(),
            )
        }
    }
}

/// Tail of a request-response input: compute and send the reply.
pub(crate) fn reply_exit(
    ctx: &Arc<ExecutionContext>,
    operation: &Arc<OperationSpec>,
    output: Option<&ExprRef>,
    request: SessionMessage,
) -> Result<Flow, Fault> {
    let message = &request.message;
    let mut raised = None;

    let (response, status, detail) = match ctx.kill_reason() {
        None => {
            let value = match output {
                Some(expression) => ctx.with_state(|state| expression.evaluate(state)),
                None => Ok(Value::new()),
            };
            match value {
                Err(fault) => {
                    let reply = fault_reply(operation, message, &fault);
                    raised = Some(fault);
                    reply
                }
                Ok(value) => match operation.check_response(&value) {
                    Ok(()) => (Message::response(message, value), EventStatus::Success, String::new()),
                    Err(mismatch) => {
                        tracing::warn!("response of {} rejected: {}", operation.name(), mismatch);
                        let detail = mismatch.to_string();
                        raised = Some(mismatch.into());
                        (
                            Message::fault_response(
                                message,
                                Fault::type_mismatch("Internal server error (TypeMismatch)"),
                            ),
                            EventStatus::Error,
                            detail,
                        )
                    }
                },
            }
        }
        Some(KillReason::Fault(fault) | KillReason::Terminated(fault)) => fault_reply(operation, message, &fault),
        Some(reason) => (
            Message::fault_response(message, Fault::io_exception("session terminated")),
            EventStatus::Error,
            format!("{:?}", reason),
        ),
    };

    match &request.reply {
        Some(reply) => {
            if let Err(err) = reply.send(response) {
                tracing::warn!("reply to {} {} could not be sent: {}", operation.name(), message.id, err);
                if raised.is_none() {
                    raised = Some(Fault::io_exception(err.to_string()));
                }
            } else {
                tracing::debug!("session {}: replied to {} {}", ctx.session().id(), operation.name(), message.id);
            }
        }
        None => tracing::debug!("{} {} arrived without a reply channel", operation.name(), message.id),
    }
    report(ctx, EventKind::OperationEnded, operation.name(), message.id, status, detail);

    match raised {
        Some(fault) => Err(fault),
        None => Ok(Flow::Continue),
    }
}

/// Evaluate and check the payload, then resolve the port's channel.
fn prepare(ctx: &ExecutionContext, node: &Node) -> Result<(Message, Arc<dyn CommChannel>), Fault> {
    let (Node::Notification(out) | Node::SolicitResponse(out)) = node else {
        return Err(Fault::io_exception(format!("{:?} is not an output node", node)));
    };
    let value = match &out.output {
        Some(expression) => ctx.with_state(|state| expression.evaluate(state))?,
        None => Value::new(),
    };
    out.operation.check_request(&value)?;

    let shared = ctx.shared();
    let port = shared
        .service
        .output_port(&out.port)
        .ok_or_else(|| Fault::io_exception(format!("unknown output port {}", out.port)))?;
    let channel = port
        .channel()
        .map_err(|err| Fault::io_exception(format!("{}: {}", out.port, err)))?;
    let message = Message::request(out.operation.name(), value).with_resource_path(port.resource_path());
    Ok((message, channel))
}

fn send(
    ctx: &ExecutionContext,
    channel: &dyn CommChannel,
    message: Message,
    on_complete: Box<dyn FnOnce() + Send>,
) -> Result<(), Fault> {
    let operation = message.operation.clone();
    let id = message.id;
    match channel.send(message, on_complete) {
        Ok(()) => {
            tracing::debug!("session {}: sent {} {}", ctx.session().id(), operation, id);
            report(ctx, EventKind::OperationCall, &operation, id, EventStatus::Success, "");
            Ok(())
        }
        Err(err) => {
            report(ctx, EventKind::OperationCall, &operation, id, EventStatus::Error, err.to_string());
            Err(Fault::io_exception(format!("{}: {}", operation, err)))
        }
    }
}

/// One-way send; the context waits until the channel reports completion.
pub(crate) fn notify(ctx: &Arc<ExecutionContext>, node: &Arc<Node>) -> Result<Flow, Fault> {
    let (message, channel) = prepare(ctx, node)?;
    let operation = message.operation.clone();
    let sent = Arc::new(AtomicBool::new(false));
    let on_complete = {
        let sent = Arc::clone(&sent);
        let ctx = Arc::clone(ctx);
        Box::new(move || {
            sent.store(true, Ordering::SeqCst);
            ctx.resume();
        })
    };
    send(ctx, channel.as_ref(), message, on_complete)?;
    ctx.push_front(Continuation::SendAwait { operation, sent });
    Ok(Flow::Continue)
}

/// Send a request and wait for the matching response.
pub(crate) fn solicit(ctx: &Arc<ExecutionContext>, node: Arc<Node>) -> Result<Flow, Fault> {
    let (message, channel) = prepare(ctx, &node)?;
    ctx.push_front(Continuation::Response {
        node,
        request: message.clone(),
        channel: Arc::clone(&channel),
    });
    channel.register_waiter(&message, ResponseWaker::new(ctx));
    if let Err(fault) = send(ctx, channel.as_ref(), message.clone(), Box::new(|| {})) {
        channel.cancel_waiter(&message);
        return Err(fault);
    }
    Ok(Flow::Continue)
}

/// Poll for the response of a solicit-response. The request is never resent.
pub(crate) fn await_response(
    ctx: &Arc<ExecutionContext>,
    node: Arc<Node>,
    request: Message,
    channel: Arc<dyn CommChannel>,
) -> Result<Flow, Fault> {
    let Some(response) = channel.recv_response_for(&request) else {
        channel.register_waiter(&request, ResponseWaker::new(ctx));
        ctx.push_front(Continuation::Response {
            node,
            request,
            channel,
        });
        return Ok(Flow::Suspend);
    };
    let Node::SolicitResponse(out) = node.as_ref() else {
        return Ok(Flow::Continue);
    };
    let operation = &out.operation;
    tracing::debug!(
        "session {}: response for {} {}",
        ctx.session().id(),
        operation.name(),
        request.id
    );

    if let Some(input) = &out.input {
        ctx.with_state(|state| input.replace(state, response.value.clone()));
    }

    if let Some(fault) = response.fault {
        report(
            ctx,
            EventKind::OperationReply,
            operation.name(),
            request.id,
            EventStatus::Fault,
            fault.name.clone(),
        );
        // undeclared faults are raised as received; only a declared fault
        // carrying a mistyped value becomes a TypeMismatch
        if !operation.declares_fault(&fault.name) {
            tracing::warn!("{} answered with undeclared fault {}", operation.name(), fault.name);
            return Err(fault);
        }
        return match operation.check_fault(&fault) {
            Ok(()) => Err(fault),
            Err(mismatch) => {
                tracing::warn!("fault {} from {} rejected: {}", fault.name, operation.name(), mismatch);
                Err(mismatch.into())
            }
        };
    }

    if let Err(mismatch) = operation.check_response(&response.value) {
        tracing::warn!("response of {} rejected: {}", operation.name(), mismatch);
        report(
            ctx,
            EventKind::OperationReply,
            operation.name(),
            request.id,
            EventStatus::Error,
            mismatch.to_string(),
        );
        return Err(mismatch.into());
    }

    report(
        ctx,
        EventKind::OperationReply,
        operation.name(),
        request.id,
        EventStatus::Success,
        "",
    );
    if let Some(install) = &out.install {
        ctx.push_front(Continuation::Run(Arc::clone(install)));
    }
    Ok(Flow::Continue)
}
