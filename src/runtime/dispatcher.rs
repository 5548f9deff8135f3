//! Correlation dispatcher
//!
//! Decides which session an inbound message belongs to:
//!
//! 1. Reject unknown operations and payloads failing the request type.
//! 2. Correlated operations go to the session whose correlation variable
//!    equals the key carried by the payload.
//! 3. Otherwise the oldest session with a pending receive for the
//!    operation gets it.
//! 4. Otherwise a starter operation creates a session (queued behind the
//!    running one in sequential mode).
//! 5. Otherwise, with exactly one live session, the message waits in its
//!    inbox.
//! 6. Otherwise the sender gets a `CorrelationError` fault.
//!
//! Inside a session, matching a message against pending receives is the
//! session inbox's job.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::Shared;
use super::error::{DispatchError, DispatchResult};
use super::service::ExecutionMode;
use super::session::{Session, SessionId};
use super::transport::{Message, SessionMessage};
use crate::interpreter::Fault;
use crate::interpreter::types::OperationKind;

/// Registry of live sessions plus the sequential-mode backlog.
#[derive(Default)]
pub(crate) struct Dispatcher {
    sessions: RwLock<BTreeMap<SessionId, Arc<Session>>>,
    backlog: Mutex<VecDeque<SessionMessage>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions.write().insert(session.id(), session);
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    pub(crate) fn live(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Remove a finished sequential-mode session and start the oldest
    /// backlogged starter once nothing else is live.
    ///
    /// Runs under the backlog lock, the same lock `route` holds while it
    /// checks for live sessions and queues, so a starter is never left
    /// behind an idle engine.
    pub(crate) fn retire_sequential(&self, shared: &Arc<Shared>, session: &Arc<Session>, finish: impl FnOnce()) {
        let mut backlog = self.backlog.lock();
        self.remove(session.id());
        finish();
        if shared.is_shutting_down() || !self.is_empty() {
            return;
        }
        if let Some(next) = backlog.pop_front() {
            tracing::debug!("sequential mode: starting backlogged {}", next.operation());
            shared.spawn_session(Arc::clone(shared.service.main()), Some(next));
        }
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    pub(crate) fn clear_backlog(&self) -> usize {
        let mut backlog = self.backlog.lock();
        let dropped = backlog.len();
        backlog.clear();
        dropped
    }

    /// Route one inbound message. Rejections are also answered on the
    /// reply channel when there is one.
    pub(crate) fn route(&self, shared: &Arc<Shared>, inbound: SessionMessage) -> DispatchResult<Option<SessionId>> {
        let operation = inbound.operation().to_string();

        if shared.is_shutting_down() {
            reject(&inbound, Fault::io_exception("service is shutting down"));
            return Err(DispatchError::ShuttingDown);
        }

        let Some(spec) = shared.service.operation(&operation).cloned() else {
            reject(&inbound, Fault::io_exception(format!("invalid operation: {}", operation)));
            return Err(DispatchError::UnknownOperation(operation));
        };

        if let Err(mismatch) = spec.check_request(&inbound.message.value) {
            tracing::warn!("request for {} rejected: {}", operation, mismatch);
            let detail = mismatch.to_string();
            reject(&inbound, mismatch.into());
            return Err(DispatchError::TypeMismatch { operation, detail });
        }
        if spec.kind() == OperationKind::OneWay && inbound.reply.is_some() {
            tracing::debug!("reply channel ignored for one-way operation {}", operation);
        }

        if let Some(set) = shared.service.correlation_for(&operation) {
            let target = self.live().into_iter().find(|session| {
                session.with_state(|state| set.matches(&operation, &inbound.message.value, state))
            });
            if let Some(session) = target {
                let id = session.id();
                session.deliver(inbound);
                return Ok(Some(id));
            }
            if !shared.service.is_starter(&operation) {
                return Err(self.uncorrelated(inbound));
            }
        } else if let Some(session) = self
            .live()
            .into_iter()
            .find(|session| session.has_waiter_for(&operation))
        {
            let id = session.id();
            session.deliver(inbound);
            return Ok(Some(id));
        }

        let mode = shared.service.mode();
        if shared.service.is_starter(&operation) && mode != ExecutionMode::Single {
            if mode == ExecutionMode::Sequential {
                let mut backlog = self.backlog.lock();
                if !self.is_empty() || !backlog.is_empty() {
                    tracing::debug!("sequential mode: {} queued until the running session ends", operation);
                    backlog.push_back(inbound);
                    return Ok(None);
                }
                let session = shared.spawn_session(Arc::clone(shared.service.main()), Some(inbound));
                return Ok(Some(session.id()));
            }
            let session = shared.spawn_session(Arc::clone(shared.service.main()), Some(inbound));
            return Ok(Some(session.id()));
        }

        let live = self.live();
        if let [only] = live.as_slice() {
            only.deliver(inbound);
            return Ok(Some(only.id()));
        }

        Err(self.uncorrelated(inbound))
    }

    fn uncorrelated(&self, inbound: SessionMessage) -> DispatchError {
        let operation = inbound.operation().to_string();
        tracing::warn!("no session correlates with message {} for {}", inbound.message.id, operation);
        reject(
            &inbound,
            Fault::correlation_error(format!("no session accepts {}", operation)),
        );
        DispatchError::Uncorrelated(operation)
    }
}

fn reject(inbound: &SessionMessage, fault: Fault) {
    if let Some(reply) = &inbound.reply {
        let response = Message::fault_response(&inbound.message, fault);
        if let Err(err) = reply.send(response) {
            tracing::warn!("could not send rejection for {}: {}", inbound.message.id, err);
        }
    }
}
