//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use weft::interpreter::{Expr, ExprRef};
use weft::runtime::error::{TransportError, TransportResult};
use weft::runtime::{
    CommChannel, Engine, EngineConfig, Message, OutputPort, ReplyChannel, ResponseWaker, ServiceDefinition,
    SessionHandle, SessionReport,
};
use weft::Value;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Small pool and quantum so contexts yield often.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        quantum: 4,
        shutdown_timeout_ms: 1000,
        init_timeout_ms: 2000,
        debug: false,
    }
}

pub fn start(service: ServiceDefinition) -> Engine {
    Engine::start(service, test_config()).unwrap()
}

/// Wait for a session to end, failing the test on timeout.
pub fn finish(handle: &SessionHandle) -> SessionReport {
    handle
        .wait(TIMEOUT)
        .unwrap_or_else(|| panic!("session {} did not finish", handle.id()))
}

/// Poll `condition` until it holds or the timeout elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn expr(expression: Expr) -> Option<ExprRef> {
    Some(Arc::new(expression))
}

pub fn int_at(state: &Value, path: &str) -> Option<i64> {
    weft::VariablePath::from(path).get(state).and_then(Value::as_int)
}

pub fn str_at(state: &Value, path: &str) -> Option<String> {
    weft::VariablePath::from(path)
        .get(state)
        .and_then(|value| value.as_str().map(str::to_string))
}

/// Reply channel collecting every response it is given.
#[derive(Default)]
pub struct RecordingReply {
    responses: Mutex<Vec<Message>>,
    arrived: Condvar,
}

impl RecordingReply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responses(&self) -> Vec<Message> {
        self.responses.lock().clone()
    }

    /// Block until at least `count` responses arrived.
    pub fn wait_for(&self, count: usize) -> Vec<Message> {
        let deadline = Instant::now() + TIMEOUT;
        let mut responses = self.responses.lock();
        while responses.len() < count {
            if self.arrived.wait_until(&mut responses, deadline).timed_out() {
                break;
            }
        }
        responses.clone()
    }
}

impl ReplyChannel for RecordingReply {
    fn send(&self, response: Message) -> TransportResult<()> {
        self.responses.lock().push(response);
        self.arrived.notify_all();
        Ok(())
    }
}

type Responder = dyn Fn(&Message) -> Option<Message> + Send + Sync;

/// Channel recording outbound messages and answering them with a script.
pub struct ScriptedChannel {
    sent: Mutex<Vec<Message>>,
    responses: Mutex<Vec<Message>>,
    waiters: Mutex<Vec<(Message, ResponseWaker)>>,
    responder: Box<Responder>,
    fail_sends: bool,
}

impl ScriptedChannel {
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Requests someone still waits a response for.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Deliver a response by hand, waking whoever waits for it.
    pub fn respond(&self, response: Message) {
        self.responses.lock().push(response.clone());
        let wakers: Vec<ResponseWaker> = self
            .waiters
            .lock()
            .iter()
            .filter(|(request, _)| request.id == response.id)
            .map(|(_, waker)| waker.clone())
            .collect();
        for waker in wakers {
            waker.wake();
        }
    }
}

impl CommChannel for ScriptedChannel {
    fn send(&self, message: Message, on_complete: Box<dyn FnOnce() + Send>) -> TransportResult<()> {
        if self.fail_sends {
            return Err(TransportError::Closed("scripted failure".into()));
        }
        self.sent.lock().push(message.clone());
        on_complete();
        if let Some(response) = (self.responder)(&message) {
            self.respond(response);
        }
        Ok(())
    }

    fn recv_response_for(&self, request: &Message) -> Option<Message> {
        let mut responses = self.responses.lock();
        let position = responses.iter().position(|response| response.id == request.id)?;
        Some(responses.remove(position))
    }

    fn register_waiter(&self, request: &Message, waker: ResponseWaker) {
        let ready = self
            .responses
            .lock()
            .iter()
            .any(|response| response.id == request.id);
        if ready {
            waker.wake();
        } else {
            self.waiters.lock().push((request.clone(), waker));
        }
    }

    fn cancel_waiter(&self, request: &Message) {
        self.waiters.lock().retain(|(waiting, _)| waiting.id != request.id);
        self.responses.lock().retain(|response| response.id != request.id);
    }
}

/// Output port backed by a [`ScriptedChannel`].
#[derive(Clone)]
pub struct ScriptedPort {
    id: String,
    pub channel: Arc<ScriptedChannel>,
}

impl ScriptedPort {
    /// Port answering each request with `responder`.
    pub fn new(
        id: &str,
        responder: impl Fn(&Message) -> Option<Message> + Send + Sync + 'static,
    ) -> Self {
        Self::build(id, Box::new(responder), false)
    }

    /// Port that records messages and never answers.
    pub fn silent(id: &str) -> Self {
        Self::new(id, |_| None)
    }

    /// Port whose channel refuses every send.
    pub fn failing(id: &str) -> Self {
        Self::build(id, Box::new(|_| None), true)
    }

    fn build(id: &str, responder: Box<Responder>, fail_sends: bool) -> Self {
        Self {
            id: id.to_string(),
            channel: Arc::new(ScriptedChannel {
                sent: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                waiters: Mutex::new(Vec::new()),
                responder,
                fail_sends,
            }),
        }
    }
}

impl OutputPort for ScriptedPort {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel(&self) -> TransportResult<Arc<dyn CommChannel>> {
        let channel: Arc<dyn CommChannel> = self.channel.clone();
        Ok(channel)
    }
}
