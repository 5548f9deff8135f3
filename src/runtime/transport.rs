//! Transport seams and the in-process channel
//!
//! Network transports and protocol codecs live outside the engine. They plug
//! in through [`OutputPort`], [`CommChannel`] and [`ReplyChannel`]. The
//! only built-in implementation is [`LocalPort`], which embeds another
//! [`Engine`](super::Engine) in the same process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::Shared;
use super::context::ExecutionContext;
use super::error::{TransportError, TransportResult};
use crate::interpreter::{Fault, Value};
use crate::util::io_value;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Correlation id shared by a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Allocate a fresh process-unique id.
    pub fn fresh() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request, response or fault travelling between services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id
    pub id: MessageId,
    /// Operation name
    pub operation: String,
    /// Resource path of the target (empty for the service itself)
    pub resource_path: String,
    /// Payload
    pub value: Value,
    /// Fault carried by a fault response
    pub fault: Option<Fault>,
}

impl Message {
    /// New request with a fresh id.
    pub fn request(operation: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            id: MessageId::fresh(),
            operation: operation.into(),
            resource_path: String::new(),
            value: value.into(),
            fault: None,
        }
    }

    /// Same message addressed to a resource path.
    pub fn with_resource_path(mut self, path: impl Into<String>) -> Self {
        self.resource_path = path.into();
        self
    }

    /// Successful response to `request`.
    pub fn response(request: &Message, value: impl Into<Value>) -> Self {
        Self {
            id: request.id,
            operation: request.operation.clone(),
            resource_path: request.resource_path.clone(),
            value: value.into(),
            fault: None,
        }
    }

    /// Fault response to `request`; the payload mirrors the fault value.
    pub fn fault_response(request: &Message, fault: Fault) -> Self {
        Self {
            id: request.id,
            operation: request.operation.clone(),
            resource_path: request.resource_path.clone(),
            value: fault.value.clone(),
            fault: Some(fault),
        }
    }

    /// True for fault responses.
    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

/// Resumes a context blocked on a solicit-response.
#[derive(Clone)]
pub struct ResponseWaker {
    context: Arc<ExecutionContext>,
}

impl ResponseWaker {
    pub(crate) fn new(context: &Arc<ExecutionContext>) -> Self {
        Self {
            context: Arc::clone(context),
        }
    }

    /// Signal that a response may be available. Spurious calls are harmless.
    pub fn wake(&self) {
        self.context.resume();
    }
}

impl fmt::Debug for ResponseWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWaker")
            .field("context", &self.context.id())
            .finish()
    }
}

/// Outbound channel obtained from an [`OutputPort`].
pub trait CommChannel: Send + Sync {
    /// Send a message; `on_complete` runs once the message has left.
    fn send(&self, message: Message, on_complete: Box<dyn FnOnce() + Send>) -> TransportResult<()>;

    /// Take the response for `request`, if it has arrived.
    fn recv_response_for(&self, request: &Message) -> Option<Message>;

    /// Ask to be woken when a response for `request` arrives.
    ///
    /// Implementations must wake immediately when the response is already
    /// waiting.
    fn register_waiter(&self, request: &Message, waker: ResponseWaker);

    /// Forget `request`: drop its waiter and any response already held for it.
    ///
    /// Called when the requester stops waiting, either because the send
    /// failed or because the waiting context was killed. Must be idempotent.
    fn cancel_waiter(&self, request: &Message);
}

/// Named destination of outbound communication.
pub trait OutputPort: Send + Sync {
    /// Port id referenced by notification and solicit-response nodes.
    fn id(&self) -> &str;

    /// Resource path stamped onto outgoing messages.
    fn resource_path(&self) -> &str {
        ""
    }

    /// Channel to send through.
    fn channel(&self) -> TransportResult<Arc<dyn CommChannel>>;
}

/// Carries the response of a request-response input back to the caller.
pub trait ReplyChannel: Send + Sync {
    /// Send the response or fault.
    fn send(&self, response: Message) -> TransportResult<()>;
}

/// Inbound message with the channel its reply goes to.
#[derive(Clone)]
pub struct SessionMessage {
    /// The request
    pub message: Message,
    /// Reply channel for request-response operations
    pub reply: Option<Arc<dyn ReplyChannel>>,
}

impl SessionMessage {
    /// Wrap a message.
    pub fn new(message: Message, reply: Option<Arc<dyn ReplyChannel>>) -> Self {
        Self { message, reply }
    }

    /// Operation name of the wrapped message.
    pub fn operation(&self) -> &str {
        &self.message.operation
    }
}

impl fmt::Debug for SessionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMessage")
            .field("message", &self.message)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

/// Marshal a message through the preserves codec, as a wire transport would.
fn marshal(message: &Message) -> TransportResult<Message> {
    let roundtrip = |value: &Value| {
        io_value::decode(&io_value::encode(value)).map_err(|err| TransportError::Codec(err.to_string()))
    };
    let mut copy = message.clone();
    copy.value = roundtrip(&message.value)?;
    if let Some(fault) = &mut copy.fault {
        fault.value = roundtrip(&fault.value)?;
    }
    Ok(copy)
}

/// Responses are only kept for requests someone still waits on.
#[derive(Default)]
struct Mailbox {
    responses: HashMap<MessageId, Message>,
    waiters: HashMap<MessageId, ResponseWaker>,
}

impl Mailbox {
    fn forget(&mut self, id: MessageId) {
        self.responses.remove(&id);
        self.waiters.remove(&id);
    }

    fn len(&self) -> usize {
        self.responses.len() + self.waiters.len()
    }
}

/// Output port delivering to another engine in the same process.
#[derive(Clone)]
pub struct LocalPort {
    id: String,
    channel: Arc<LocalChannel>,
}

impl LocalPort {
    pub(crate) fn new(id: impl Into<String>, target: Arc<Shared>) -> Self {
        Self {
            id: id.into(),
            channel: Arc::new(LocalChannel {
                target,
                mailbox: Arc::new(Mutex::new(Mailbox::default())),
            }),
        }
    }

    /// Requests still tracked by this port: responses not yet taken plus
    /// registered waiters.
    pub fn in_flight(&self) -> usize {
        self.channel.mailbox.lock().len()
    }
}

impl OutputPort for LocalPort {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel(&self) -> TransportResult<Arc<dyn CommChannel>> {
        let channel: Arc<dyn CommChannel> = self.channel.clone();
        Ok(channel)
    }
}

struct LocalChannel {
    target: Arc<Shared>,
    mailbox: Arc<Mutex<Mailbox>>,
}

struct LocalReply {
    mailbox: Arc<Mutex<Mailbox>>,
}

impl ReplyChannel for LocalReply {
    fn send(&self, response: Message) -> TransportResult<()> {
        let response = marshal(&response)?;
        let waker = {
            let mut mailbox = self.mailbox.lock();
            let Some(waker) = mailbox.waiters.remove(&response.id) else {
                tracing::debug!("dropping response {}: nobody waits for it", response.id);
                return Ok(());
            };
            mailbox.responses.insert(response.id, response);
            waker
        };
        waker.wake();
        Ok(())
    }
}

impl CommChannel for LocalChannel {
    fn send(&self, message: Message, on_complete: Box<dyn FnOnce() + Send>) -> TransportResult<()> {
        let message = marshal(&message)?;
        let id = message.id;
        let reply: Arc<dyn ReplyChannel> = Arc::new(LocalReply {
            mailbox: Arc::clone(&self.mailbox),
        });
        if let Err(err) = self.target.route(message, Some(reply)) {
            // the rejection was also answered on the reply channel
            self.mailbox.lock().forget(id);
            return Err(TransportError::Rejected(err.to_string()));
        }
        on_complete();
        Ok(())
    }

    fn recv_response_for(&self, request: &Message) -> Option<Message> {
        self.mailbox.lock().responses.remove(&request.id)
    }

    fn register_waiter(&self, request: &Message, waker: ResponseWaker) {
        let ready = {
            let mut mailbox = self.mailbox.lock();
            if mailbox.responses.contains_key(&request.id) {
                true
            } else {
                mailbox.waiters.insert(request.id, waker.clone());
                false
            }
        };
        if ready {
            waker.wake();
        }
    }

    fn cancel_waiter(&self, request: &Message) {
        self.mailbox.lock().forget(request.id);
    }
}
