//! Operation monitoring
//!
//! The engine reports communication milestones to an optional [`Monitor`].
//! Reporting is best-effort: a failing or panicking sink is logged and never
//! changes the outcome of the session that produced the event.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::session::SessionId;
use super::transport::MessageId;

/// Milestone being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// An inbound operation was received
    OperationStarted,
    /// An inbound operation finished (reply sent for request-response)
    OperationEnded,
    /// An outbound operation was sent
    OperationCall,
    /// A response to an outbound operation was received
    OperationReply,
}

/// Result recorded with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    /// Completed normally
    Success,
    /// Completed with a declared fault
    Fault,
    /// Failed (type mismatch, transport error, undeclared fault)
    Error,
}

/// One monitoring record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    /// Milestone
    pub kind: EventKind,
    /// Operation name
    pub operation: String,
    /// Session that produced the event
    pub session_id: SessionId,
    /// Message the event refers to
    pub message_id: MessageId,
    /// Outcome
    pub status: EventStatus,
    /// Free-form detail (fault name, error text)
    pub detail: String,
    /// Wall-clock time of the event
    pub timestamp: DateTime<Utc>,
}

impl MonitorEvent {
    /// New event stamped with the current time.
    pub fn new(
        kind: EventKind,
        operation: impl Into<String>,
        session_id: SessionId,
        message_id: MessageId,
        status: EventStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            session_id,
            message_id,
            status,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Observability sink.
pub trait Monitor: Send + Sync {
    /// Receive one event.
    fn on_event(&self, event: &MonitorEvent) -> anyhow::Result<()>;
}

/// Deliver an event, swallowing sink errors and panics.
pub(crate) fn fire(monitor: Option<&dyn Monitor>, event: MonitorEvent) {
    let Some(monitor) = monitor else {
        return;
    };
    match catch_unwind(AssertUnwindSafe(|| monitor.on_event(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!("monitor rejected {:?} for {}: {:#}", event.kind, event.operation, err);
        }
        Err(_) => {
            tracing::warn!("monitor panicked on {:?} for {}", event.kind, event.operation);
        }
    }
}

/// Monitor that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<MonitorEvent>>,
}

impl RecordingMonitor {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of one kind for one operation.
    pub fn matching(&self, kind: EventKind, operation: &str) -> Vec<MonitorEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind && event.operation == operation)
            .cloned()
            .collect()
    }
}

impl Monitor for RecordingMonitor {
    fn on_event(&self, event: &MonitorEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
