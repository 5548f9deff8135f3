//! Typed faults raised by process nodes

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::value::Value;

/// Fault raised when a value does not match a declared type.
pub const TYPE_MISMATCH: &str = "TypeMismatch";

/// Fault raised when a message cannot be sent or received.
pub const IO_EXCEPTION: &str = "IOException";

/// Fault returned when an inbound message matches no session.
pub const CORRELATION_ERROR: &str = "CorrelationError";

/// Fault raised by arithmetic on invalid operands.
pub const ARITHMETIC_EXCEPTION: &str = "ArithmeticException";

/// Handler name that catches any fault without a dedicated handler.
pub const DEFAULT_HANDLER: &str = "default";

/// A named fault carrying a value.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("fault {name}")]
pub struct Fault {
    /// Fault name, matched against installed handlers
    pub name: String,
    /// Value attached to the fault
    pub value: Value,
}

impl Fault {
    /// Fault with an undefined value.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::new(),
        }
    }

    /// Fault carrying `value`.
    pub fn with_value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// `TypeMismatch` with a textual detail.
    pub fn type_mismatch(detail: impl Into<String>) -> Self {
        Self::with_value(TYPE_MISMATCH, detail.into())
    }

    /// `IOException` with a textual detail.
    pub fn io_exception(detail: impl Into<String>) -> Self {
        Self::with_value(IO_EXCEPTION, detail.into())
    }

    /// `CorrelationError` with a textual detail.
    pub fn correlation_error(detail: impl Into<String>) -> Self {
        Self::with_value(CORRELATION_ERROR, detail.into())
    }

    /// `ArithmeticException` with a textual detail.
    pub fn arithmetic(detail: impl Into<String>) -> Self {
        Self::with_value(ARITHMETIC_EXCEPTION, detail.into())
    }

    /// True when the fault has the given name.
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}
