//! Weft – a session-oriented orchestration runtime
//!
//! This crate executes service behaviours written as trees of process nodes:
//! - Sequence, parallel, choice and loop composition driven by a continuation queue
//! - Scoped fault handling with saga-style compensation
//! - Correlation of inbound messages to the sessions waiting for them
//! - Process-wide mutual exclusion shared across sessions
//! - Cooperative multiplexing of many sessions over a bounded worker pool

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Process nodes, value trees and their step semantics
pub mod interpreter;

/// Engine, sessions, scheduling and message dispatch
pub mod runtime;

/// Helpers shared across modules
pub mod util;

// Re-export key types for convenience
pub use interpreter::{Fault, Node, Value, VariablePath};
pub use runtime::{Engine, EngineConfig};

/// Current version of the Weft runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
