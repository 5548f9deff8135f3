//! Error types for the Weft engine
//!
//! Language faults travel through node execution as [`Fault`](crate::Fault)
//! values; the enums here cover failures of the engine itself and of the
//! boundaries it exposes (dispatch, transport, configuration).

use std::io;
use thiserror::Error;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Message dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The init process failed or timed out
    #[error("Initialization failed: {0}")]
    Init(String),

    /// Worker pool could not be created
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Invalid engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The worker pool needs at least one thread
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    /// A context must be allowed to run at least one continuation per quantum
    #[error("quantum must be at least 1")]
    ZeroQuantum,
}

/// Inbound message could not be routed to a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The service declares no such input operation
    #[error("Unknown operation '{0}'")]
    UnknownOperation(String),

    /// The payload does not match the declared request type
    #[error("Request for '{operation}' rejected: {detail}")]
    TypeMismatch {
        /// Operation name
        operation: String,
        /// Type checker output
        detail: String,
    },

    /// No session accepts the message
    #[error("No session correlates with message for '{0}'")]
    Uncorrelated(String),

    /// The engine no longer accepts messages
    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Convenience result alias for dispatch operations
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Failures reported by communication channels
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No output port with this id
    #[error("Unknown output port '{0}'")]
    UnknownPort(String),

    /// Channel closed before the message could be sent
    #[error("Channel closed: {0}")]
    Closed(String),

    /// The receiving side refused the message
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// Payload could not be marshalled
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Convenience result alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;
