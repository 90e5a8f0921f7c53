//! Error types for broker topology, transports and RPC.

use std::time::Duration;

use courier_core::CodecError;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised by transports and the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Opening a connection failed.
    #[error("connection to broker '{broker}' failed: {reason}")]
    ConnectionFailed { broker: String, reason: String },

    /// The connection or session was closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The broker is disconnected and the operation was not attempted.
    #[error("broker '{broker}' is not connected")]
    NotConnected { broker: String },

    /// No broker with this name is configured.
    #[error("broker '{0}' is not configured")]
    UnknownBroker(String),

    /// The exchange does not exist.
    #[error("exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// The queue does not exist.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// A declaration conflicts with an existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The channel-encoded payload is malformed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The manager is shutting down.
    #[error("connection manager is shutting down")]
    ShuttingDown,
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// Topology Errors
// =============================================================================

/// Errors raised while composing and validating topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Two registries declared the same exchange, queue or message mapping.
    #[error("topology conflict on broker '{broker}': {detail}")]
    Conflict { broker: String, detail: String },

    /// An entity failed validation.
    #[error("invalid definition '{entity}': {reason}")]
    InvalidDefinition { entity: String, reason: String },
}

/// Result type for topology operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

// =============================================================================
// RPC Errors
// =============================================================================

/// Errors returned to the caller of an RPC request.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// No correlated reply arrived before the deadline.
    #[error("rpc request '{correlation_id}' timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    /// The broker is disconnected.
    #[error("broker '{broker}' is not connected")]
    NotConnected { broker: String },

    /// The request was cancelled before a reply arrived.
    #[error("rpc request '{correlation_id}' was cancelled")]
    Cancelled { correlation_id: String },

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The remote handler failed.
    #[error("remote handler failed: {0}")]
    Remote(String),
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected { broker } => Self::NotConnected { broker },
            other => Self::Transport(other),
        }
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

// =============================================================================
// Broker Errors
// =============================================================================

/// Errors raised by the broker publisher and subscriber host.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
