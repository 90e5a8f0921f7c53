//! Runtime error types.

use courier_broker::{BrokerError, TopologyError, TransportError};
use courier_core::RouterError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::logging::LoggingError;

/// Errors raised while building and running a [`MessagingRuntime`](crate::MessagingRuntime).
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    /// Topology composition or validation failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Router(#[from] RouterError),

    /// More than one router component was registered.
    #[error("Only one router component may be registered, found '{first}' and '{second}'")]
    DuplicateRouter { first: String, second: String },

    /// Topology references a broker without connection settings.
    #[error("Broker '{0}' is used by the topology but not configured")]
    UnconfiguredBroker(String),

    /// No transport handles the broker URL's scheme.
    #[error("No transport for scheme '{scheme}' of broker '{broker}'")]
    UnsupportedTransport { broker: String, scheme: String },

    /// The runtime was stopped and cannot be started again.
    #[error("Runtime has been stopped")]
    Stopped,
}

impl From<TransportError> for RuntimeError {
    fn from(err: TransportError) -> Self {
        Self::Broker(err.into())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
