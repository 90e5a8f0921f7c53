//! Unified error types for the Courier core.
//!
//! Aggregate errors ([`DispatchError`], [`FilterErrors`], [`PublishError`])
//! keep every individual failure so callers can see which handler, filter or
//! publisher failed without the first failure hiding the rest.

use std::fmt;

use thiserror::Error;

/// Boxed error returned by handlers, filters and publishers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Codec Errors
// =============================================================================

/// Errors raised by the serializer registry and its codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// No codec is registered for the pair.
    #[error("no serializer registered for content type '{content_type}' with encoding '{encoding}'")]
    SerializerNotFound {
        content_type: String,
        encoding: String,
    },

    /// The content type string could not be parsed.
    #[error("invalid content type '{0}'")]
    InvalidContentType(String),

    /// Encoding failed.
    #[error("failed to encode as '{content_type}': {reason}")]
    Encode { content_type: String, reason: String },

    /// Decoding failed.
    #[error("failed to decode '{content_type}': {reason}")]
    Decode { content_type: String, reason: String },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// =============================================================================
// Dispatch Errors
// =============================================================================

/// The envelope body could not be viewed as the handler's message type.
#[derive(Debug, Clone, Error)]
#[error("message '{actual}' cannot be viewed as '{expected}'")]
pub struct MessageMismatch {
    pub expected: &'static str,
    pub actual: &'static str,
}

/// A single failed handler invocation.
#[derive(Debug, Error)]
#[error("{dispatcher}: {error}")]
pub struct HandlerFailure {
    /// Display name of the dispatcher (`consumer::handler`).
    pub dispatcher: String,
    pub error: BoxError,
}

/// One or more handlers failed while dispatching a message.
///
/// Handlers that succeeded still ran; this error lists only the failures.
#[derive(Debug, Error)]
#[error("{} handler(s) failed for '{message_type}': {}", .failures.len(), join(.failures))]
pub struct DispatchError {
    pub message_type: &'static str,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchError {
    /// Returns the names of the failed dispatchers, in invocation order.
    pub fn dispatchers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.dispatcher.as_str()).collect()
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

// =============================================================================
// Filter Errors
// =============================================================================

/// Pipeline stage a filter runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Pre,
    Post,
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => f.write_str("pre-publish"),
            Self::Post => f.write_str("post-publish"),
        }
    }
}

/// A single filter that raised an error.
#[derive(Debug, Error)]
#[error("filter '{filter}' failed: {error}")]
pub struct FilterError {
    pub filter: String,
    pub error: BoxError,
}

/// Every filter error raised in one stage.
#[derive(Debug, Error)]
#[error("{} {stage} filter(s) failed: {}", .errors.len(), join(.errors))]
pub struct FilterErrors {
    pub stage: FilterStage,
    pub errors: Vec<FilterError>,
}

// =============================================================================
// Publish Errors
// =============================================================================

/// A single publisher that failed.
#[derive(Debug, Error)]
#[error("publisher '{publisher}' failed: {error}")]
pub struct PublisherFailure {
    pub publisher: String,
    pub error: BoxError,
}

/// One or more publishers in a chain failed.
///
/// The remaining publishers were still invoked.
#[derive(Debug, Error)]
#[error("{} publisher(s) failed: {}", .failures.len(), join(.failures))]
pub struct PublishError {
    pub failures: Vec<PublisherFailure>,
}

impl PublishError {
    /// Returns the names of the failed publishers, in chain order.
    pub fn publishers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.publisher.as_str()).collect()
    }
}

/// Result type for publish operations.
pub type PublishResult<T> = Result<T, PublishError>;

// =============================================================================
// Router Errors
// =============================================================================

/// Errors returned by [`MessageRouter`](crate::router::MessageRouter).
#[derive(Debug, Error)]
pub enum RouterError {
    /// One or more pre-publish filters raised an error.
    #[error(transparent)]
    PreFilter(FilterErrors),

    /// The publisher chain failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Publishing succeeded but post-publish filters raised errors.
    #[error(transparent)]
    PostFilter(FilterErrors),

    /// A request was vetoed before any publisher ran.
    #[error("request vetoed by '{filter}': {reason}")]
    Vetoed { filter: String, reason: String },

    /// A request completed without any handler producing a reply.
    #[error("no reply produced for '{message_type}'")]
    MissingReply { message_type: &'static str },

    /// The reply could not be converted to the requested type.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
