//! Publishers and the publisher chain.
//!
//! A publisher delivers an envelope somewhere: to in-process handlers
//! ([`LocalPublisher`]) or to an external broker. The [`PublisherChain`]
//! invokes every registered publisher in order and reports all failures
//! together.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::dispatch::DispatchResolver;
use crate::error::{BoxError, PublishError, PublishResult, PublisherFailure};
use crate::foundation::Envelope;

/// Where a publisher delivers messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrationType {
    /// In-process handlers.
    Local,
    /// An external system such as a message broker.
    External,
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Delivers envelopes.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    fn integration_type(&self) -> IntegrationType;

    /// Returns `true` if this publisher wants the message at all.
    ///
    /// Publishers that return `false` are skipped without error.
    fn accepts(&self, _envelope: &Envelope) -> bool {
        true
    }

    async fn publish(&self, envelope: Arc<Envelope>) -> Result<(), BoxError>;
}

/// A shared publisher.
pub type BoxedPublisher = Arc<dyn Publisher>;

// ============================================================================
// Chain
// ============================================================================

/// Ordered publishers invoked for every message.
#[derive(Clone, Default)]
pub struct PublisherChain {
    publishers: Vec<BoxedPublisher>,
}

impl PublisherChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P: Publisher + 'static>(&mut self, publisher: P) -> &mut Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    pub fn push(&mut self, publisher: BoxedPublisher) -> &mut Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with<P: Publisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn publisher_names(&self) -> Vec<&str> {
        self.publishers.iter().map(|p| p.name()).collect()
    }

    /// Invokes every publisher.
    ///
    /// A failing publisher does not stop the others.
    pub async fn publish(&self, envelope: Arc<Envelope>) -> PublishResult<()> {
        self.publish_where(envelope, |_| true).await
    }

    /// Invokes only the publishers of one integration type.
    pub async fn publish_stage(
        &self,
        envelope: Arc<Envelope>,
        stage: IntegrationType,
    ) -> PublishResult<()> {
        self.publish_where(envelope, |p| p.integration_type() == stage)
            .await
    }

    async fn publish_where<F>(&self, envelope: Arc<Envelope>, include: F) -> PublishResult<()>
    where
        F: Fn(&dyn Publisher) -> bool,
    {
        let mut failures = Vec::new();

        for publisher in &self.publishers {
            if !include(publisher.as_ref()) || !publisher.accepts(&envelope) {
                continue;
            }

            debug!(
                publisher = publisher.name(),
                integration = %publisher.integration_type(),
                message_type = %envelope.message_type().name(),
                "Publishing message"
            );

            if let Err(error) = publisher.publish(Arc::clone(&envelope)).await {
                warn!(publisher = publisher.name(), error = %error, "Publisher failed");
                failures.push(PublisherFailure {
                    publisher: publisher.name().to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PublishError { failures })
        }
    }
}

impl fmt::Debug for PublisherChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherChain")
            .field("publishers", &self.publisher_names())
            .finish()
    }
}

// ============================================================================
// Local Publisher
// ============================================================================

/// Dispatches envelopes to in-process handlers.
///
/// The first reply produced by a handler is stored in the envelope's reply
/// slot.
#[derive(Debug, Clone)]
pub struct LocalPublisher {
    resolver: Arc<DispatchResolver>,
}

impl LocalPublisher {
    pub fn new(resolver: Arc<DispatchResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &Arc<DispatchResolver> {
        &self.resolver
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    fn name(&self) -> &str {
        "local"
    }

    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Local
    }

    async fn publish(&self, envelope: Arc<Envelope>) -> Result<(), BoxError> {
        let report = self.resolver.dispatch(Arc::clone(&envelope)).await?;
        if let Some(reply) = report.first_reply() {
            envelope.set_reply(reply.clone());
        }
        Ok(())
    }
}
