//! The message router: the entry point for publishing and sending.
//!
//! For every message the router:
//!
//! 1. Runs the enrichers on the owned envelope
//! 2. Runs the pre-publish filters, stopping on the first veto
//! 3. Invokes the publisher chain
//! 4. Runs the post-publish filters
//!
//! Publisher failures take precedence over post-filter failures; the latter
//! are logged when both occur.
//!
//! # Tower Service Integration
//!
//! [`RouterService`] implements `tower::Service<Envelope>` so middleware can
//! be layered in front of the router:
//!
//! ```rust,ignore
//! let service = ServiceBuilder::new()
//!     .concurrency_limit(64)
//!     .service(router.into_service());
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tower::Service;
use tracing::{Instrument, Level, debug, span, warn};

use crate::dispatch::BoxFuture;
use crate::error::{RouterError, RouterResult};
use crate::foundation::{Envelope, Message};
use crate::pipeline::{Pipeline, PreFilterOutcome};
use crate::publisher::{BoxedPublisher, PublisherChain};

/// Outcome of a publish call that passed the pre-publish stage, or was vetoed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Vetoed { filter: String, reason: String },
}

/// Returned by [`MessageRouter::publish`].
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    envelope: Arc<Envelope>,
    outcome: PublishOutcome,
}

impl PublishReceipt {
    /// The enriched envelope as published.
    pub fn envelope(&self) -> &Arc<Envelope> {
        &self.envelope
    }

    pub fn outcome(&self) -> &PublishOutcome {
        &self.outcome
    }

    pub fn is_delivered(&self) -> bool {
        self.outcome == PublishOutcome::Delivered
    }

    pub fn message_id(&self) -> Option<&str> {
        self.envelope.message_id()
    }
}

/// Routes messages through the pipeline and publisher chain.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    pipeline: Pipeline,
    chain: PublisherChain,
}

impl MessageRouter {
    pub fn new(pipeline: Pipeline, chain: PublisherChain) -> Self {
        Self { pipeline, chain }
    }

    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn chain(&self) -> &PublisherChain {
        &self.chain
    }

    /// Publishes a message.
    pub async fn publish<M: Message>(&self, message: M) -> RouterResult<PublishReceipt> {
        self.publish_envelope(Envelope::new(message)).await
    }

    /// Publishes a prepared envelope.
    pub async fn publish_envelope(&self, mut envelope: Envelope) -> RouterResult<PublishReceipt> {
        let message_type = envelope.message_type();
        let span = span!(Level::DEBUG, "publish", message_type = %message_type.name());

        async move {
            self.pipeline.enrich(&mut envelope);
            let envelope = Arc::new(envelope);

            match self
                .pipeline
                .pre_filter(&envelope)
                .await
                .map_err(RouterError::PreFilter)?
            {
                PreFilterOutcome::Allowed => {}
                PreFilterOutcome::Vetoed { filter, reason } => {
                    return Ok(PublishReceipt {
                        envelope,
                        outcome: PublishOutcome::Vetoed { filter, reason },
                    });
                }
            }

            let published = self.chain.publish(Arc::clone(&envelope)).await;
            let post = self.pipeline.post_filter(&envelope, &published).await;

            match (published, post) {
                (Err(publish_error), Err(post_error)) => {
                    warn!(error = %post_error, "Post-publish filters failed after publish error");
                    Err(RouterError::Publish(publish_error))
                }
                (Err(publish_error), Ok(())) => Err(RouterError::Publish(publish_error)),
                (Ok(()), Err(post_error)) => Err(RouterError::PostFilter(post_error)),
                (Ok(()), Ok(())) => {
                    debug!(message_id = ?envelope.message_id(), "Message published");
                    Ok(PublishReceipt {
                        envelope,
                        outcome: PublishOutcome::Delivered,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Sends a request and waits for its reply.
    ///
    /// The reply is whatever the first replying handler, local or remote,
    /// stored in the envelope.
    pub async fn send<R, M>(&self, message: M) -> RouterResult<R>
    where
        R: DeserializeOwned,
        M: Message,
    {
        self.request(Envelope::new(message)).await
    }

    /// Sends a prepared envelope as a request.
    pub async fn request<R: DeserializeOwned>(&self, envelope: Envelope) -> RouterResult<R> {
        let message_type = envelope.message_type();
        let receipt = self.publish_envelope(envelope).await?;

        if let PublishOutcome::Vetoed { filter, reason } = receipt.outcome {
            return Err(RouterError::Vetoed { filter, reason });
        }

        match receipt.envelope.reply_as::<R>() {
            Some(reply) => Ok(reply?),
            None => Err(RouterError::MissingReply {
                message_type: message_type.name(),
            }),
        }
    }

    /// Wraps the router in a `tower::Service`.
    pub fn into_service(self: Arc<Self>) -> RouterService {
        RouterService { router: self }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`MessageRouter`].
#[derive(Default)]
pub struct RouterBuilder {
    pipeline: Pipeline,
    chain: PublisherChain,
}

impl RouterBuilder {
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn enricher<E: crate::pipeline::Enricher + 'static>(mut self, enricher: E) -> Self {
        self.pipeline.add_enricher(enricher);
        self
    }

    pub fn pre_filter<F: crate::pipeline::PreFilter + 'static>(mut self, filter: F) -> Self {
        self.pipeline.add_pre_filter(filter);
        self
    }

    pub fn post_filter<F: crate::pipeline::PostFilter + 'static>(mut self, filter: F) -> Self {
        self.pipeline.add_post_filter(filter);
        self
    }

    pub fn publisher<P: crate::publisher::Publisher + 'static>(mut self, publisher: P) -> Self {
        self.chain.add(publisher);
        self
    }

    pub fn boxed_publisher(mut self, publisher: BoxedPublisher) -> Self {
        self.chain.push(publisher);
        self
    }

    pub fn build(self) -> MessageRouter {
        MessageRouter::new(self.pipeline, self.chain)
    }
}

// ============================================================================
// Tower Service
// ============================================================================

/// `tower::Service` adapter over a shared router.
#[derive(Debug, Clone)]
pub struct RouterService {
    router: Arc<MessageRouter>,
}

impl Service<Envelope> for RouterService {
    type Response = RouterResult<PublishReceipt>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let router = Arc::clone(&self.router);
        async move { Ok(router.publish_envelope(envelope).await) }.boxed()
    }
}
