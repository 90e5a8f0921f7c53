//! Enrichment and filtering around the publisher chain.
//!
//! - [`Enricher`]s run first and may only add or change properties and
//!   attributes. They cannot stop a message.
//! - [`PreFilter`]s run next. The first veto stops publishing; errors are
//!   collected and reported together.
//! - [`PostFilter`]s run after the publisher chain, whatever its outcome.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BoxError, FilterError, FilterErrors, FilterStage, PublishResult};
use crate::foundation::{AnyMessage, Attributes, Envelope, MessageProperties};

// ============================================================================
// Enrichment
// ============================================================================

/// What an enricher is allowed to see and change.
pub struct EnrichmentContext<'a> {
    message: &'a dyn AnyMessage,
    properties: &'a mut MessageProperties,
    attributes: &'a mut Attributes,
}

impl<'a> EnrichmentContext<'a> {
    pub fn new(envelope: &'a mut Envelope) -> Self {
        let (message, properties, attributes) = envelope.parts_mut();
        Self {
            message,
            properties,
            attributes,
        }
    }

    pub fn message(&self) -> &dyn AnyMessage {
        self.message
    }

    pub fn properties(&self) -> &MessageProperties {
        self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        self.properties
    }

    pub fn attributes(&self) -> &Attributes {
        self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        self.attributes
    }
}

/// Adds properties or attributes to outgoing messages.
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    fn enrich(&self, ctx: &mut EnrichmentContext<'_>);
}

/// Assigns a UUID v4 message id when none is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageIdEnricher;

impl Enricher for MessageIdEnricher {
    fn name(&self) -> &str {
        "message-id"
    }

    fn enrich(&self, ctx: &mut EnrichmentContext<'_>) {
        ctx.properties_mut()
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());
    }
}

/// Sets the correlation id to the message id when none is set.
///
/// Register after [`MessageIdEnricher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationIdEnricher;

impl Enricher for CorrelationIdEnricher {
    fn name(&self) -> &str {
        "correlation-id"
    }

    fn enrich(&self, ctx: &mut EnrichmentContext<'_>) {
        let props = ctx.properties_mut();
        if props.correlation_id.is_none() {
            props.correlation_id = props.message_id.clone();
        }
    }
}

/// Stamps the creation time when none is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreationTimeEnricher;

impl Enricher for CreationTimeEnricher {
    fn name(&self) -> &str {
        "creation-time"
    }

    fn enrich(&self, ctx: &mut EnrichmentContext<'_>) {
        ctx.properties_mut()
            .creation_time
            .get_or_insert_with(SystemTime::now);
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Result of a pre-publish filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Veto(String),
}

/// Runs before the publisher chain and may veto the message.
#[async_trait]
pub trait PreFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn filter(&self, envelope: &Envelope) -> Result<FilterDecision, BoxError>;
}

/// Runs after the publisher chain.
#[async_trait]
pub trait PostFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn after_publish(
        &self,
        envelope: &Envelope,
        outcome: &PublishResult<()>,
    ) -> Result<(), BoxError>;
}

/// Outcome of the pre-publish stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreFilterOutcome {
    Allowed,
    Vetoed { filter: String, reason: String },
}

// ============================================================================
// Pipeline
// ============================================================================

/// Ordered enrichers and filters.
#[derive(Clone, Default)]
pub struct Pipeline {
    enrichers: Vec<Arc<dyn Enricher>>,
    pre_filters: Vec<Arc<dyn PreFilter>>,
    post_filters: Vec<Arc<dyn PostFilter>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pipeline with the message-id, correlation-id and
    /// creation-time enrichers.
    pub fn with_default_enrichers() -> Self {
        let mut pipeline = Self::new();
        pipeline
            .add_enricher(MessageIdEnricher)
            .add_enricher(CorrelationIdEnricher)
            .add_enricher(CreationTimeEnricher);
        pipeline
    }

    pub fn add_enricher<E: Enricher + 'static>(&mut self, enricher: E) -> &mut Self {
        self.enrichers.push(Arc::new(enricher));
        self
    }

    pub fn add_pre_filter<F: PreFilter + 'static>(&mut self, filter: F) -> &mut Self {
        self.pre_filters.push(Arc::new(filter));
        self
    }

    pub fn add_post_filter<F: PostFilter + 'static>(&mut self, filter: F) -> &mut Self {
        self.post_filters.push(Arc::new(filter));
        self
    }

    pub fn push_enricher(&mut self, enricher: Arc<dyn Enricher>) -> &mut Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn push_pre_filter(&mut self, filter: Arc<dyn PreFilter>) -> &mut Self {
        self.pre_filters.push(filter);
        self
    }

    pub fn push_post_filter(&mut self, filter: Arc<dyn PostFilter>) -> &mut Self {
        self.post_filters.push(filter);
        self
    }

    /// Runs every enricher in order.
    pub fn enrich(&self, envelope: &mut Envelope) {
        let mut ctx = EnrichmentContext::new(envelope);
        for enricher in &self.enrichers {
            enricher.enrich(&mut ctx);
        }
    }

    /// Runs pre-publish filters until one vetoes.
    pub async fn pre_filter(&self, envelope: &Envelope) -> Result<PreFilterOutcome, FilterErrors> {
        let mut errors = Vec::new();
        let mut outcome = PreFilterOutcome::Allowed;

        for filter in &self.pre_filters {
            match filter.filter(envelope).await {
                Ok(FilterDecision::Allow) => {}
                Ok(FilterDecision::Veto(reason)) => {
                    debug!(filter = filter.name(), reason = %reason, "Message vetoed");
                    outcome = PreFilterOutcome::Vetoed {
                        filter: filter.name().to_string(),
                        reason,
                    };
                    break;
                }
                Err(error) => {
                    warn!(filter = filter.name(), error = %error, "Pre-publish filter failed");
                    errors.push(FilterError {
                        filter: filter.name().to_string(),
                        error,
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(outcome)
        } else {
            Err(FilterErrors {
                stage: FilterStage::Pre,
                errors,
            })
        }
    }

    /// Runs every post-publish filter.
    pub async fn post_filter(
        &self,
        envelope: &Envelope,
        outcome: &PublishResult<()>,
    ) -> Result<(), FilterErrors> {
        let mut errors = Vec::new();

        for filter in &self.post_filters {
            if let Err(error) = filter.after_publish(envelope, outcome).await {
                warn!(filter = filter.name(), error = %error, "Post-publish filter failed");
                errors.push(FilterError {
                    filter: filter.name().to_string(),
                    error,
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FilterErrors {
                stage: FilterStage::Post,
                errors,
            })
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("enrichers", &self.enrichers.iter().map(|e| e.name()).collect::<Vec<_>>())
            .field("pre_filters", &self.pre_filters.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("post_filters", &self.post_filters.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::{Message, MessageType, command, contexts};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Charge {
        cents: i64,
    }

    impl Message for Charge {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::Charge", "Charge", command);
            &TYPE
        }
    }

    struct TenantEnricher;

    impl Enricher for TenantEnricher {
        fn name(&self) -> &str {
            "tenant"
        }

        fn enrich(&self, ctx: &mut EnrichmentContext<'_>) {
            ctx.attributes_mut().set(contexts::APPLICATION, "tenant", "acme");
        }
    }

    struct NegativeAmount;

    #[async_trait]
    impl PreFilter for NegativeAmount {
        fn name(&self) -> &str {
            "negative-amount"
        }

        async fn filter(&self, envelope: &Envelope) -> Result<FilterDecision, BoxError> {
            match envelope.message::<Charge>() {
                Some(charge) if charge.cents < 0 => Ok(FilterDecision::Veto("negative".into())),
                _ => Ok(FilterDecision::Allow),
            }
        }
    }

    struct Broken;

    #[async_trait]
    impl PreFilter for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn filter(&self, _envelope: &Envelope) -> Result<FilterDecision, BoxError> {
            Err("unavailable".into())
        }
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl PreFilter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn filter(&self, _envelope: &Envelope) -> Result<FilterDecision, BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(FilterDecision::Allow)
        }
    }

    #[test]
    fn test_default_enrichers() {
        let pipeline = Pipeline::with_default_enrichers();
        let mut envelope = Envelope::new(Charge { cents: 10 });
        pipeline.enrich(&mut envelope);

        let id = envelope.message_id().unwrap().to_string();
        assert_eq!(envelope.correlation_id(), Some(id.as_str()));
        assert!(envelope.properties().creation_time.is_some());

        let mut envelope = Envelope::new(Charge { cents: 10 }).with_correlation_id("corr-1");
        pipeline.enrich(&mut envelope);
        assert_eq!(envelope.correlation_id(), Some("corr-1"));
    }

    #[test]
    fn test_custom_enricher_sets_attribute() {
        let mut pipeline = Pipeline::new();
        pipeline.add_enricher(TenantEnricher);

        let mut envelope = Envelope::new(Charge { cents: 1 });
        pipeline.enrich(&mut envelope);
        assert_eq!(envelope.attributes().get(contexts::APPLICATION, "tenant"), Some("acme"));
    }

    #[tokio::test]
    async fn test_veto_stops_remaining_filters() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_pre_filter(NegativeAmount)
            .add_pre_filter(Counting(Arc::clone(&counter)));

        let vetoed = pipeline
            .pre_filter(&Envelope::new(Charge { cents: -5 }))
            .await
            .unwrap();
        assert_eq!(
            vetoed,
            PreFilterOutcome::Vetoed {
                filter: "negative-amount".into(),
                reason: "negative".into(),
            }
        );
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let allowed = pipeline
            .pre_filter(&Envelope::new(Charge { cents: 5 }))
            .await
            .unwrap();
        assert_eq!(allowed, PreFilterOutcome::Allowed);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_filter_errors_are_collected() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_pre_filter(Broken)
            .add_pre_filter(Counting(Arc::clone(&counter)))
            .add_pre_filter(Broken);

        let err = pipeline
            .pre_filter(&Envelope::new(Charge { cents: 5 }))
            .await
            .unwrap_err();
        assert_eq!(err.stage, FilterStage::Pre);
        assert_eq!(err.errors.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
