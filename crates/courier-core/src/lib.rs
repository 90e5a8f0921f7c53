//! # Courier Core
//!
//! The in-process engine of the Courier message bus.
//!
//! ## Layers
//!
//! ### Foundation
//!
//! - **Message Model**: Typed messages with a static type hierarchy
//!   ([`Message`], [`MessageType`], [`AnyMessage`])
//! - **Envelope**: Message plus properties, attributes and reply slot ([`Envelope`])
//! - **Codecs**: Content-type keyed serialization ([`SerializerRegistry`])
//!
//! ### Dispatch
//!
//! - **Dispatchers**: Handlers bound to message types ([`Dispatcher`])
//! - **Resolution**: Lineage-aware handler lookup ([`DispatchResolver`])
//!
//! ### Publishing
//!
//! - **Pipeline**: Enrichers, pre-filters and post-filters ([`Pipeline`])
//! - **Publishers**: Local and external delivery ([`Publisher`], [`PublisherChain`])
//! - **Router**: The entry point for publish and send ([`MessageRouter`])
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌─────────────────┐   ┌─────────────┐
//! │ publish  │──▶│ enrichers │──▶│ pre-filter │──▶│ publisher chain │──▶│ post-filter │
//! └──────────┘   └───────────┘   └────────────┘   │  local ──▶ handlers   └─────────────┘
//!                                                 │  broker ──▶ exchange
//!                                                 └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_core::prelude::*;
//!
//! let resolver = DispatchRegistry::new()
//!     .with(Dispatcher::on::<OrderPlaced>().handle(|ctx| async move {
//!         println!("order {}", ctx.order_id);
//!         Ok(())
//!     }))
//!     .build();
//!
//! let router = MessageRouter::builder()
//!     .pipeline(Pipeline::with_default_enrichers())
//!     .publisher(LocalPublisher::new(Arc::new(resolver)))
//!     .build();
//!
//! router.publish(OrderPlaced { order_id: "o-1".into() }).await?;
//! ```

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod foundation;
pub mod pipeline;
pub mod publisher;
pub mod router;

pub use codec::{Codec, ContentType, JsonCodec, SerializerRegistry, YamlCodec, content_types};
pub use dispatch::{
    BoxFuture, Consumer, DispatchRegistry, DispatchReport, DispatchResolver, Dispatcher,
    HandlerResult, IntoReply, MessageContext, Reply,
};
pub use error::{
    BoxError, CodecError, CodecResult, DispatchError, DispatchResult, FilterError, FilterErrors,
    FilterStage, HandlerFailure, MessageMismatch, PublishError, PublishResult, PublisherFailure,
    RouterError, RouterResult,
};
pub use foundation::{
    AnyMessage, Attributes, BoxedMessage, Envelope, Message, MessageKind, MessageProperties,
    MessageType, command, contexts, decode_boxed, domain_event, query,
};
pub use pipeline::{
    CorrelationIdEnricher, CreationTimeEnricher, EnrichmentContext, Enricher, FilterDecision,
    MessageIdEnricher, Pipeline, PostFilter, PreFilter, PreFilterOutcome,
};
pub use publisher::{BoxedPublisher, IntegrationType, LocalPublisher, Publisher, PublisherChain};
pub use router::{MessageRouter, PublishOutcome, PublishReceipt, RouterBuilder, RouterService};

// Used by `#[derive(Message)]` expansions.
#[doc(hidden)]
pub use serde_json::Value as __JsonValue;

/// Prelude for common imports.
pub mod prelude {
    pub use super::dispatch::{Consumer, DispatchRegistry, Dispatcher, HandlerResult, MessageContext, Reply};
    pub use super::foundation::*;
    pub use super::pipeline::{Enricher, FilterDecision, Pipeline, PostFilter, PreFilter};
    pub use super::publisher::{IntegrationType, LocalPublisher, Publisher};
    pub use super::router::MessageRouter;
    pub use std::sync::Arc;
}
