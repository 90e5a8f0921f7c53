//! # Courier
//!
//! A typed message bus for commands, queries and domain events.
//!
//! ## Overview
//!
//! Messages are plain serde structs deriving [`Message`](courier_macros::Message).
//! Publishing runs a message through the router's pipeline and hands it to
//! every publisher in order: the local publisher dispatches to in-process
//! handlers, the broker publisher sends to the broker entity the topology
//! maps the message type to.
//!
//! ```text
//! ┌────────┐   ┌──────────────────────┐   ┌─────────────────┐
//! │ Router │──▶│ enrich → pre-filters │──▶│ LocalPublisher  │──▶ dispatchers
//! └────────┘   └──────────────────────┘   │ BrokerPublisher │──▶ exchanges / queues
//!                                         └─────────────────┘
//!                                                  │
//!                                 post-filters ◀───┘
//! ```
//!
//! - **Core**: messages, envelopes, codecs, dispatch, pipeline, router
//! - **Broker**: topology DSL, transports, connections, subscribers, RPC
//! - **Runtime**: configuration, logging, lifecycle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! #[message(kind = "event")]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RuntimeError> {
//!     let runtime = MessagingRuntime::builder()
//!         .routes(MessageRoutes::new("orders").dispatcher(
//!             Dispatcher::on::<OrderPlaced>().handle(|order| async move {
//!                 tracing::info!(id = order.id, "Order placed");
//!                 Ok(())
//!             }),
//!         ))
//!         .build()?;
//!
//!     runtime.start().await?;
//!     runtime.publish(OrderPlaced { id: 7 }).await?;
//!     runtime.stop().await
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use courier_broker as broker;
pub use courier_core as core;
pub use courier_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use courier::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use courier_runtime::{
        CourierConfig, MessageRoutes, MessagingRuntime, RuntimeError, RuntimeResult,
    };

    // Messages
    pub use courier_core::{
        AnyMessage, Envelope, Message, MessageKind, MessageProperties, MessageType,
    };
    pub use courier_macros::Message;

    // Handlers
    pub use courier_core::{
        BoxError, DispatchRegistry, Dispatcher, HandlerResult, MessageContext, Reply,
    };

    // Pipeline and publishing
    pub use courier_core::{
        Enricher, FilterDecision, MessageRouter, PostFilter, PreFilter, Publisher,
    };

    // Broker topology
    pub use courier_broker::{ExchangeType, TopologyBuilder, TopologyRegistry, topology_registry};

    pub use std::sync::Arc;
}
