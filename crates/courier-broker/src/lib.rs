//! # Courier Broker
//!
//! Connects the in-process router to message brokers.
//!
//! ## Components
//!
//! - **Topology**: A DSL mapping message types to exchanges and queues
//!   ([`TopologyBuilder`], [`TopologyRegistry`], [`Topology`])
//! - **Transports**: The broker client abstraction and an in-memory broker
//!   ([`BrokerTransport`], [`MemoryBroker`])
//! - **Connections**: Lazily opened, supervised broker connections
//!   ([`ConnectionManager`])
//! - **Publishing**: The broker publisher for the router's chain
//!   ([`BrokerPublisher`])
//! - **Consuming**: Queue consumers dispatching to handlers ([`SubscriberHost`])
//! - **RPC**: Request/response over reply queues ([`RpcClient`], [`RpcCorrelator`])
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_broker::prelude::*;
//!
//! let orders = topology_registry("orders", "main", |t| {
//!     t.define_exchange::<OrderPlaced>("orders", ExchangeType::Topic)
//!         .route_key_fn(|order| format!("orders.{}", order.region));
//!     t.subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Topic, ship_order)
//!         .route_key("orders.*");
//! });
//!
//! let topology = Arc::new(Topology::compose([&orders as &dyn TopologyRegistry])?);
//! let connections = Arc::new(ConnectionManager::new().with_broker(
//!     "main",
//!     Arc::new(MemoryBroker::new()),
//!     BrokerOptions::default(),
//! ));
//! ```

pub mod connection;
pub mod error;
pub mod properties;
pub mod publisher;
pub mod rpc;
pub mod subscriber;
pub mod topology;
pub mod transport;

pub use connection::{BrokerOptions, ConnectionEvent, ConnectionManager, ConnectionStatus, SessionGuard};
pub use error::{
    BrokerError, BrokerResult, RpcError, RpcResult, TopologyError, TopologyResult, TransportError,
    TransportResult,
};
pub use properties::WireCodec;
pub use publisher::BrokerPublisher;
pub use rpc::{PendingCall, RpcClient, RpcCorrelator, RpcState, RpcStats};
pub use subscriber::SubscriberHost;
pub use topology::{
    BrokerTopology, ExchangeConfig, ExchangeDefinition, ExchangeSettings, ExchangeType, QueueConfig,
    QueueDefinition, QueueSettings, Subscription, Topology, TopologyBuilder, TopologyRegistry,
    TopologySettings, topology_registry,
};
pub use transport::{
    BrokerConnection, BrokerSession, BrokerTransport, Delivery, MemoryBroker, TransportMessage,
};

/// Prelude for common imports.
pub mod prelude {
    pub use super::connection::{BrokerOptions, ConnectionManager};
    pub use super::publisher::BrokerPublisher;
    pub use super::rpc::RpcClient;
    pub use super::subscriber::SubscriberHost;
    pub use super::topology::{ExchangeType, Topology, TopologyBuilder, TopologyRegistry, topology_registry};
    pub use super::transport::MemoryBroker;
    pub use std::sync::Arc;
}
