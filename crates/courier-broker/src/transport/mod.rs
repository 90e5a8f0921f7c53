//! Broker client abstraction.
//!
//! A broker client is modelled as three layers:
//!
//! - [`BrokerTransport`] opens connections to a broker URL
//! - [`BrokerConnection`] is long-lived and shared; it reports when it closes
//! - [`BrokerSession`] is a channel used to declare entities, publish and
//!   consume
//!
//! [`memory::MemoryBroker`] implements all three in-process.

pub mod memory;
pub mod payload;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportResult;

pub use memory::MemoryBroker;
pub use payload::{decode_payload, encode_payload};

// =============================================================================
// Declarations
// =============================================================================

/// Routing behaviour of a named exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Topic => write!(f, "topic"),
            Self::Fanout => write!(f, "fanout"),
        }
    }
}

/// Parameters for declaring an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Only check that the exchange exists.
    pub passive: bool,
    /// Receives messages no queue was bound for.
    pub alternate_exchange: Option<String>,
}

/// Parameters for declaring a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueDeclaration {
    /// `None` asks the broker to generate a name.
    pub name: Option<String>,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub max_priority: Option<u8>,
    pub dead_letter_exchange: Option<String>,
    pub message_ttl: Option<Duration>,
}

/// Parameters for consuming a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries; `0` means unbounded.
    pub prefetch_count: u16,
    pub no_ack: bool,
    pub priority: Option<i32>,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: crate::topology::DEFAULT_PREFETCH_COUNT,
            no_ack: false,
            priority: None,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Transport-level properties set on every outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProperties {
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub creation_time: Option<SystemTime>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub absolute_expiry: Option<SystemTime>,
    pub time_to_live: Option<Duration>,
}

/// A message as the broker sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMessage {
    pub properties: WireProperties,
    pub headers: BTreeMap<String, String>,
    pub priority: Option<u8>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            properties: WireProperties {
                content_type: content_type.into(),
                ..Default::default()
            },
            body,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.properties.time_to_live = Some(ttl);
        self
    }
}

/// Settles deliveries with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> TransportResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()>;
}

/// A message received from a queue.
pub struct Delivery {
    pub message: TransportMessage,
    pub exchange: String,
    pub route_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(
        message: TransportMessage,
        exchange: impl Into<String>,
        route_key: impl Into<String>,
        delivery_tag: u64,
    ) -> Self {
        Self {
            message,
            exchange: exchange.into(),
            route_key: route_key.into(),
            redelivered: false,
            delivery_tag,
            acker: None,
        }
    }

    /// Attaches the acknowledger; deliveries without one were auto-acked.
    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    pub async fn ack(&self) -> TransportResult<()> {
        match &self.acker {
            Some(acker) => acker.ack(self.delivery_tag).await,
            None => Ok(()),
        }
    }

    pub async fn nack(&self, requeue: bool) -> TransportResult<()> {
        match &self.acker {
            Some(acker) => acker.nack(self.delivery_tag, requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("route_key", &self.route_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}

/// Deliveries for one consumer. Dropping the stream cancels the consumer.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

// =============================================================================
// Client Traits
// =============================================================================

/// Opens connections to a broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn BrokerConnection>>;
}

/// A long-lived connection to a broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Whether one session may be used by concurrent operations.
    fn shared_sessions(&self) -> bool {
        false
    }

    async fn open_session(&self) -> TransportResult<Arc<dyn BrokerSession>>;

    /// Resolves with the close reason once the connection is gone.
    async fn closed(&self) -> String;

    async fn close(&self);
}

/// A channel on a connection.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> TransportResult<()>;

    /// Declares a queue and returns its name.
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> TransportResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, route_key: &str) -> TransportResult<()>;

    /// Publishes to an exchange; the empty name is the default exchange.
    async fn publish(
        &self,
        exchange: &str,
        route_key: &str,
        message: TransportMessage,
    ) -> TransportResult<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> TransportResult<DeliveryStream>;

    async fn close(&self);
}
