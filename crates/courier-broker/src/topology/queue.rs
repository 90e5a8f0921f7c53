//! Consumer-side queue entities and subscriptions.

use std::fmt;
use std::time::Duration;

use courier_core::dispatch::Dispatcher;
use courier_core::{BoxedMessage, CodecResult, MessageType, content_types};
use serde_json::Value;

use super::exchange::{ExchangeType, validate_binding};
use crate::error::{TopologyError, TopologyResult};
use crate::transport::{ConsumeOptions, QueueDeclaration};

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Turns a decoded value into a concrete message.
pub type MessageDecoder = fn(Value) -> CodecResult<BoxedMessage>;

/// A queue and its binding to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    pub(crate) broker: String,
    pub(crate) name: Option<String>,
    pub(crate) exchange: Option<String>,
    pub(crate) exchange_type: ExchangeType,
    pub(crate) route_keys: Vec<String>,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) max_priority: Option<u8>,
    pub(crate) prefetch_count: u16,
    pub(crate) priority: Option<i32>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) message_ttl: Option<Duration>,
    pub(crate) no_ack: bool,
    pub(crate) replies: bool,
    pub(crate) content_type: String,
}

impl QueueDefinition {
    pub(crate) fn new(broker: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            broker: broker.into(),
            name: None,
            exchange: None,
            exchange_type,
            route_keys: Vec::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            max_priority: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            priority: None,
            dead_letter_exchange: None,
            message_ttl: None,
            no_ack: false,
            replies: false,
            content_type: content_types::JSON.to_string(),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// The queue name; `None` when the broker assigns one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The exchange the queue is bound to; `None` for the default exchange.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn route_keys(&self) -> &[String] {
        &self.route_keys
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn max_priority(&self) -> Option<u8> {
        self.max_priority
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl
    }

    pub fn is_no_ack(&self) -> bool {
        self.no_ack
    }

    /// Whether handler replies are published back to the requester.
    pub fn sends_replies(&self) -> bool {
        self.replies
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// A label for logs: the queue name, or the bound exchange.
    pub fn label(&self) -> String {
        match (&self.name, &self.exchange) {
            (Some(name), _) => name.clone(),
            (None, Some(exchange)) => format!("{exchange}:<generated>"),
            (None, None) => "<generated>".to_string(),
        }
    }

    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.name.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            max_priority: self.max_priority,
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            message_ttl: self.message_ttl,
        }
    }

    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            prefetch_count: self.prefetch_count,
            no_ack: self.no_ack,
            priority: self.priority,
        }
    }

    /// Binding keys to use; fanout exchanges bind once with an empty key.
    pub fn binding_keys(&self) -> Vec<String> {
        match self.exchange_type {
            ExchangeType::Fanout => vec![String::new()],
            _ => self.route_keys.clone(),
        }
    }

    pub fn validate(&self) -> TopologyResult<()> {
        let invalid = |reason: String| TopologyError::InvalidDefinition {
            entity: format!("{}:{}", self.broker, self.label()),
            reason,
        };

        match self.exchange_type {
            ExchangeType::Direct | ExchangeType::Topic | ExchangeType::Fanout => {
                if self.exchange.as_deref().is_none_or(str::is_empty) {
                    return Err(invalid("subscriptions require an exchange name".into()));
                }
                if self.exchange_type.requires_route_key() && self.route_keys.is_empty() {
                    return Err(invalid(format!(
                        "{} subscriptions require at least one route key",
                        self.exchange_type
                    )));
                }
                for key in &self.route_keys {
                    validate_binding(self.exchange_type, key).map_err(&invalid)?;
                }
            }
            ExchangeType::WorkQueue | ExchangeType::Rpc => {
                if self.exchange.is_some() {
                    return Err(invalid("queue subscriptions must not name an exchange".into()));
                }
                if self.name.as_deref().is_none_or(str::is_empty) {
                    return Err(invalid("queue subscriptions require a queue name".into()));
                }
                if self.exchange_type == ExchangeType::Rpc && !self.no_ack {
                    return Err(invalid("rpc queues must use no-ack delivery".into()));
                }
            }
        }

        if self.max_priority == Some(0) {
            return Err(invalid("max priority must be at least 1".into()));
        }
        Ok(())
    }
}

/// A queue this service consumes, with the dispatcher its messages go to.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) queue: QueueDefinition,
    pub(crate) message_type: &'static MessageType,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) decoder: MessageDecoder,
    pub(crate) max_concurrent_calls: usize,
}

impl Subscription {
    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn message_type(&self) -> &'static MessageType {
        self.message_type
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Decodes an intermediate value into this subscription's message type.
    pub fn decode(&self, value: Value) -> CodecResult<BoxedMessage> {
        (self.decoder)(value)
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    pub fn validate(&self) -> TopologyResult<()> {
        self.queue.validate()?;

        let invalid = |reason: String| TopologyError::InvalidDefinition {
            entity: format!("{}:{}", self.queue.broker, self.queue.label()),
            reason,
        };

        if self.max_concurrent_calls == 0 {
            return Err(invalid("max concurrent calls must be at least 1".into()));
        }

        let handled = self.dispatcher.message_type();
        let exact = handled == self.message_type;
        if !exact && !(self.dispatcher.include_derived() && handled.is_assignable_from(self.message_type)) {
            return Err(invalid(format!(
                "dispatcher for '{}' cannot receive '{}'",
                handled.name(),
                self.message_type.name()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("message_type", &self.message_type.name())
            .field("dispatcher", &self.dispatcher)
            .field("max_concurrent_calls", &self.max_concurrent_calls)
            .finish()
    }
}
