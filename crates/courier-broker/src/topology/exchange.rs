//! Publisher-side exchange entities.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_core::dispatch::Predicate;
use courier_core::{AnyMessage, CodecError, CodecResult, MessageType, content_types};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::route_key::{RouteKey, validate_topic_pattern};
use crate::error::{TopologyError, TopologyResult};
use crate::transport::{ExchangeDeclaration, ExchangeKind};

/// Default time to wait for an RPC reply.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Routing behaviour of an exchange entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeType {
    /// Exact route-key match.
    Direct,
    /// Wildcard route-key match.
    Topic,
    /// Every bound queue.
    Fanout,
    /// Straight to one queue through the default exchange.
    WorkQueue,
    /// Request/reply through one queue.
    Rpc,
}

impl ExchangeType {
    /// The transport exchange kind, or `None` for the default exchange.
    pub fn transport_kind(self) -> Option<ExchangeKind> {
        match self {
            Self::Direct => Some(ExchangeKind::Direct),
            Self::Topic => Some(ExchangeKind::Topic),
            Self::Fanout => Some(ExchangeKind::Fanout),
            Self::WorkQueue | Self::Rpc => None,
        }
    }

    /// Whether messages need a route key.
    pub fn requires_route_key(self) -> bool {
        matches!(self, Self::Direct | Self::Topic)
    }

    /// Whether the entity sends to a queue on the default exchange.
    pub fn uses_default_exchange(self) -> bool {
        matches!(self, Self::WorkQueue | Self::Rpc)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
            Self::WorkQueue => "work-queue",
            Self::Rpc => "rpc",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "fanout" => Ok(Self::Fanout),
            "work-queue" | "workqueue" => Ok(Self::WorkQueue),
            "rpc" => Ok(Self::Rpc),
            other => Err(format!("unknown exchange type '{other}'")),
        }
    }
}

/// A message type's publishing entity on one broker.
#[derive(Clone)]
pub struct ExchangeDefinition {
    pub(crate) broker: String,
    pub(crate) message_type: &'static MessageType,
    pub(crate) name: Option<String>,
    pub(crate) exchange_type: ExchangeType,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) alternate_exchange: Option<String>,
    pub(crate) route_key: Option<RouteKey>,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) content_type: String,
    pub(crate) queue: Option<String>,
    pub(crate) no_ack: bool,
    pub(crate) rpc_timeout: Duration,
    pub(crate) time_to_live: Option<Duration>,
    pub(crate) response_type: Option<&'static MessageType>,
}

impl ExchangeDefinition {
    pub(crate) fn new(
        broker: impl Into<String>,
        message_type: &'static MessageType,
        exchange_type: ExchangeType,
    ) -> Self {
        Self {
            broker: broker.into(),
            message_type,
            name: None,
            exchange_type,
            durable: true,
            auto_delete: false,
            passive: false,
            alternate_exchange: None,
            route_key: None,
            predicate: None,
            content_type: content_types::JSON.to_string(),
            queue: None,
            no_ack: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            time_to_live: None,
            response_type: None,
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn message_type(&self) -> &'static MessageType {
        self.message_type
    }

    /// The exchange name; `None` for default-exchange entities.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    pub fn alternate_exchange(&self) -> Option<&str> {
        self.alternate_exchange.as_deref()
    }

    pub fn route_key(&self) -> Option<&RouteKey> {
        self.route_key.as_ref()
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The target queue of work-queue and RPC entities.
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn is_no_ack(&self) -> bool {
        self.no_ack
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub fn response_type(&self) -> Option<&'static MessageType> {
        self.response_type
    }

    /// The name external settings use to address this entity: the exchange
    /// name, or the target queue for default-exchange entities.
    pub fn entity_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.queue.as_deref())
            .unwrap_or_default()
    }

    /// The exchange to publish to; empty for the default exchange.
    pub fn publish_exchange(&self) -> &str {
        if self.exchange_type.uses_default_exchange() {
            ""
        } else {
            self.name.as_deref().unwrap_or_default()
        }
    }

    /// The route key for one message.
    pub fn route_key_for(&self, message: &dyn AnyMessage) -> String {
        if self.exchange_type.uses_default_exchange() {
            return self.queue.clone().unwrap_or_default();
        }
        self.route_key
            .as_ref()
            .map(|key| key.resolve(message))
            .unwrap_or_default()
    }

    /// The body sent for `message`, in the layout of this entity's type.
    ///
    /// A derived message is projected onto the ancestor the entity is bound
    /// to; its own type travels in the message type header.
    pub fn body_of(&self, message: &dyn AnyMessage) -> CodecResult<Value> {
        message
            .project_value(self.message_type)
            .unwrap_or_else(|| {
                Err(CodecError::Encode {
                    content_type: self.content_type.clone(),
                    reason: format!(
                        "'{}' is not a '{}'",
                        message.runtime_type().name(),
                        self.message_type.name()
                    ),
                })
            })
    }

    /// Evaluates the entity's message predicate.
    pub fn accepts(&self, message: &dyn AnyMessage) -> bool {
        self.predicate.as_ref().is_none_or(|predicate| predicate(message))
    }

    /// The transport declaration for this entity's exchange, if it has one.
    pub fn declaration(&self) -> Option<ExchangeDeclaration> {
        let kind = self.exchange_type.transport_kind()?;
        let name = self.name.clone()?;
        Some(ExchangeDeclaration {
            name,
            kind,
            durable: self.durable,
            auto_delete: self.auto_delete,
            passive: self.passive,
            alternate_exchange: self.alternate_exchange.clone(),
        })
    }

    /// Checks the entity's invariants.
    pub fn validate(&self) -> TopologyResult<()> {
        let invalid = |reason: &str| TopologyError::InvalidDefinition {
            entity: format!("{}:{}", self.broker, self.message_type.name()),
            reason: reason.to_string(),
        };

        let has_name = self.name.as_deref().is_some_and(|n| !n.is_empty());
        let has_queue = self.queue.as_deref().is_some_and(|q| !q.is_empty());

        match self.exchange_type {
            ExchangeType::Direct | ExchangeType::Topic => {
                if !has_name {
                    return Err(invalid("direct and topic exchanges require a name"));
                }
                match &self.route_key {
                    None => return Err(invalid("direct and topic exchanges require a route key")),
                    Some(key) if key.is_empty() => {
                        return Err(invalid("route key must not be empty"));
                    }
                    Some(_) => {}
                }
            }
            ExchangeType::Fanout => {
                if !has_name {
                    return Err(invalid("fanout exchanges require a name"));
                }
            }
            ExchangeType::WorkQueue => {
                if self.name.is_some() {
                    return Err(invalid("work-queue entities must not name an exchange"));
                }
                if !has_queue {
                    return Err(invalid("work-queue entities require a queue"));
                }
            }
            ExchangeType::Rpc => {
                if self.name.is_some() {
                    return Err(invalid("rpc entities must not name an exchange"));
                }
                if !has_queue {
                    return Err(invalid("rpc entities require a queue"));
                }
                if !self.no_ack {
                    return Err(invalid("rpc entities must use no-ack delivery"));
                }
            }
        }

        if self.rpc_timeout.is_zero() {
            return Err(invalid("rpc timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl fmt::Debug for ExchangeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeDefinition")
            .field("broker", &self.broker)
            .field("message_type", &self.message_type.name())
            .field("name", &self.name)
            .field("exchange_type", &self.exchange_type)
            .field("route_key", &self.route_key)
            .field("queue", &self.queue)
            .field("content_type", &self.content_type)
            .field("rpc_timeout", &self.rpc_timeout)
            .finish_non_exhaustive()
    }
}

/// Validates a topic binding pattern for an exchange of type `kind`.
pub(crate) fn validate_binding(kind: ExchangeType, key: &str) -> Result<(), String> {
    match kind {
        ExchangeType::Topic => validate_topic_pattern(key),
        ExchangeType::Direct if key.is_empty() => Err("direct bindings require a route key".into()),
        _ => Ok(()),
    }
}
