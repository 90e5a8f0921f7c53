//! Message type system for the Courier bus.
//!
//! This module provides the type information the dispatcher needs to route
//! messages polymorphically:
//!
//! - [`MessageKind`] - Command, query or domain-event classification
//! - [`MessageType`] - Static descriptor with a parent link, forming a hierarchy
//! - [`Message`] - Trait implemented by every concrete message type
//! - [`AnyMessage`] - Object-safe erasure used once a message enters the bus
//!
//! # Type Hierarchy
//!
//! Every message type descends from one of three base descriptors
//! ([`command`], [`query`], [`domain_event`]). A derived message embeds its
//! parent as a field, which lets a handler registered for the parent receive
//! the parent's view of the derived message:
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! #[message(kind = "event")]
//! pub struct OrderEvent {
//!     pub order_id: String,
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! pub struct OrderShipped {
//!     #[message(parent)]
//!     pub order: OrderEvent,
//!     pub carrier: String,
//! }
//! ```

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CodecError, CodecResult};

// ============================================================================
// Message Kind
// ============================================================================

/// Classification of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A request to change state, handled by exactly one logical owner.
    Command,
    /// A request for data that does not change state.
    Query,
    /// A notification that something happened.
    DomainEvent,
}

impl MessageKind {
    /// Returns the base descriptor every message of this kind descends from.
    pub fn base_type(self) -> &'static MessageType {
        match self {
            Self::Command => command(),
            Self::Query => query(),
            Self::DomainEvent => domain_event(),
        }
    }

    /// Returns the kind as a lowercase string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Query => "query",
            Self::DomainEvent => "event",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(Self::Command),
            "query" => Ok(Self::Query),
            "event" | "domain_event" | "domain-event" => Ok(Self::DomainEvent),
            other => Err(format!("unknown message kind '{other}'")),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message Type Descriptor
// ============================================================================

/// Accessor for a parent descriptor.
///
/// Stored as a function pointer so descriptors can live in `static` items
/// and reference descriptors defined in other crates.
pub type ParentFn = fn() -> &'static MessageType;

/// Static type information for a message.
///
/// Descriptors are compared and hashed by their fully-qualified name.
pub struct MessageType {
    name: &'static str,
    short_name: &'static str,
    kind: Option<MessageKind>,
    parent: Option<ParentFn>,
}

static COMMAND: MessageType = MessageType::base("courier::Command", "Command", MessageKind::Command);
static QUERY: MessageType = MessageType::base("courier::Query", "Query", MessageKind::Query);
static DOMAIN_EVENT: MessageType =
    MessageType::base("courier::DomainEvent", "DomainEvent", MessageKind::DomainEvent);

/// The base descriptor of all commands.
pub fn command() -> &'static MessageType {
    &COMMAND
}

/// The base descriptor of all queries.
pub fn query() -> &'static MessageType {
    &QUERY
}

/// The base descriptor of all domain events.
pub fn domain_event() -> &'static MessageType {
    &DOMAIN_EVENT
}

impl MessageType {
    const fn base(name: &'static str, short_name: &'static str, kind: MessageKind) -> Self {
        Self {
            name,
            short_name,
            kind: Some(kind),
            parent: None,
        }
    }

    /// Creates a descriptor deriving from `parent`.
    ///
    /// `name` should be unique within the process; the derive macro uses the
    /// module path of the type.
    pub const fn new(name: &'static str, short_name: &'static str, parent: ParentFn) -> Self {
        Self {
            name,
            short_name,
            kind: None,
            parent: Some(parent),
        }
    }

    /// Returns the fully-qualified name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the unqualified type name.
    pub fn short_name(&self) -> &'static str {
        self.short_name
    }

    /// Returns the parent descriptor, if this is not a base type.
    pub fn parent(&self) -> Option<&'static MessageType> {
        self.parent.map(|parent| parent())
    }

    /// Returns `true` for the three base descriptors.
    pub fn is_base(&self) -> bool {
        self.kind.is_some()
    }

    /// Returns the kind inherited from the base of the hierarchy.
    pub fn kind(&self) -> MessageKind {
        self.lineage()
            .find_map(|ty| ty.kind)
            .unwrap_or(MessageKind::DomainEvent)
    }

    /// Iterates this type followed by every ancestor, nearest first.
    pub fn lineage(&self) -> Lineage<'_> {
        Lineage { next: Some(self) }
    }

    /// Returns `true` if a message of type `other` can be viewed as this type.
    pub fn is_assignable_from(&self, other: &MessageType) -> bool {
        other.lineage().any(|ty| ty == self)
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("parent", &self.parent().map(MessageType::name))
            .finish()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name)
    }
}

/// Iterator over a type and its ancestors.
#[derive(Debug, Clone)]
pub struct Lineage<'a> {
    next: Option<&'a MessageType>,
}

impl<'a> Iterator for Lineage<'a> {
    type Item = &'a MessageType;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

// ============================================================================
// Message Trait
// ============================================================================

/// A concrete, serializable message.
///
/// Implemented with `#[derive(Message)]`, or by hand:
///
/// ```rust,ignore
/// impl Message for PlaceOrder {
///     fn message_type() -> &'static MessageType {
///         static TYPE: MessageType = MessageType::new("shop::PlaceOrder", "PlaceOrder", command);
///         &TYPE
///     }
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Returns the static descriptor of this type.
    fn message_type() -> &'static MessageType;

    /// Projects this message onto `ty`, which must be this type or an ancestor.
    ///
    /// Derived messages override this to delegate to their embedded parent.
    fn view_as(&self, ty: &MessageType) -> Option<&dyn Any> {
        (ty == Self::message_type()).then_some(self as &dyn Any)
    }

    /// Serializes the projection of this message onto `ty`.
    ///
    /// Overridden together with [`view_as`](Message::view_as). Broker
    /// entities bound to an ancestor carry this value, so their consumers
    /// can decode it as the ancestor.
    fn value_as(&self, ty: &MessageType) -> Option<CodecResult<Value>> {
        (ty == Self::message_type()).then(|| to_json_value(self))
    }
}

fn to_json_value<T: Serialize>(value: &T) -> CodecResult<Value> {
    serde_json::to_value(value).map_err(|e| CodecError::Encode {
        content_type: "application/json".into(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Type-erased Message
// ============================================================================

/// Object-safe view of a [`Message`].
///
/// Implemented automatically for every `Message`.
pub trait AnyMessage: Any + Send + Sync + fmt::Debug {
    /// Returns the descriptor of the concrete runtime type.
    fn runtime_type(&self) -> &'static MessageType;

    /// Returns `self` as `Any` for downcasting to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Projects the message onto one of its ancestor types.
    fn project(&self, ty: &MessageType) -> Option<&dyn Any>;

    /// Serializes the message into an intermediate JSON value.
    fn to_value(&self) -> CodecResult<Value>;

    /// Serializes the message as one of its ancestor types.
    fn project_value(&self, ty: &MessageType) -> Option<CodecResult<Value>>;
}

impl<M: Message> AnyMessage for M {
    fn runtime_type(&self) -> &'static MessageType {
        M::message_type()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn project(&self, ty: &MessageType) -> Option<&dyn Any> {
        Message::view_as(self, ty)
    }

    fn to_value(&self) -> CodecResult<Value> {
        to_json_value(self)
    }

    fn project_value(&self, ty: &MessageType) -> Option<CodecResult<Value>> {
        Message::value_as(self, ty)
    }
}

impl dyn AnyMessage {
    /// Downcasts to the exact concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }

    /// Views the message as `M`, which may be the runtime type or an ancestor.
    pub fn view<M: Message>(&self) -> Option<&M> {
        self.project(M::message_type())?.downcast_ref()
    }

    /// Returns `true` if the message can be viewed as `M`.
    pub fn is<M: Message>(&self) -> bool {
        M::message_type().is_assignable_from(self.runtime_type())
    }
}

/// A shared, type-erased message.
pub type BoxedMessage = Arc<dyn AnyMessage>;

/// Decodes an intermediate value into a boxed message of type `M`.
///
/// Used as the decoder of broker subscriptions bound to `M`.
pub fn decode_boxed<M: Message>(value: Value) -> CodecResult<BoxedMessage> {
    let message: M = serde_json::from_value(value).map_err(|e| CodecError::Decode {
        content_type: "application/json".into(),
        reason: format!("{}: {e}", M::message_type().short_name()),
    })?;
    Ok(Arc::new(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderEvent {
        order_id: String,
    }

    impl Message for OrderEvent {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::OrderEvent", "OrderEvent", domain_event);
            &TYPE
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        order: OrderEvent,
        carrier: String,
    }

    impl Message for OrderShipped {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType =
                MessageType::new("tests::OrderShipped", "OrderShipped", OrderEvent::message_type);
            &TYPE
        }

        fn view_as(&self, ty: &MessageType) -> Option<&dyn Any> {
            if ty == Self::message_type() {
                return Some(self as &dyn Any);
            }
            Message::view_as(&self.order, ty)
        }

        fn value_as(&self, ty: &MessageType) -> Option<CodecResult<Value>> {
            if ty == Self::message_type() {
                return Some(self.to_value());
            }
            Message::value_as(&self.order, ty)
        }
    }

    #[test]
    fn test_lineage_walks_to_base() {
        let names: Vec<_> = OrderShipped::message_type()
            .lineage()
            .map(MessageType::short_name)
            .collect();
        assert_eq!(names, vec!["OrderShipped", "OrderEvent", "DomainEvent"]);
        assert_eq!(OrderShipped::message_type().kind(), MessageKind::DomainEvent);
    }

    #[test]
    fn test_assignability() {
        let parent = OrderEvent::message_type();
        let child = OrderShipped::message_type();
        assert!(parent.is_assignable_from(child));
        assert!(!child.is_assignable_from(parent));
        assert!(domain_event().is_assignable_from(child));
        assert!(!command().is_assignable_from(child));
    }

    #[test]
    fn test_view_projects_onto_parent() {
        let shipped = OrderShipped {
            order: OrderEvent {
                order_id: "o-1".into(),
            },
            carrier: "ups".into(),
        };
        let erased: BoxedMessage = Arc::new(shipped);

        assert!(erased.downcast_ref::<OrderEvent>().is_none());
        let parent = erased.view::<OrderEvent>().unwrap();
        assert_eq!(parent.order_id, "o-1");
        assert!(erased.is::<OrderEvent>());
    }

    #[test]
    fn test_project_value_uses_ancestor_layout() {
        let shipped = OrderShipped {
            order: OrderEvent {
                order_id: "o-2".into(),
            },
            carrier: "dhl".into(),
        };
        let erased: BoxedMessage = Arc::new(shipped);

        let parent = erased.project_value(OrderEvent::message_type()).unwrap().unwrap();
        assert_eq!(parent, serde_json::json!({"order_id": "o-2"}));
        assert!(decode_boxed::<OrderEvent>(parent).is_ok());

        let own = erased.project_value(OrderShipped::message_type()).unwrap().unwrap();
        assert_eq!(own["carrier"], "dhl");
        assert!(erased.project_value(command()).is_none());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Command".parse::<MessageKind>().unwrap(), MessageKind::Command);
        assert_eq!("domain-event".parse::<MessageKind>().unwrap(), MessageKind::DomainEvent);
        assert!("notice".parse::<MessageKind>().is_err());
    }
}
