//! Foundation types: messages, envelopes and attributes.

pub mod attributes;
pub mod envelope;
pub mod message;

pub use attributes::{Attributes, MessageProperties, contexts};
pub use envelope::Envelope;
pub use message::{
    AnyMessage, BoxedMessage, Lineage, Message, MessageKind, MessageType, ParentFn, command,
    decode_boxed, domain_event, query,
};
