//! The envelope wrapping a message on its way through the bus.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use super::attributes::{Attributes, MessageProperties};
use super::message::{AnyMessage, BoxedMessage, Message, MessageType};
use crate::error::{CodecError, CodecResult};

/// A message together with its properties, attributes and reply slot.
///
/// Properties and attributes are mutable only while the envelope is owned,
/// which is the enrichment stage of the router. Once published the envelope
/// is shared as `Arc<Envelope>` and only the reply slot can change.
#[derive(Debug, Clone)]
pub struct Envelope {
    body: BoxedMessage,
    properties: MessageProperties,
    attributes: Attributes,
    reply: Arc<OnceLock<Value>>,
}

impl Envelope {
    pub fn new<M: Message>(message: M) -> Self {
        Self::from_boxed(Arc::new(message))
    }

    pub fn from_boxed(body: BoxedMessage) -> Self {
        Self {
            body,
            properties: MessageProperties::default(),
            attributes: Attributes::default(),
            reply: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_attribute(
        mut self,
        context: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.set(context, name, value);
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.properties.subject = Some(subject.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.properties.time_to_live = Some(ttl);
        self
    }

    pub fn with_absolute_expiry(mut self, expiry: SystemTime) -> Self {
        self.properties.absolute_expiry = Some(expiry);
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn body(&self) -> &dyn AnyMessage {
        self.body.as_ref()
    }

    /// Returns a shared handle to the message body.
    pub fn boxed_body(&self) -> BoxedMessage {
        Arc::clone(&self.body)
    }

    /// Returns the descriptor of the body's runtime type.
    pub fn message_type(&self) -> &'static MessageType {
        self.body.runtime_type()
    }

    /// Views the body as `M`, which may be the runtime type or an ancestor.
    pub fn message<M: Message>(&self) -> Option<&M> {
        self.body.view::<M>()
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Splits the envelope into the parts an enricher may touch.
    pub fn parts_mut(&mut self) -> (&dyn AnyMessage, &mut MessageProperties, &mut Attributes) {
        (self.body.as_ref(), &mut self.properties, &mut self.attributes)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Returns the message id, generating a UUID v4 if none was set.
    pub fn ensure_message_id(&mut self) -> &str {
        self.properties
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
    }

    /// Returns `true` if the message has expired as of now.
    pub fn is_expired(&self) -> bool {
        self.properties.is_expired_at(SystemTime::now())
    }

    // ========================================================================
    // Reply Slot
    // ========================================================================

    /// Stores a reply. Only the first reply is kept.
    ///
    /// Returns `false` if a reply was already present.
    pub fn set_reply(&self, value: Value) -> bool {
        self.reply.set(value).is_ok()
    }

    pub fn reply(&self) -> Option<&Value> {
        self.reply.get()
    }

    pub fn has_reply(&self) -> bool {
        self.reply.get().is_some()
    }

    /// Deserializes the stored reply into `R`.
    pub fn reply_as<R: DeserializeOwned>(&self) -> Option<CodecResult<R>> {
        self.reply.get().map(|value| {
            R::deserialize(value).map_err(|e| CodecError::Decode {
                content_type: "application/json".into(),
                reason: e.to_string(),
            })
        })
    }
}
