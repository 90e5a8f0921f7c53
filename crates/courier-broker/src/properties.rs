//! Mapping between envelopes and broker messages.
//!
//! Outbound, the envelope's [`MessageProperties`] become [`WireProperties`];
//! values set on the message override the entity's defaults. Attributes in
//! the [`contexts::BROKER`] context become transport headers. Inbound, the
//! mapping runs in reverse and the delivery's exchange, route key and
//! redelivery flag are recorded as broker attributes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use courier_core::codec::UTF_8;
use courier_core::{
    Attributes, BoxedMessage, Envelope, MessageProperties, SerializerRegistry, content_types,
    contexts,
};
use serde_json::Value;

use crate::error::BrokerResult;
use crate::transport::{Delivery, TransportMessage, WireProperties, decode_payload, encode_payload};

/// Header carrying the fully-qualified message type name.
pub const MESSAGE_TYPE_HEADER: &str = "courier-message-type";
/// Header marking a reply as a remote handler failure.
pub const ERROR_HEADER: &str = "courier-error";

/// Broker attribute setting the message priority.
pub const PRIORITY_ATTRIBUTE: &str = "priority";
pub const EXCHANGE_ATTRIBUTE: &str = "exchange";
pub const ROUTE_KEY_ATTRIBUTE: &str = "route-key";
pub const REDELIVERED_ATTRIBUTE: &str = "redelivered";

/// Builds wire properties for an outbound message.
pub fn wire_properties(
    properties: &MessageProperties,
    content_type: &str,
    default_ttl: Option<Duration>,
) -> WireProperties {
    WireProperties {
        content_type: content_type.to_string(),
        content_encoding: properties.content_encoding.clone(),
        creation_time: properties.creation_time.or_else(|| Some(SystemTime::now())),
        correlation_id: properties.correlation_id.clone(),
        message_id: properties.message_id.clone(),
        subject: properties.subject.clone(),
        reply_to: properties.reply_to.clone(),
        absolute_expiry: properties.absolute_expiry,
        time_to_live: properties.time_to_live.or(default_ttl),
    }
}

/// Collects the headers and priority of an outbound message.
pub fn broker_headers(envelope: &Envelope) -> (BTreeMap<String, String>, Option<u8>) {
    let mut headers = BTreeMap::new();
    let mut priority = None;

    for (name, value) in envelope.attributes().context(contexts::BROKER) {
        if name == PRIORITY_ATTRIBUTE {
            priority = value.parse().ok();
        } else {
            headers.insert(name.to_string(), value.to_string());
        }
    }
    headers.insert(
        MESSAGE_TYPE_HEADER.to_string(),
        envelope.message_type().name().to_string(),
    );
    (headers, priority)
}

/// Reads envelope properties from a received message.
pub fn message_properties(wire: &WireProperties) -> MessageProperties {
    MessageProperties {
        message_id: wire.message_id.clone(),
        correlation_id: wire.correlation_id.clone(),
        content_type: (!wire.content_type.is_empty()).then(|| wire.content_type.clone()),
        content_encoding: wire.content_encoding.clone(),
        subject: wire.subject.clone(),
        reply_to: wire.reply_to.clone(),
        time_to_live: wire.time_to_live,
        absolute_expiry: wire.absolute_expiry,
        creation_time: wire.creation_time,
    }
}

/// Wraps a decoded message body received in `delivery`.
pub fn inbound_envelope(delivery: &Delivery, body: BoxedMessage) -> Envelope {
    let mut attributes = Attributes::new();
    for (name, value) in &delivery.message.headers {
        attributes.set(contexts::BROKER, name.as_str(), value.as_str());
    }
    attributes.set(contexts::BROKER, EXCHANGE_ATTRIBUTE, delivery.exchange.as_str());
    attributes.set(contexts::BROKER, ROUTE_KEY_ATTRIBUTE, delivery.route_key.as_str());
    attributes.set(
        contexts::BROKER,
        REDELIVERED_ATTRIBUTE,
        delivery.redelivered.to_string(),
    );

    let mut envelope =
        Envelope::from_boxed(body).with_properties(message_properties(&delivery.message.properties));
    *envelope.attributes_mut() = attributes;
    envelope
}

// =============================================================================
// Body Encoding
// =============================================================================

/// Encodes and decodes message bodies for one broker.
#[derive(Debug, Clone)]
pub struct WireCodec {
    registry: Arc<SerializerRegistry>,
    channel_encoded: bool,
}

impl WireCodec {
    pub fn new(registry: Arc<SerializerRegistry>) -> Self {
        Self {
            registry,
            channel_encoded: false,
        }
    }

    /// Carries the content type inside the payload.
    pub fn channel_encoded(mut self, enabled: bool) -> Self {
        self.channel_encoded = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<SerializerRegistry> {
        &self.registry
    }

    pub fn encode(
        &self,
        value: &Value,
        properties: WireProperties,
        headers: BTreeMap<String, String>,
        priority: Option<u8>,
    ) -> BrokerResult<TransportMessage> {
        let bytes = self.registry.encode(
            value,
            &properties.content_type,
            properties.content_encoding.as_deref(),
        )?;
        let body = if self.channel_encoded {
            encode_payload(&properties.content_type, &bytes)?
        } else {
            bytes
        };
        Ok(TransportMessage {
            properties,
            headers,
            priority,
            body,
        })
    }

    /// Decodes a body with the content type it was sent with.
    ///
    /// Messages without a content type are read as JSON.
    pub fn decode(&self, message: &TransportMessage) -> BrokerResult<Value> {
        let encoding = message
            .properties
            .content_encoding
            .as_deref()
            .unwrap_or(UTF_8);

        if self.channel_encoded {
            let (content_type, body) = decode_payload(&message.body)?;
            return Ok(self.registry.decode(body, &content_type, Some(encoding))?);
        }

        let content_type = if message.properties.content_type.is_empty() {
            content_types::JSON
        } else {
            &message.properties.content_type
        };
        Ok(self
            .registry
            .decode(&message.body, content_type, Some(encoding))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Message, MessageType, command};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::Ping", "Ping", command);
            &TYPE
        }
    }

    #[test]
    fn test_message_values_override_entity_defaults() {
        let properties = MessageProperties::new()
            .with_correlation_id("c-1")
            .with_time_to_live(Duration::from_secs(1));
        let wire = wire_properties(&properties, content_types::JSON, Some(Duration::from_secs(60)));
        assert_eq!(wire.time_to_live, Some(Duration::from_secs(1)));
        assert_eq!(wire.correlation_id.as_deref(), Some("c-1"));
        assert!(wire.creation_time.is_some());

        let wire = wire_properties(&MessageProperties::new(), content_types::JSON, Some(Duration::from_secs(60)));
        assert_eq!(wire.time_to_live, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_broker_attributes_become_headers() {
        let envelope = Envelope::new(Ping)
            .with_attribute(contexts::BROKER, "tenant", "acme")
            .with_attribute(contexts::BROKER, PRIORITY_ATTRIBUTE, "4")
            .with_attribute(contexts::APPLICATION, "ignored", "x");

        let (headers, priority) = broker_headers(&envelope);
        assert_eq!(priority, Some(4));
        assert_eq!(headers.get("tenant").map(String::as_str), Some("acme"));
        assert_eq!(headers.get(MESSAGE_TYPE_HEADER).map(String::as_str), Some("tests::Ping"));
        assert!(!headers.contains_key("ignored"));
    }

    #[test]
    fn test_channel_encoded_body() {
        let codec = WireCodec::new(Arc::new(SerializerRegistry::with_defaults())).channel_encoded(true);
        let properties = wire_properties(&MessageProperties::new(), content_types::YAML, None);

        let message = codec
            .encode(&json!({"sku": "a-1"}), properties, BTreeMap::new(), None)
            .unwrap();
        let (content_type, _) = decode_payload(&message.body).unwrap();
        assert_eq!(content_type, content_types::YAML);

        let mut stripped = message.clone();
        stripped.properties.content_type.clear();
        assert_eq!(codec.decode(&stripped).unwrap(), json!({"sku": "a-1"}));
    }
}
