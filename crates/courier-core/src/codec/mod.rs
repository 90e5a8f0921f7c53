//! Serialization registry.
//!
//! Codecs are keyed by `(content type, encoding)`. Messages are first turned
//! into an intermediate [`serde_json::Value`] and then into bytes by the codec
//! selected for the envelope's content type, so any codec can carry any
//! message.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = SerializerRegistry::with_defaults();
//! let bytes = registry.encode_message(&order, "application/json", None)?;
//! let decoded: PlaceOrder = registry.decode_message(&bytes, "application/json", None)?;
//! ```

mod builtin;

pub use builtin::{JsonCodec, YamlCodec};

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CodecError, CodecResult};
use crate::foundation::{AnyMessage, Message};

/// Well-known content types.
pub mod content_types {
    pub const JSON: &str = "application/json";
    pub const YAML: &str = "application/yaml";
}

/// The default character encoding.
pub const UTF_8: &str = "utf-8";

// ============================================================================
// Codec Trait
// ============================================================================

/// Converts intermediate values to and from bytes for one content type.
pub trait Codec: Send + Sync {
    /// The media type this codec handles, in lowercase.
    fn content_type(&self) -> &str;

    /// The character encoding this codec produces.
    fn encoding(&self) -> &str {
        UTF_8
    }

    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value>;
}

// ============================================================================
// Content Type
// ============================================================================

/// A parsed content type header value such as `application/json; charset=utf-8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    media_type: String,
    charset: Option<String>,
}

impl ContentType {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into().to_lowercase(),
            charset: None,
        }
    }

    pub fn with_charset(mut self, charset: impl AsRef<str>) -> Self {
        self.charset = Some(normalize_encoding(charset.as_ref()));
        self
    }

    pub fn parse(value: &str) -> CodecResult<Self> {
        let mut parts = value.split(';');
        let media_type = parts.next().unwrap_or_default().trim();
        let Some((kind, subtype)) = media_type.split_once('/') else {
            return Err(CodecError::InvalidContentType(value.to_string()));
        };
        if kind.trim().is_empty() || subtype.trim().is_empty() {
            return Err(CodecError::InvalidContentType(value.to_string()));
        }

        let mut content_type = Self::new(media_type);
        for param in parts {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("charset") {
                content_type = content_type.with_charset(val.trim().trim_matches('"'));
            }
        }
        Ok(content_type)
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }
}

impl FromStr for ContentType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.charset {
            Some(charset) => write!(f, "{}; charset={}", self.media_type, charset),
            None => f.write_str(&self.media_type),
        }
    }
}

/// Lowercases an encoding name and folds common aliases.
pub fn normalize_encoding(encoding: &str) -> String {
    let lower = encoding.trim().to_lowercase();
    match lower.as_str() {
        "utf8" => UTF_8.to_string(),
        _ => lower,
    }
}

// ============================================================================
// Serializer Registry
// ============================================================================

/// Registry of codecs keyed by content type and encoding.
///
/// Configured at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    codecs: HashMap<(String, String), Arc<dyn Codec>>,
}

impl SerializerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the JSON and YAML codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.add_serializer(JsonCodec);
        registry.add_serializer(YamlCodec);
        registry
    }

    /// Registers a codec, replacing any codec for the same pair.
    pub fn add_serializer<C: Codec + 'static>(&mut self, codec: C) -> &mut Self {
        let key = (
            codec.content_type().to_lowercase(),
            normalize_encoding(codec.encoding()),
        );
        self.codecs.insert(key, Arc::new(codec));
        self
    }

    /// Removes every registered codec.
    pub fn clear_serializers(&mut self) -> &mut Self {
        self.codecs.clear();
        self
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Looks up the codec for a content type.
    ///
    /// The encoding defaults to the content type's charset, then UTF-8.
    pub fn get_serializer(
        &self,
        content_type: &str,
        encoding: Option<&str>,
    ) -> CodecResult<Arc<dyn Codec>> {
        let parsed = ContentType::parse(content_type)?;
        let encoding = encoding
            .map(normalize_encoding)
            .or_else(|| parsed.charset.clone())
            .unwrap_or_else(|| UTF_8.to_string());

        self.codecs
            .get(&(parsed.media_type.clone(), encoding.clone()))
            .cloned()
            .ok_or(CodecError::SerializerNotFound {
                content_type: parsed.media_type,
                encoding,
            })
    }

    pub fn encode(
        &self,
        value: &Value,
        content_type: &str,
        encoding: Option<&str>,
    ) -> CodecResult<Vec<u8>> {
        self.get_serializer(content_type, encoding)?.encode(value)
    }

    pub fn decode(
        &self,
        bytes: &[u8],
        content_type: &str,
        encoding: Option<&str>,
    ) -> CodecResult<Value> {
        self.get_serializer(content_type, encoding)?.decode(bytes)
    }

    /// Encodes a message through its intermediate value.
    pub fn encode_message(
        &self,
        message: &dyn AnyMessage,
        content_type: &str,
        encoding: Option<&str>,
    ) -> CodecResult<Vec<u8>> {
        let codec = self.get_serializer(content_type, encoding)?;
        codec.encode(&message.to_value()?)
    }

    /// Decodes bytes into a concrete message type.
    pub fn decode_message<M: Message>(
        &self,
        bytes: &[u8],
        content_type: &str,
        encoding: Option<&str>,
    ) -> CodecResult<M> {
        let value = self.decode(bytes, content_type, encoding)?;
        serde_json::from_value(value).map_err(|e| CodecError::Decode {
            content_type: content_type.to_string(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.codecs.keys().collect();
        keys.sort();
        f.debug_struct("SerializerRegistry")
            .field("codecs", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::{MessageType, command};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct PlaceOrder {
        order_id: String,
        quantity: u32,
        tags: Vec<String>,
    }

    impl Message for PlaceOrder {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::PlaceOrder", "PlaceOrder", command);
            &TYPE
        }
    }

    fn order() -> PlaceOrder {
        PlaceOrder {
            order_id: "o-42".into(),
            quantity: 3,
            tags: vec!["gift".into()],
        }
    }

    #[test]
    fn test_parse_content_type() {
        let ct = ContentType::parse("Application/JSON; charset=\"UTF8\"").unwrap();
        assert_eq!(ct.media_type(), "application/json");
        assert_eq!(ct.charset(), Some("utf-8"));
        assert_eq!(ct.to_string(), "application/json; charset=utf-8");

        assert!(ContentType::parse("json").is_err());
        assert!(ContentType::parse("/json").is_err());
    }

    #[test]
    fn test_messages_survive_every_default_codec() {
        let registry = SerializerRegistry::with_defaults();
        for content_type in [content_types::JSON, content_types::YAML] {
            let bytes = registry.encode_message(&order(), content_type, None).unwrap();
            let decoded: PlaceOrder = registry.decode_message(&bytes, content_type, None).unwrap();
            assert_eq!(decoded, order(), "codec {content_type}");
        }
    }

    #[test]
    fn test_charset_selects_encoding() {
        let registry = SerializerRegistry::with_defaults();
        assert!(registry.get_serializer("application/json; charset=utf-8", None).is_ok());

        let err = registry
            .get_serializer("application/json; charset=latin1", None)
            .err()
            .unwrap();
        assert_eq!(
            err,
            CodecError::SerializerNotFound {
                content_type: "application/json".into(),
                encoding: "latin1".into(),
            }
        );

        // An explicit encoding wins over the charset parameter.
        assert!(registry.get_serializer("application/json; charset=latin1", Some("UTF-8")).is_ok());
    }

    #[test]
    fn test_clear_and_replace_serializers() {
        struct UpperJson;

        impl Codec for UpperJson {
            fn content_type(&self) -> &str {
                content_types::JSON
            }

            fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
                Ok(value.to_string().to_uppercase().into_bytes())
            }

            fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
                JsonCodec.decode(bytes)
            }
        }

        let mut registry = SerializerRegistry::with_defaults();
        registry.clear_serializers();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.encode(&Value::Null, content_types::JSON, None),
            Err(CodecError::SerializerNotFound { .. })
        ));

        registry.add_serializer(UpperJson);
        let bytes = registry.encode(&Value::from("abc"), content_types::JSON, None).unwrap();
        assert_eq!(bytes, b"\"ABC\"");
    }

    #[test]
    fn test_decode_type_mismatch_is_reported() {
        let registry = SerializerRegistry::with_defaults();
        let result: CodecResult<PlaceOrder> =
            registry.decode_message(b"{\"order_id\": 1}", content_types::JSON, None);
        assert!(matches!(result, Err(CodecError::Decode { .. })));
    }
}
