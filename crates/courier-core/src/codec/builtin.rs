//! Built-in codecs.

use serde_json::Value;

use super::{Codec, content_types};
use crate::error::{CodecError, CodecResult};

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        content_types::JSON
    }

    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            content_type: content_types::JSON.into(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            content_type: content_types::JSON.into(),
            reason: e.to_string(),
        })
    }
}

/// YAML codec backed by `serde_yaml`.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn content_type(&self) -> &str {
        content_types::YAML
    }

    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| CodecError::Encode {
                content_type: content_types::YAML.into(),
                reason: e.to_string(),
            })
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        serde_yaml::from_slice(bytes).map_err(|e| CodecError::Decode {
            content_type: content_types::YAML.into(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_yaml_preserves_nested_values() {
        let value = json!({"id": "a", "lines": [{"sku": "x", "qty": 2}], "note": null});
        let bytes = YamlCodec.encode(&value).unwrap();
        assert_eq!(YamlCodec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_invalid_json_is_decode_error() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
