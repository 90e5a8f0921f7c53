//! Channel-encoded payloads.
//!
//! Transports without native headers carry the content type inside the
//! payload:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬─────────────────┐
//! │ length (u16, BE) │ content type (UTF-8) │ serialized body │
//! └──────────────────┴──────────────────────┴─────────────────┘
//! ```

use crate::error::{TransportError, TransportResult};

const LENGTH_PREFIX: usize = 2;

/// Prefixes `body` with its content type.
pub fn encode_payload(content_type: &str, body: &[u8]) -> TransportResult<Vec<u8>> {
    let length = u16::try_from(content_type.len()).map_err(|_| {
        TransportError::InvalidPayload(format!(
            "content type is {} bytes, at most {} allowed",
            content_type.len(),
            u16::MAX
        ))
    })?;

    let mut payload = Vec::with_capacity(LENGTH_PREFIX + content_type.len() + body.len());
    payload.extend_from_slice(&length.to_be_bytes());
    payload.extend_from_slice(content_type.as_bytes());
    payload.extend_from_slice(body);
    Ok(payload)
}

/// Splits a payload into its content type and body.
pub fn decode_payload(payload: &[u8]) -> TransportResult<(String, &[u8])> {
    let Some((prefix, rest)) = payload.split_first_chunk::<LENGTH_PREFIX>() else {
        return Err(TransportError::InvalidPayload(
            "payload is shorter than its length prefix".into(),
        ));
    };

    let length = usize::from(u16::from_be_bytes(*prefix));
    if rest.len() < length {
        return Err(TransportError::InvalidPayload(format!(
            "content type needs {length} bytes, {} available",
            rest.len()
        )));
    }

    let (content_type, body) = rest.split_at(length);
    let content_type = std::str::from_utf8(content_type)
        .map_err(|e| TransportError::InvalidPayload(format!("content type is not UTF-8: {e}")))?;
    Ok((content_type.to_string(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let payload = encode_payload("application/json", b"{}").unwrap();
        assert_eq!(&payload[..2], &[0, 16]);
        assert_eq!(&payload[2..18], b"application/json");
        assert_eq!(&payload[18..], b"{}");

        let (content_type, body) = decode_payload(&payload).unwrap();
        assert_eq!(content_type, "application/json");
        assert_eq!(body, b"{}");
    }

    #[test]
    fn test_empty_body() {
        let payload = encode_payload("application/yaml", &[]).unwrap();
        let (content_type, body) = decode_payload(&payload).unwrap();
        assert_eq!(content_type, "application/yaml");
        assert!(body.is_empty());
    }

    #[test]
    fn test_truncated_payloads() {
        assert!(matches!(
            decode_payload(&[0]),
            Err(TransportError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode_payload(&[0, 10, b'a']),
            Err(TransportError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_oversized_content_type() {
        let content_type = "x".repeat(usize::from(u16::MAX) + 1);
        assert!(encode_payload(&content_type, b"").is_err());
    }
}
