//! Message properties and namespaced attributes.
//!
//! [`MessageProperties`] carries the standard header fields every transport
//! understands. [`Attributes`] carries free-form values grouped by a context
//! name so that unrelated components (a broker publisher, an application
//! enricher) can attach data without colliding.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

/// Well-known attribute contexts.
pub mod contexts {
    /// Attributes describing the message itself.
    pub const MESSAGE: &str = "message";
    /// Attributes consumed by broker publishers.
    pub const BROKER: &str = "broker";
    /// Attributes owned by the host application.
    pub const APPLICATION: &str = "app";
}

// ============================================================================
// Properties
// ============================================================================

/// Standard message header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub time_to_live: Option<Duration>,
    pub absolute_expiry: Option<SystemTime>,
    pub creation_time: Option<SystemTime>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_absolute_expiry(mut self, expiry: SystemTime) -> Self {
        self.absolute_expiry = Some(expiry);
        self
    }

    pub fn with_creation_time(mut self, time: SystemTime) -> Self {
        self.creation_time = Some(time);
        self
    }

    /// Returns `true` if the message has passed its absolute expiry, or its
    /// creation time plus time-to-live, as of `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        if self.absolute_expiry.is_some_and(|expiry| now >= expiry) {
            return true;
        }
        match (self.creation_time, self.time_to_live) {
            (Some(created), Some(ttl)) => now >= created + ttl,
            _ => false,
        }
    }
}

// ============================================================================
// Attributes
// ============================================================================

/// String attributes grouped by context name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an attribute, returning the previous value.
    pub fn set(
        &mut self,
        context: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        self.entries
            .entry(context.into())
            .or_default()
            .insert(name.into(), value.into())
    }

    pub fn get(&self, context: &str, name: &str) -> Option<&str> {
        self.entries.get(context)?.get(name).map(String::as_str)
    }

    pub fn contains(&self, context: &str, name: &str) -> bool {
        self.get(context, name).is_some()
    }

    pub fn remove(&mut self, context: &str, name: &str) -> Option<String> {
        let values = self.entries.get_mut(context)?;
        let removed = values.remove(name);
        if values.is_empty() {
            self.entries.remove(context);
        }
        removed
    }

    /// Iterates the attributes of one context.
    pub fn context(&self, context: &str) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .get(context)
            .into_iter()
            .flat_map(|values| values.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Iterates every attribute as `(context, name, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.entries.iter().flat_map(|(context, values)| {
            values
                .iter()
                .map(move |(k, v)| (context.as_str(), k.as_str(), v.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_are_namespaced() {
        let mut attrs = Attributes::new();
        attrs.set(contexts::BROKER, "route-key", "orders.created");
        attrs.set(contexts::APPLICATION, "route-key", "ignored");

        assert_eq!(attrs.get(contexts::BROKER, "route-key"), Some("orders.created"));
        assert_eq!(attrs.get(contexts::APPLICATION, "route-key"), Some("ignored"));
        assert_eq!(attrs.len(), 2);

        assert_eq!(attrs.remove(contexts::APPLICATION, "route-key").as_deref(), Some("ignored"));
        assert_eq!(attrs.context(contexts::APPLICATION).count(), 0);
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let created = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let props = MessageProperties::new()
            .with_creation_time(created)
            .with_time_to_live(Duration::from_secs(10));

        assert!(!props.is_expired_at(created + Duration::from_secs(9)));
        assert!(props.is_expired_at(created + Duration::from_secs(10)));

        let props = MessageProperties::new().with_absolute_expiry(created);
        assert!(props.is_expired_at(created));
    }
}
