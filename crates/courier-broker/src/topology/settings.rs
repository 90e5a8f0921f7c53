//! External topology overrides.
//!
//! Settings loaded from configuration are merged onto the topology declared
//! in code. A merge only touches fields the settings specify; everything else
//! keeps its declared value. Route keys are replaced only by a non-empty list
//! and removed only when `clear_route_keys` is set.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::exchange::ExchangeDefinition;
use super::queue::QueueDefinition;

/// Overrides for one exchange entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub passive: Option<bool>,
    pub alternate_exchange: Option<String>,
    pub rpc_timeout_ms: Option<u64>,
}

impl ExchangeSettings {
    pub fn apply_to(&self, definition: &mut ExchangeDefinition) {
        if let Some(passive) = self.passive {
            definition.passive = passive;
        }
        if let Some(alternate) = &self.alternate_exchange {
            definition.alternate_exchange = Some(alternate.clone());
        }
        if let Some(timeout) = self.rpc_timeout_ms {
            definition.rpc_timeout = Duration::from_millis(timeout);
        }
    }
}

/// Overrides for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub route_keys: Vec<String>,
    pub clear_route_keys: bool,
    pub message_ttl_ms: Option<u64>,
    pub max_priority: Option<u8>,
    pub prefetch_count: Option<u16>,
    pub priority: Option<i32>,
}

impl QueueSettings {
    pub fn apply_to(&self, definition: &mut QueueDefinition) {
        if self.clear_route_keys {
            definition.route_keys.clear();
        }
        if !self.route_keys.is_empty() {
            definition.route_keys = self.route_keys.clone();
        }
        if let Some(ttl) = self.message_ttl_ms {
            definition.message_ttl = Some(Duration::from_millis(ttl));
        }
        if let Some(max_priority) = self.max_priority {
            definition.max_priority = Some(max_priority);
        }
        if let Some(prefetch) = self.prefetch_count {
            definition.prefetch_count = prefetch;
        }
        if let Some(priority) = self.priority {
            definition.priority = Some(priority);
        }
    }
}

/// Overrides for every entity of one broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologySettings {
    pub exchanges: BTreeMap<String, ExchangeSettings>,
    pub queues: BTreeMap<String, QueueSettings>,
}

impl TopologySettings {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::exchange::ExchangeType;
    use courier_core::command;

    #[test]
    fn test_prefetch_merge_preserves_route_keys() {
        let mut queue = QueueDefinition::new("main", ExchangeType::Direct);
        queue.prefetch_count = 5;
        queue.route_keys = vec!["a".into()];

        let settings = QueueSettings {
            prefetch_count: Some(7),
            ..Default::default()
        };
        settings.apply_to(&mut queue);

        assert_eq!(queue.prefetch_count(), 7);
        assert_eq!(queue.route_keys(), ["a".to_string()]);
    }

    #[test]
    fn test_route_keys_replace_and_clear() {
        let mut queue = QueueDefinition::new("main", ExchangeType::Topic);
        queue.route_keys = vec!["a".into()];

        QueueSettings {
            route_keys: vec!["b".into(), "c".into()],
            ..Default::default()
        }
        .apply_to(&mut queue);
        assert_eq!(queue.route_keys(), ["b".to_string(), "c".to_string()]);

        QueueSettings {
            clear_route_keys: true,
            ..Default::default()
        }
        .apply_to(&mut queue);
        assert!(queue.route_keys().is_empty());
    }

    #[test]
    fn test_exchange_settings_override_timeout() {
        let mut def = ExchangeDefinition::new("main", command(), ExchangeType::Rpc);
        ExchangeSettings {
            rpc_timeout_ms: Some(250),
            ..Default::default()
        }
        .apply_to(&mut def);

        assert_eq!(def.rpc_timeout(), Duration::from_millis(250));
        assert!(!def.is_passive());
    }

    #[test]
    fn test_deserialize_partial_settings() {
        let settings: TopologySettings = serde_json::from_str(
            r#"{"queues": {"billing": {"prefetch_count": 3}}, "exchanges": {"orders": {"passive": true}}}"#,
        )
        .unwrap();
        assert_eq!(settings.queues["billing"].prefetch_count, Some(3));
        assert!(settings.queues["billing"].route_keys.is_empty());
        assert_eq!(settings.exchanges["orders"].passive, Some(true));
    }
}
