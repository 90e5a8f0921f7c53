//! Topology registries and composition.
//!
//! Each module of an application contributes a [`TopologyRegistry`]. At
//! startup the registries are composed into one [`Topology`], which is where
//! conflicts between modules are detected. Composition never touches the
//! network.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use courier_core::{AnyMessage, MessageType, content_types};
use tracing::{debug, warn};

use super::builder::TopologyBuilder;
use super::exchange::{DEFAULT_RPC_TIMEOUT, ExchangeDefinition};
use super::queue::Subscription;
use super::settings::TopologySettings;
use crate::error::{TopologyError, TopologyResult};

/// Declares the broker entities of one module.
pub trait TopologyRegistry: Send + Sync {
    /// Name used in logs and conflict reports.
    fn name(&self) -> &str;

    /// The broker connection the entities belong to.
    fn broker(&self) -> &str;

    fn define(&self, topology: &mut TopologyBuilder);
}

/// A registry backed by a closure.
pub struct FnTopologyRegistry<F> {
    name: String,
    broker: String,
    define: F,
}

impl<F> TopologyRegistry for FnTopologyRegistry<F>
where
    F: Fn(&mut TopologyBuilder) + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn broker(&self) -> &str {
        &self.broker
    }

    fn define(&self, topology: &mut TopologyBuilder) {
        (self.define)(topology)
    }
}

/// Creates a registry from a closure.
pub fn topology_registry<F>(
    name: impl Into<String>,
    broker: impl Into<String>,
    define: F,
) -> FnTopologyRegistry<F>
where
    F: Fn(&mut TopologyBuilder) + Send + Sync,
{
    FnTopologyRegistry {
        name: name.into(),
        broker: broker.into(),
        define,
    }
}

// ============================================================================
// Composed Topology
// ============================================================================

/// The entities of one broker connection.
#[derive(Debug, Clone)]
pub struct BrokerTopology {
    name: String,
    exchanges: Vec<ExchangeDefinition>,
    subscriptions: Vec<Subscription>,
}

impl BrokerTopology {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exchanges: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.subscriptions.is_empty()
    }
}

/// The composed topology of every registry.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    brokers: BTreeMap<String, BrokerTopology>,
    entities: HashMap<&'static str, (String, usize)>,
}

impl Topology {
    /// Composes registries, rejecting duplicate exchanges, queues and
    /// message-type mappings.
    pub fn compose<'a, I>(registries: I) -> TopologyResult<Self>
    where
        I: IntoIterator<Item = &'a dyn TopologyRegistry>,
    {
        let builders = registries.into_iter().map(|registry| {
            let mut builder = TopologyBuilder::new(registry.broker());
            registry.define(&mut builder);
            debug!(
                registry = registry.name(),
                broker = registry.broker(),
                exchanges = builder.exchanges().len(),
                subscriptions = builder.subscriptions().len(),
                "Collected topology registry"
            );
            builder
        });
        Self::from_builders(builders)
    }

    pub fn from_builders<I>(builders: I) -> TopologyResult<Self>
    where
        I: IntoIterator<Item = TopologyBuilder>,
    {
        let mut topology = Self::default();
        let mut exchange_names: HashSet<(String, String)> = HashSet::new();
        let mut queue_names: HashSet<(String, String)> = HashSet::new();

        for builder in builders {
            let (broker, exchanges, subscriptions) = builder.into_parts();
            let conflict = |detail: String| TopologyError::Conflict {
                broker: broker.clone(),
                detail,
            };

            let entry = topology
                .brokers
                .entry(broker.clone())
                .or_insert_with(|| BrokerTopology::new(&broker));

            for exchange in exchanges {
                let type_name = exchange.message_type().name();
                if let Some((other, _)) = topology.entities.get(type_name) {
                    return Err(TopologyError::Conflict {
                        broker: broker.clone(),
                        detail: format!(
                            "message type '{type_name}' is already mapped on broker '{other}'"
                        ),
                    });
                }
                if !exchange_names.insert((broker.clone(), exchange.entity_name().to_string())) {
                    return Err(conflict(format!(
                        "duplicate exchange '{}'",
                        exchange.entity_name()
                    )));
                }

                topology
                    .entities
                    .insert(type_name, (broker.clone(), entry.exchanges.len()));
                entry.exchanges.push(exchange);
            }

            for subscription in subscriptions {
                if let Some(name) = subscription.queue().name()
                    && !queue_names.insert((broker.clone(), name.to_string()))
                {
                    return Err(conflict(format!("duplicate queue '{name}'")));
                }
                entry.subscriptions.push(subscription);
            }
        }

        Ok(topology)
    }

    /// Merges external overrides onto one broker's entities.
    ///
    /// Exchange settings match by entity name and queue settings by queue
    /// name, within `broker` only. Names that match nothing are logged.
    pub fn apply_settings(&mut self, broker: &str, settings: &TopologySettings) {
        let Some(entry) = self.brokers.get_mut(broker) else {
            if !settings.is_empty() {
                warn!(broker, "Settings given for a broker without topology");
            }
            return;
        };

        for (name, overrides) in &settings.exchanges {
            let mut matched = false;
            for exchange in entry
                .exchanges
                .iter_mut()
                .filter(|exchange| exchange.entity_name() == name)
            {
                overrides.apply_to(exchange);
                matched = true;
            }
            if !matched {
                warn!(broker, exchange = %name, "Exchange settings match no declared entity");
            }
        }

        for (name, overrides) in &settings.queues {
            let mut matched = false;
            for subscription in entry
                .subscriptions
                .iter_mut()
                .filter(|subscription| subscription.queue().name() == Some(name.as_str()))
            {
                overrides.apply_to(&mut subscription.queue);
                matched = true;
            }
            if !matched {
                warn!(broker, queue = %name, "Queue settings match no declared queue");
            }
        }
    }

    /// Replaces the built-in content type and RPC timeout on every entity
    /// that still carries them.
    pub fn apply_defaults(&mut self, content_type: &str, rpc_timeout: Duration) {
        for entry in self.brokers.values_mut() {
            for exchange in &mut entry.exchanges {
                if exchange.content_type == content_types::JSON {
                    exchange.content_type = content_type.to_string();
                }
                if exchange.rpc_timeout == DEFAULT_RPC_TIMEOUT {
                    exchange.rpc_timeout = rpc_timeout;
                }
            }
            for subscription in &mut entry.subscriptions {
                if subscription.queue.content_type == content_types::JSON {
                    subscription.queue.content_type = content_type.to_string();
                }
            }
        }
    }

    /// Validates every entity.
    pub fn validate(&self) -> TopologyResult<()> {
        for broker in self.brokers.values() {
            for exchange in &broker.exchanges {
                exchange.validate()?;
            }
            for subscription in &broker.subscriptions {
                subscription.validate()?;
            }
        }
        Ok(())
    }

    pub fn brokers(&self) -> impl Iterator<Item = &BrokerTopology> {
        self.brokers.values()
    }

    pub fn broker(&self, name: &str) -> Option<&BrokerTopology> {
        self.brokers.get(name)
    }

    pub fn broker_names(&self) -> impl Iterator<Item = &str> {
        self.brokers.keys().map(String::as_str)
    }

    /// The publishing entity for a message type, searching its ancestors
    /// when the type itself has none.
    pub fn entity_for(&self, message_type: &MessageType) -> Option<&ExchangeDefinition> {
        message_type.lineage().find_map(|ty| {
            let (broker, index) = self.entities.get(ty.name())?;
            self.brokers.get(broker)?.exchanges.get(*index)
        })
    }

    /// The publishing entity for a message, if it accepts the message.
    pub fn entity_for_message(&self, message: &dyn AnyMessage) -> Option<&ExchangeDefinition> {
        self.entity_for(message.runtime_type())
            .filter(|entity| entity.accepts(message))
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.values().all(BrokerTopology::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::exchange::ExchangeType;
    use crate::topology::settings::QueueSettings;
    use courier_core::dispatch::Dispatcher;
    use courier_core::{Message, MessageType, command, domain_event};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType =
                MessageType::new("tests::OrderPlaced", "OrderPlaced", domain_event);
            &TYPE
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ShipOrder {
        id: u32,
    }

    impl Message for ShipOrder {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::ShipOrder", "ShipOrder", command);
            &TYPE
        }
    }

    fn noop<M: Message>() -> Dispatcher {
        Dispatcher::on::<M>().handle(|_| async { Ok(()) })
    }

    #[test]
    fn test_duplicate_exchange_conflicts() {
        let a = topology_registry("orders", "main", |t| {
            t.define_exchange::<OrderPlaced>("orders", ExchangeType::Fanout);
        });
        let b = topology_registry("shipping", "main", |t| {
            t.define_exchange::<ShipOrder>("orders", ExchangeType::Fanout);
        });

        let err = Topology::compose([&a as &dyn TopologyRegistry, &b]).unwrap_err();
        assert!(matches!(err, TopologyError::Conflict { ref detail, .. } if detail.contains("orders")));
    }

    #[test]
    fn test_same_exchange_name_on_other_broker_is_allowed() {
        let a = topology_registry("orders", "main", |t| {
            t.define_exchange::<OrderPlaced>("orders", ExchangeType::Fanout);
        });
        let b = topology_registry("shipping", "audit", |t| {
            t.define_exchange::<ShipOrder>("orders", ExchangeType::Fanout);
        });

        let topology = Topology::compose([&a as &dyn TopologyRegistry, &b]).unwrap();
        assert_eq!(topology.broker_names().collect::<Vec<_>>(), ["audit", "main"]);
    }

    #[test]
    fn test_duplicate_message_mapping_conflicts_across_brokers() {
        let a = topology_registry("a", "main", |t| {
            t.define_exchange::<OrderPlaced>("orders", ExchangeType::Fanout);
        });
        let b = topology_registry("b", "audit", |t| {
            t.define_queue::<OrderPlaced>("order-audit");
        });

        assert!(matches!(
            Topology::compose([&a as &dyn TopologyRegistry, &b]),
            Err(TopologyError::Conflict { .. })
        ));
    }

    #[test]
    fn test_duplicate_queue_conflicts() {
        let registry = topology_registry("shipping", "main", |t| {
            t.route_to_queue::<ShipOrder>("ship", noop::<ShipOrder>());
            t.route_to_queue::<ShipOrder>("ship", noop::<ShipOrder>());
        });

        assert!(Topology::compose([&registry as &dyn TopologyRegistry]).is_err());
    }

    #[test]
    fn test_settings_merge_by_name_within_broker() {
        let main = topology_registry("shipping", "main", |t| {
            t.subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Direct, noop::<OrderPlaced>())
                .queue_name("ship")
                .route_key("a")
                .prefetch_count(5);
        });
        let audit = topology_registry("audit", "audit", |t| {
            t.subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Direct, noop::<OrderPlaced>())
                .queue_name("ship")
                .route_key("a")
                .prefetch_count(5);
        });
        let mut topology = Topology::compose([&main as &dyn TopologyRegistry, &audit]).unwrap();

        let mut settings = TopologySettings::default();
        settings.queues.insert(
            "ship".into(),
            QueueSettings {
                prefetch_count: Some(7),
                ..Default::default()
            },
        );
        topology.apply_settings("main", &settings);

        let main_queue = topology.broker("main").unwrap().subscriptions()[0].queue();
        assert_eq!(main_queue.prefetch_count(), 7);
        assert_eq!(main_queue.route_keys(), ["a".to_string()]);

        let audit_queue = topology.broker("audit").unwrap().subscriptions()[0].queue();
        assert_eq!(audit_queue.prefetch_count(), 5);
    }

    #[test]
    fn test_entity_lookup_and_predicate() {
        let registry = topology_registry("orders", "main", |t| {
            t.define_exchange::<OrderPlaced>("orders", ExchangeType::Topic)
                .route_key("orders.placed")
                .when(|order: &OrderPlaced| order.id > 10);
        });
        let topology = Topology::compose([&registry as &dyn TopologyRegistry]).unwrap();
        topology.validate().unwrap();

        let entity = topology.entity_for(OrderPlaced::message_type()).unwrap();
        assert_eq!(entity.entity_name(), "orders");
        assert!(topology.entity_for(ShipOrder::message_type()).is_none());

        assert!(topology.entity_for_message(&OrderPlaced { id: 11 }).is_some());
        assert!(topology.entity_for_message(&OrderPlaced { id: 1 }).is_none());
    }

    #[test]
    fn test_validation_runs_after_merge() {
        let registry = topology_registry("shipping", "main", |t| {
            t.subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Topic, noop::<OrderPlaced>())
                .queue_name("ship")
                .route_key("orders.#");
        });
        let mut topology = Topology::compose([&registry as &dyn TopologyRegistry]).unwrap();
        topology.validate().unwrap();

        let mut settings = TopologySettings::default();
        settings.queues.insert(
            "ship".into(),
            QueueSettings {
                clear_route_keys: true,
                ..Default::default()
            },
        );
        topology.apply_settings("main", &settings);

        assert!(matches!(
            topology.validate(),
            Err(TopologyError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_defaults_leave_explicit_values() {
        let registry = topology_registry("shipping", "main", |t| {
            t.define_queue_with_response::<ShipOrder, OrderPlaced>("ship");
            t.define_exchange::<OrderPlaced>("orders", ExchangeType::Fanout)
                .content_type("application/yaml");
        });
        let mut topology = Topology::compose([&registry as &dyn TopologyRegistry]).unwrap();
        topology.apply_defaults("application/x-custom", Duration::from_secs(3));

        let ship = topology.entity_for(ShipOrder::message_type()).unwrap();
        assert_eq!(ship.content_type(), "application/x-custom");
        assert_eq!(ship.rpc_timeout(), Duration::from_secs(3));

        let orders = topology.entity_for(OrderPlaced::message_type()).unwrap();
        assert_eq!(orders.content_type(), "application/yaml");
    }
}
