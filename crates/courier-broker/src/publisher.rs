//! Publishing to brokers.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{BoxError, Envelope, IntegrationType, Publisher, SerializerRegistry};
use tracing::{debug, trace};

use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::properties::{WireCodec, broker_headers, wire_properties};
use crate::rpc::RpcClient;
use crate::topology::{ExchangeDefinition, ExchangeType, Topology};

/// Publishes messages to the broker entity their type maps to.
///
/// Messages without an entity, and messages the entity's predicate rejects,
/// are skipped without error. RPC entities send a request and store the
/// reply in the envelope's reply slot.
pub struct BrokerPublisher {
    topology: Arc<Topology>,
    connections: Arc<ConnectionManager>,
    registry: Arc<SerializerRegistry>,
    rpc: Arc<RpcClient>,
}

impl BrokerPublisher {
    pub fn new(
        topology: Arc<Topology>,
        connections: Arc<ConnectionManager>,
        registry: Arc<SerializerRegistry>,
        rpc: Arc<RpcClient>,
    ) -> Self {
        Self {
            topology,
            connections,
            registry,
            rpc,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    fn entity_for(&self, envelope: &Envelope) -> Option<&ExchangeDefinition> {
        self.topology.entity_for_message(envelope.body())
    }

    async fn send(&self, entity: &ExchangeDefinition, envelope: &Envelope) -> BrokerResult<()> {
        let broker = entity.broker();
        let content_type = envelope.content_type().unwrap_or(entity.content_type());
        let properties = wire_properties(envelope.properties(), content_type, entity.time_to_live());
        let (headers, priority) = broker_headers(envelope);

        let channel_encoded = self
            .connections
            .options(broker)
            .is_some_and(|options| options.channel_encoded_payload);
        let message = WireCodec::new(Arc::clone(&self.registry))
            .channel_encoded(channel_encoded)
            .encode(&entity.body_of(envelope.body())?, properties, headers, priority)?;

        let exchange = entity.publish_exchange().to_string();
        let route_key = entity.route_key_for(envelope.body());
        debug!(
            broker,
            exchange = %exchange,
            route_key = %route_key,
            message_type = %envelope.message_type().name(),
            "Publishing to broker"
        );

        self.connections
            .with_session(broker, |session| async move {
                session.publish(&exchange, &route_key, message).await
            })
            .await
            .map_err(BrokerError::from)
    }
}

#[async_trait]
impl Publisher for BrokerPublisher {
    fn name(&self) -> &str {
        "broker"
    }

    fn integration_type(&self) -> IntegrationType {
        IntegrationType::External
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        let accepted = self.entity_for(envelope).is_some();
        if !accepted {
            trace!(
                message_type = %envelope.message_type().name(),
                "No broker entity accepts message"
            );
        }
        accepted
    }

    async fn publish(&self, envelope: Arc<Envelope>) -> Result<(), BoxError> {
        let Some(entity) = self.entity_for(&envelope) else {
            return Ok(());
        };

        if entity.exchange_type() == ExchangeType::Rpc {
            let reply = self.rpc.request(entity, &envelope).await?;
            envelope.set_reply(reply);
            return Ok(());
        }

        self.send(entity, &envelope).await?;
        Ok(())
    }
}

impl std::fmt::Debug for BrokerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPublisher")
            .field("brokers", &self.topology.broker_names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
