//! Consuming from brokers.
//!
//! A [`SubscriberHost`] activates the topology of one broker: it declares
//! exchanges, queues and bindings, then runs one consumer per subscription.
//! Each consumer receives at most `prefetch_count` unacknowledged messages
//! and runs at most `max_concurrent_calls` handlers at a time.
//!
//! A delivery is decoded, dispatched to the subscription's dispatcher and
//! then acknowledged. Instances of a derived type, named by the message type
//! header, reach only dispatchers that include derived types; others are
//! acknowledged unhandled. Failed deliveries are rejected without requeueing so
//! the broker can dead-letter them. Response queues publish the handler's
//! reply, or the failure, to the requester's `reply_to` address.
//!
//! After a [`ConnectionEvent::Reconnected`] the host declares everything
//! again and restarts its consumers.

use std::collections::BTreeMap;
use std::sync::Arc;

use courier_core::{SerializerRegistry, content_types};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{BrokerError, BrokerResult, TransportResult};
use crate::properties::{ERROR_HEADER, MESSAGE_TYPE_HEADER, WireCodec, inbound_envelope};
use crate::topology::{BrokerTopology, ExchangeDefinition, Subscription, Topology};
use crate::transport::{
    BrokerSession, Delivery, DeliveryStream, ExchangeDeclaration, QueueDeclaration, TransportMessage,
    WireProperties,
};

/// Runs the consumers of one broker.
pub struct SubscriberHost {
    broker: String,
    topology: Arc<Topology>,
    connections: Arc<ConnectionManager>,
    registry: Arc<SerializerRegistry>,
    shutdown: CancellationToken,
    sessions: Mutex<Vec<Arc<dyn BrokerSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriberHost {
    pub fn new(
        broker: impl Into<String>,
        topology: Arc<Topology>,
        connections: Arc<ConnectionManager>,
        registry: Arc<SerializerRegistry>,
    ) -> Self {
        let shutdown = connections.shutdown_token().child_token();
        Self {
            broker: broker.into(),
            topology,
            connections,
            registry,
            shutdown,
            sessions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Declares the topology, starts consumers and follows reconnections.
    pub async fn start(self: &Arc<Self>) -> BrokerResult<()> {
        self.activate().await?;

        let host = Arc::clone(self);
        let events = self.connections.subscribe_events();
        let watcher = tokio::spawn(async move { host.watch(events).await });
        self.tasks.lock().push(watcher);
        Ok(())
    }

    /// Stops consumers and closes their sessions.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        let sessions: Vec<Arc<dyn BrokerSession>> = std::mem::take(&mut *self.sessions.lock());
        join_all(sessions.iter().map(|session| session.close())).await;
        info!(broker = %self.broker, "Subscriber host stopped");
    }

    fn broker_topology(&self) -> Option<&BrokerTopology> {
        self.topology.broker(&self.broker)
    }

    /// Declares every entity and starts one consumer per subscription.
    async fn activate(&self) -> BrokerResult<()> {
        let Some(topology) = self.broker_topology() else {
            return Ok(());
        };

        // Queues with a subscription are declared with their consumer-side
        // settings instead.
        let consumed: Vec<&str> = topology
            .subscriptions()
            .iter()
            .filter_map(|s| s.queue().name())
            .collect();

        let session = self.connections.subscriber_session(&self.broker).await?;
        for entity in topology.exchanges() {
            if entity.queue().is_some_and(|queue| consumed.contains(&queue)) {
                continue;
            }
            declare_entity(session.as_ref(), entity).await?;
        }
        session.close().await;

        for subscription in topology.subscriptions() {
            self.start_consumer(subscription.clone()).await?;
        }

        info!(
            broker = %self.broker,
            exchanges = topology.exchanges().len(),
            subscriptions = topology.subscriptions().len(),
            "Broker topology activated"
        );
        Ok(())
    }

    async fn start_consumer(&self, subscription: Subscription) -> BrokerResult<()> {
        // Exclusive queues belong to the connection that declared them, so
        // declare and consume on the same dedicated session.
        let session = self.connections.subscriber_session(&self.broker).await?;
        let queue = declare_subscription(session.as_ref(), &subscription).await?;
        let stream = session
            .consume(&queue, subscription.queue().consume_options())
            .await?;
        self.sessions.lock().push(Arc::clone(&session));

        debug!(
            broker = %self.broker,
            queue = %queue,
            dispatcher = %subscription.dispatcher().display_name(),
            "Started subscription"
        );

        let channel_encoded = self
            .connections
            .options(&self.broker)
            .is_some_and(|options| options.channel_encoded_payload);
        let consumer = Arc::new(QueueConsumer {
            broker: self.broker.clone(),
            queue: queue.clone(),
            subscription,
            codec: WireCodec::new(Arc::clone(&self.registry)).channel_encoded(channel_encoded),
            connections: Arc::clone(&self.connections),
        });

        let span = info_span!("subscription", broker = %self.broker, queue = %queue);
        let task = tokio::spawn(
            consume(consumer, stream, self.shutdown.child_token()).instrument(span),
        );
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn watch(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ConnectionEvent::Reconnected { broker, .. }) if broker == self.broker => {
                    self.sessions.lock().clear();
                    self.tasks.lock().retain(|task| !task.is_finished());
                    match self.activate().await {
                        Ok(()) => info!(broker = %broker, "Restored subscriptions after reconnect"),
                        Err(e) => warn!(broker = %broker, error = %e, "Failed to restore subscriptions"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber host missed connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl std::fmt::Debug for SubscriberHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHost")
            .field("broker", &self.broker)
            .field("consumers", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Declarations
// =============================================================================

/// Declares the exchange or target queue of a publisher entity.
pub async fn declare_entity(session: &dyn BrokerSession, entity: &ExchangeDefinition) -> TransportResult<()> {
    if let Some(declaration) = entity.declaration() {
        return session.declare_exchange(&declaration).await;
    }
    if let Some(queue) = entity.queue() {
        session
            .declare_queue(&QueueDeclaration {
                name: Some(queue.to_string()),
                durable: entity.is_durable(),
                auto_delete: entity.is_auto_delete(),
                ..Default::default()
            })
            .await?;
    }
    Ok(())
}

/// Declares a subscription's queue and bindings, returning the queue name.
pub async fn declare_subscription(
    session: &dyn BrokerSession,
    subscription: &Subscription,
) -> TransportResult<String> {
    let queue = subscription.queue();

    if let (Some(exchange), Some(kind)) = (queue.exchange(), queue.exchange_type().transport_kind()) {
        session
            .declare_exchange(&ExchangeDeclaration {
                name: exchange.to_string(),
                kind,
                durable: true,
                auto_delete: false,
                passive: false,
                alternate_exchange: None,
            })
            .await?;
    }

    let name = session.declare_queue(&queue.declaration()).await?;
    if let Some(exchange) = queue.exchange() {
        for key in queue.binding_keys() {
            session.bind_queue(&name, exchange, &key).await?;
        }
    }
    Ok(name)
}

// =============================================================================
// Consumer
// =============================================================================

struct QueueConsumer {
    broker: String,
    queue: String,
    subscription: Subscription,
    codec: WireCodec,
    connections: Arc<ConnectionManager>,
}

async fn consume(consumer: Arc<QueueConsumer>, mut stream: DeliveryStream, shutdown: CancellationToken) {
    let limit = Arc::new(Semaphore::new(consumer.subscription.max_concurrent_calls()));

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = stream.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let consumer = Arc::clone(&consumer);
        tokio::spawn(
            async move {
                consumer.handle(delivery).await;
                drop(permit);
            }
            .in_current_span(),
        );
    }
    debug!(queue = %consumer.queue, "Consumer stopped");
}

impl QueueConsumer {
    async fn handle(&self, delivery: Delivery) {
        let result = self.process(&delivery).await;

        if self.subscription.queue().sends_replies() {
            self.reply(&delivery, &result).await;
        }

        let settled = match &result {
            Ok(_) => delivery.ack().await,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    dispatcher = %self.subscription.dispatcher().display_name(),
                    error = %e,
                    "Message handling failed"
                );
                delivery.nack(false).await
            }
        };
        if let Err(e) = settled {
            warn!(queue = %self.queue, error = %e, "Failed to settle delivery");
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<Option<Value>, String> {
        if !self.takes_sent_type(&delivery.message) {
            debug!(
                queue = %self.queue,
                message_type = delivery.message.headers.get(MESSAGE_TYPE_HEADER).map(String::as_str),
                "Dispatcher excludes derived type"
            );
            return Ok(None);
        }

        let value = self.codec.decode(&delivery.message).map_err(|e| e.to_string())?;
        let body = self.subscription.decode(value).map_err(|e| e.to_string())?;
        let envelope = Arc::new(inbound_envelope(delivery, body));

        if envelope.is_expired() {
            return Err("message expired before handling".to_string());
        }

        let dispatcher = self.subscription.dispatcher();
        if !dispatcher.applies_to(envelope.body()) {
            debug!(queue = %self.queue, "Dispatcher predicate rejected message");
            return Ok(None);
        }

        dispatcher.invoke(envelope).await.map_err(|e| e.to_string())
    }

    /// Whether the dispatcher receives the type the publisher sent.
    ///
    /// Without the header the message is taken as the subscription's type.
    fn takes_sent_type(&self, message: &TransportMessage) -> bool {
        let dispatcher = self.subscription.dispatcher();
        let sent = message
            .headers
            .get(MESSAGE_TYPE_HEADER)
            .map_or(self.subscription.message_type().name(), String::as_str);
        sent == dispatcher.message_type().name() || dispatcher.include_derived()
    }

    async fn reply(&self, delivery: &Delivery, result: &Result<Option<Value>, String>) {
        let request = &delivery.message.properties;
        let Some(reply_to) = request.reply_to.clone() else {
            warn!(queue = %self.queue, "Request has no reply address");
            return;
        };

        let properties = WireProperties {
            content_type: request.content_type.clone(),
            content_encoding: request.content_encoding.clone(),
            correlation_id: request.correlation_id.clone(),
            ..Default::default()
        };
        let (body, headers) = match result {
            Ok(reply) => (reply.clone().unwrap_or(Value::Null), BTreeMap::new()),
            Err(error) => (
                Value::Null,
                BTreeMap::from([(ERROR_HEADER.to_string(), error.clone())]),
            ),
        };

        let encoded = self.codec.encode(&body, properties, headers, None).or_else(|e| {
            warn!(queue = %self.queue, error = %e, "Failed to encode reply");
            self.codec.encode(
                &Value::Null,
                WireProperties {
                    content_type: content_types::JSON.to_string(),
                    correlation_id: request.correlation_id.clone(),
                    ..Default::default()
                },
                BTreeMap::from([(ERROR_HEADER.to_string(), e.to_string())]),
                None,
            )
        });
        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Dropping unencodable reply");
                return;
            }
        };

        let sent: BrokerResult<()> = self
            .connections
            .with_session(&self.broker, |session| async move {
                session
                    .publish("", &reply_to, message)
                    .await
                    .map_err(BrokerError::from)
            })
            .await;
        if let Err(e) = sent {
            warn!(queue = %self.queue, error = %e, "Failed to publish reply");
        }
    }
}
