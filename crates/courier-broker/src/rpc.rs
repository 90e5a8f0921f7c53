//! Request/reply over a broker.
//!
//! The [`RpcCorrelator`] matches replies to outstanding requests by
//! correlation id. Every request moves from `Pending` to exactly one of
//! `Completed` or `TimedOut`; once terminal its entry is gone and a late
//! reply is logged and discarded. Dropping a [`PendingCall`] before it
//! settles removes its entry.
//!
//! The [`RpcClient`] owns one exclusive, broker-named reply queue per broker,
//! publishes requests with `reply_to` pointing at it and waits on the
//! correlator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_core::{Envelope, SerializerRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::error::{BrokerError, RpcError, RpcResult, TransportError};
use crate::properties::{ERROR_HEADER, WireCodec, broker_headers, wire_properties};
use crate::topology::ExchangeDefinition;
use crate::transport::{BrokerSession, ConsumeOptions, QueueDeclaration, TransportMessage};

// =============================================================================
// Correlator
// =============================================================================

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Pending,
    Completed,
    TimedOut,
}

/// Counters for settled requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub completed: u64,
    pub timed_out: u64,
    /// Replies that matched no pending request.
    pub discarded: u64,
}

struct PendingEntry {
    broker: String,
    tx: oneshot::Sender<RpcResult<TransportMessage>>,
}

/// Matches replies to pending requests.
#[derive(Default)]
pub struct RpcCorrelator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    completed: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request before it is sent.
    pub fn register(
        self: &Arc<Self>,
        broker: impl Into<String>,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> PendingCall {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            correlation_id.clone(),
            PendingEntry {
                broker: broker.into(),
                tx,
            },
        );

        PendingCall {
            correlation_id,
            timeout,
            deadline: Instant::now() + timeout,
            rx,
            correlator: Arc::downgrade(self),
            state: RpcState::Pending,
        }
    }

    /// Completes the request with this correlation id.
    ///
    /// Returns `false` when no request is pending under the id, which is the
    /// case for late replies.
    pub fn complete(&self, correlation_id: &str, reply: TransportMessage) -> bool {
        let mut pending = self.pending.lock();
        match pending.remove(correlation_id) {
            Some(entry) => {
                // Sent under the lock so a timing-out waiter observes it.
                let delivered = entry.tx.send(Ok(reply)).is_ok();
                if delivered {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                delivered
            }
            None => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id, "Discarding reply with no pending request");
                false
            }
        }
    }

    /// Fails every pending request of one broker.
    pub fn fail_broker<F>(&self, broker: &str, error: F) -> usize
    where
        F: Fn(&str) -> RpcError,
    {
        self.fail_where(|entry| entry.broker == broker, error)
    }

    /// Fails every pending request.
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn(&str) -> RpcError,
    {
        self.fail_where(|_| true, error)
    }

    fn fail_where<P, F>(&self, selected: P, error: F) -> usize
    where
        P: Fn(&PendingEntry) -> bool,
        F: Fn(&str) -> RpcError,
    {
        let mut pending = self.pending.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| selected(entry))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.tx.send(Err(error(id)));
            }
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "Failed pending rpc requests");
        }
        ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn stats(&self) -> RpcStats {
        RpcStats {
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn remove(&self, correlation_id: &str) -> bool {
        self.pending.lock().remove(correlation_id).is_some()
    }
}

impl std::fmt::Debug for RpcCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCorrelator")
            .field("pending", &self.pending_count())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A registered request awaiting its reply.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: String,
    timeout: Duration,
    deadline: Instant,
    rx: oneshot::Receiver<RpcResult<TransportMessage>>,
    correlator: Weak<RpcCorrelator>,
    state: RpcState,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> RpcState {
        self.state
    }

    /// Waits for the reply until the deadline.
    pub async fn wait(mut self) -> RpcResult<TransportMessage> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => {
                self.state = RpcState::Completed;
                result
            }
            Ok(Err(_)) => {
                self.state = RpcState::Completed;
                Err(RpcError::Cancelled {
                    correlation_id: self.correlation_id.clone(),
                })
            }
            Err(_) => self.expire(),
        }
    }

    fn expire(&mut self) -> RpcResult<TransportMessage> {
        let correlator = self.correlator.upgrade();
        let removed = correlator
            .as_ref()
            .is_some_and(|c| c.remove(&self.correlation_id));

        // A reply that won the race is already in the channel.
        if !removed && let Ok(result) = self.rx.try_recv() {
            self.state = RpcState::Completed;
            return result;
        }

        self.state = RpcState::TimedOut;
        if let Some(correlator) = correlator {
            correlator.timed_out.fetch_add(1, Ordering::Relaxed);
        }
        warn!(
            correlation_id = %self.correlation_id,
            timeout_ms = self.timeout.as_millis() as u64,
            "Rpc request timed out"
        );
        Err(RpcError::Timeout {
            correlation_id: self.correlation_id.clone(),
            timeout: self.timeout,
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.state == RpcState::Pending
            && let Some(correlator) = self.correlator.upgrade()
            && correlator.remove(&self.correlation_id)
        {
            debug!(correlation_id = %self.correlation_id, "Cancelled pending rpc request");
        }
    }
}

// =============================================================================
// Client
// =============================================================================

struct ReplyQueue {
    name: String,
    session: Arc<dyn BrokerSession>,
    reader: JoinHandle<()>,
}

/// Sends requests and awaits their correlated replies.
pub struct RpcClient {
    connections: Arc<ConnectionManager>,
    registry: Arc<SerializerRegistry>,
    correlator: Arc<RpcCorrelator>,
    reply_queues: tokio::sync::Mutex<HashMap<String, ReplyQueue>>,
}

impl RpcClient {
    pub fn new(connections: Arc<ConnectionManager>, registry: Arc<SerializerRegistry>) -> Self {
        Self {
            connections,
            registry,
            correlator: Arc::new(RpcCorrelator::new()),
            reply_queues: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn correlator(&self) -> &Arc<RpcCorrelator> {
        &self.correlator
    }

    /// The reply queue of a broker, if one is declared.
    pub async fn reply_queue(&self, broker: &str) -> Option<String> {
        self.reply_queues
            .lock()
            .await
            .get(broker)
            .map(|queue| queue.name.clone())
    }

    /// Publishes `envelope` to an RPC entity and waits for the reply body.
    pub async fn request(&self, entity: &ExchangeDefinition, envelope: &Envelope) -> RpcResult<Value> {
        let broker = entity.broker();
        let reply_to = self.ensure_reply_queue(broker).await?;
        let correlation_id = Uuid::new_v4().to_string();

        let content_type = envelope.content_type().unwrap_or(entity.content_type());
        let mut properties = wire_properties(envelope.properties(), content_type, entity.time_to_live());
        properties.correlation_id = Some(correlation_id.clone());
        properties.reply_to = Some(reply_to);
        properties
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());
        let (headers, priority) = broker_headers(envelope);

        let body = entity.body_of(envelope.body())?;
        let message = self
            .codec(broker)
            .encode(&body, properties, headers, priority)
            .map_err(into_rpc_error)?;

        let call = self
            .correlator
            .register(broker, correlation_id.clone(), entity.rpc_timeout());
        let queue = entity.route_key_for(envelope.body());
        debug!(broker, queue = %queue, correlation_id = %correlation_id, "Sending rpc request");

        self.connections
            .with_session(broker, |session| async move {
                session.publish("", &queue, message).await
            })
            .await?;

        let reply = call.wait().await?;
        if let Some(error) = reply.headers.get(ERROR_HEADER) {
            return Err(RpcError::Remote(error.clone()));
        }
        self.codec(broker).decode(&reply).map_err(into_rpc_error)
    }

    /// Declares the broker's reply queue unless a live one exists.
    pub async fn ensure_reply_queue(&self, broker: &str) -> RpcResult<String> {
        let mut queues = self.reply_queues.lock().await;
        if let Some(queue) = queues.get(broker)
            && queue.session.is_open()
        {
            return Ok(queue.name.clone());
        }
        if let Some(stale) = queues.remove(broker) {
            stale.reader.abort();
        }

        let session = self.connections.subscriber_session(broker).await?;
        let name = session
            .declare_queue(&QueueDeclaration {
                name: None,
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            })
            .await?;
        let mut stream = session
            .consume(
                &name,
                ConsumeOptions {
                    prefetch_count: 0,
                    no_ack: true,
                    priority: None,
                },
            )
            .await?;

        let correlator = Arc::clone(&self.correlator);
        let reader = tokio::spawn(async move {
            while let Some(delivery) = stream.recv().await {
                match delivery.message.properties.correlation_id.clone() {
                    Some(id) => {
                        correlator.complete(&id, delivery.message);
                    }
                    None => warn!("Discarding reply without a correlation id"),
                }
            }
        });

        info!(broker, queue = %name, "Declared rpc reply queue");
        queues.insert(
            broker.to_string(),
            ReplyQueue {
                name: name.clone(),
                session,
                reader,
            },
        );
        Ok(name)
    }

    /// Fails requests of lost brokers and re-declares reply queues after
    /// reconnection.
    pub fn watch_connections(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        let mut events = self.connections.subscribe_events();
        let shutdown = self.connections.shutdown_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(client) = client.upgrade() else {
                    break;
                };

                match event {
                    Ok(ConnectionEvent::Lost { broker, .. }) => {
                        client.correlator.fail_broker(&broker, |_| RpcError::NotConnected {
                            broker: broker.clone(),
                        });
                    }
                    Ok(ConnectionEvent::Reconnected { broker, .. }) => {
                        if client.reply_queue(&broker).await.is_none() {
                            continue;
                        }
                        if let Err(e) = client.ensure_reply_queue(&broker).await {
                            warn!(broker = %broker, error = %e, "Failed to re-declare rpc reply queue");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Rpc client missed connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Cancels pending requests and closes reply queues.
    pub async fn shutdown(&self) {
        self.correlator.fail_all(|id| RpcError::Cancelled {
            correlation_id: id.to_string(),
        });
        let queues: Vec<ReplyQueue> = self.reply_queues.lock().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.reader.abort();
            queue.session.close().await;
        }
    }

    fn codec(&self, broker: &str) -> WireCodec {
        let channel_encoded = self
            .connections
            .options(broker)
            .is_some_and(|options| options.channel_encoded_payload);
        WireCodec::new(Arc::clone(&self.registry)).channel_encoded(channel_encoded)
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("correlator", &self.correlator)
            .finish_non_exhaustive()
    }
}

fn into_rpc_error(error: BrokerError) -> RpcError {
    match error {
        BrokerError::Transport(e) => e.into(),
        BrokerError::Codec(e) => e.into(),
        BrokerError::Rpc(e) => e,
        BrokerError::Topology(e) => RpcError::Transport(TransportError::PreconditionFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BrokerOptions;
    use crate::topology::{Topology, TopologyRegistry, topology_registry};
    use crate::transport::MemoryBroker;
    use courier_core::{Message, MessageType, query};
    use serde::{Deserialize, Serialize};

    fn reply(correlation_id: &str) -> TransportMessage {
        TransportMessage::new("application/json", b"{}".to_vec()).with_correlation_id(correlation_id)
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let correlator = Arc::new(RpcCorrelator::new());
        let call = correlator.register("main", "c-1", Duration::from_secs(1));
        assert_eq!(call.state(), RpcState::Pending);

        assert!(correlator.complete("c-1", reply("c-1")));
        let message = call.wait().await.unwrap();
        assert_eq!(message.properties.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(correlator.pending_count(), 0);
        assert_eq!(correlator.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply_is_discarded() {
        let correlator = Arc::new(RpcCorrelator::new());
        let call = correlator.register("main", "c-1", Duration::from_millis(50));
        let waiter = tokio::spawn(call.wait());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!correlator.complete("c-1", reply("c-1")));

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RpcError::Timeout { timeout, .. }) if timeout == Duration::from_millis(50)));

        let stats = correlator.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_call_removes_entry() {
        let correlator = Arc::new(RpcCorrelator::new());
        let call = correlator.register("main", "c-1", Duration::from_secs(1));
        assert!(correlator.is_pending("c-1"));

        drop(call);
        assert!(!correlator.is_pending("c-1"));
    }

    #[tokio::test]
    async fn test_fail_broker_only_touches_that_broker() {
        let correlator = Arc::new(RpcCorrelator::new());
        let main = correlator.register("main", "c-1", Duration::from_secs(1));
        let _audit = correlator.register("audit", "c-2", Duration::from_secs(1));

        let failed = correlator.fail_broker("main", |_| RpcError::NotConnected {
            broker: "main".into(),
        });
        assert_eq!(failed, 1);
        assert!(matches!(main.wait().await, Err(RpcError::NotConnected { .. })));
        assert!(correlator.is_pending("c-2"));
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GetQuote {
        sku: String,
    }

    impl Message for GetQuote {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::GetQuote", "GetQuote", query);
            &TYPE
        }
    }

    #[tokio::test]
    async fn test_request_without_message_id_gets_one() {
        let connections = Arc::new(ConnectionManager::new().with_broker(
            "main",
            Arc::new(MemoryBroker::new()),
            BrokerOptions::new("memory://test"),
        ));
        let rpc = RpcClient::new(
            Arc::clone(&connections),
            Arc::new(SerializerRegistry::with_defaults()),
        );
        let registry = topology_registry("quotes", "main", |t| {
            t.define_queue_with_response::<GetQuote, GetQuote>("quotes");
        });
        let topology = Topology::compose([&registry as &dyn TopologyRegistry]).unwrap();
        let entity = topology.entity_for(GetQuote::message_type()).unwrap();

        let session = connections.subscriber_session("main").await.unwrap();
        session
            .declare_queue(&QueueDeclaration {
                name: Some("quotes".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let mut requests = session
            .consume("quotes", ConsumeOptions::default())
            .await
            .unwrap();

        let responder = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let delivery = requests.recv().await.unwrap();
                delivery.ack().await.unwrap();
                let request = delivery.message.properties;
                let reply = reply(request.correlation_id.as_deref().unwrap());
                session
                    .publish("", request.reply_to.as_deref().unwrap(), reply)
                    .await
                    .unwrap();
                request.message_id
            })
        };

        let envelope = Envelope::new(GetQuote { sku: "a-1".into() });
        assert!(envelope.properties().message_id.is_none());

        let body = rpc.request(entity, &envelope).await.unwrap();
        assert_eq!(body, serde_json::json!({}));

        let message_id = responder.await.unwrap();
        assert!(message_id.is_some_and(|id| Uuid::parse_str(&id).is_ok()));
    }
}
