//! In-process broker.
//!
//! [`MemoryBroker`] implements the transport traits with AMQP-like semantics:
//!
//! - default, direct, topic and fanout routing, with alternate exchanges
//! - competing consumers with prefetch windows and consumer priorities
//! - acknowledgements, requeueing and dead-lettering
//! - per-queue and per-message time-to-live
//! - priority queues
//! - exclusive broker-named queues owned by one connection
//!
//! Connection loss can be simulated with [`MemoryBroker::disconnect_all`] and
//! [`MemoryBroker::set_available`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{
    Acknowledger, BrokerConnection, BrokerSession, BrokerTransport, ConsumeOptions, Delivery,
    DeliveryStream, ExchangeDeclaration, ExchangeKind, QueueDeclaration, TransportMessage,
};
use crate::error::{TransportError, TransportResult};
use crate::topology::topic_matches;

/// Header naming the queue a message was dead-lettered from.
pub const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";
/// Header naming why a message was dead-lettered.
pub const DEATH_REASON_HEADER: &str = "x-first-death-reason";

const MAX_ROUTING_HOPS: u32 = 8;

/// An in-process broker.
///
/// Clones share the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared_sessions: bool,
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared_sessions: false,
            shared: Arc::new_cyclic(|weak| Shared {
                state: Mutex::new(State::new(weak.clone())),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Reports sessions as safe for concurrent use.
    pub fn with_shared_sessions(mut self, shared: bool) -> Self {
        self.shared_sessions = shared;
        self
    }

    /// While unavailable, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Closes every open connection, as if the broker restarted.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.shared.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id, reason);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.state.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.shared.state.lock().queues.contains_key(name)
    }

    /// Messages waiting in a queue, excluding unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.shared.state.lock().queues.get(name).map(|q| q.messages.len())
    }

    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        self.shared.state.lock().queues.get(name).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.shared.state.lock().queues.get(name).map(|q| q.consumers.len())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryBroker")
            .field("connections", &state.connections.len())
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

#[async_trait]
impl BrokerTransport for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, url: &str) -> TransportResult<Arc<dyn BrokerConnection>> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed {
                broker: url.to_string(),
                reason: "broker unavailable".into(),
            });
        }

        let (closed_tx, closed_rx) = watch::channel(None);
        let id = {
            let mut state = self.shared.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.connections.insert(id, closed_tx);
            id
        };
        debug!(url, connection = id, "Opened memory broker connection");

        Ok(Arc::new(MemoryConnection {
            id,
            shared_sessions: self.shared_sessions,
            shared: Arc::clone(&self.shared),
            closed_rx,
        }))
    }
}

// =============================================================================
// Connection and Session
// =============================================================================

struct MemoryConnection {
    id: u64,
    shared_sessions: bool,
    shared: Arc<Shared>,
    closed_rx: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.state.lock().connections.contains_key(&self.id)
    }

    fn shared_sessions(&self) -> bool {
        self.shared_sessions
    }

    async fn open_session(&self) -> TransportResult<Arc<dyn BrokerSession>> {
        let mut state = self.shared.state.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(closed());
        }
        state.next_id += 1;
        Ok(Arc::new(MemorySession {
            id: state.next_id,
            connection: self.id,
            shared: Arc::clone(&self.shared),
            open: AtomicBool::new(true),
        }))
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "broker dropped".to_string(),
        }
    }

    async fn close(&self) {
        self.shared
            .state
            .lock()
            .close_connection(self.id, "closed by client");
    }
}

struct MemorySession {
    id: u64,
    connection: u64,
    shared: Arc<Shared>,
    open: AtomicBool,
}

impl MemorySession {
    fn state(&self) -> TransportResult<parking_lot::MutexGuard<'_, State>> {
        let state = self.shared.state.lock();
        if !self.open.load(Ordering::SeqCst) || !state.connections.contains_key(&self.connection) {
            return Err(closed());
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn is_open(&self) -> bool {
        self.state().is_ok()
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> TransportResult<()> {
        self.state()?.declare_exchange(declaration)
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> TransportResult<String> {
        self.state()?.declare_queue(declaration, self.connection)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, route_key: &str) -> TransportResult<()> {
        self.state()?.bind_queue(queue, exchange, route_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        route_key: &str,
        message: TransportMessage,
    ) -> TransportResult<()> {
        let mut state = self.state()?;
        let touched = state.route(exchange, route_key, &message, 0)?;
        if touched.is_empty() {
            trace!(exchange, route_key, "Message routed to no queue");
        }
        state.drain(touched);
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> TransportResult<DeliveryStream> {
        self.state()?.consume(queue, options, self.connection, self.id)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shared.state.lock().close_session(self.id);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.shared.state.lock().close_session(self.id);
        }
    }
}

fn closed() -> TransportError {
    TransportError::ConnectionClosed {
        reason: "session or connection is closed".into(),
    }
}

// =============================================================================
// Acknowledgements
// =============================================================================

struct MemoryAcker {
    shared: Weak<Shared>,
    queue: String,
    connection: u64,
}

impl MemoryAcker {
    fn settle(&self, tag: u64, outcome: Settlement) -> TransportResult<()> {
        let shared = self.shared.upgrade().ok_or_else(closed)?;
        let mut state = shared.state.lock();
        if !state.connections.contains_key(&self.connection) {
            return Err(closed());
        }
        state.settle(&self.queue, tag, outcome)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> TransportResult<()> {
        self.settle(delivery_tag, Settlement::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> TransportResult<()> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.settle(delivery_tag, outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

// =============================================================================
// Broker State
// =============================================================================

struct Shared {
    state: Mutex<State>,
    available: AtomicBool,
}

struct Exchange {
    declaration: ExchangeDeclaration,
    bindings: Vec<(String, String)>,
}

struct Stored {
    message: TransportMessage,
    exchange: String,
    route_key: String,
    redelivered: bool,
    deaths: u32,
    rank: u8,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant, wall_clock: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
            || self
                .message
                .properties
                .absolute_expiry
                .is_some_and(|at| at <= wall_clock)
    }
}

struct Consumer {
    id: u64,
    connection: u64,
    session: u64,
    options: ConsumeOptions,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.options.no_ack
            || self.options.prefetch_count == 0
            || self.in_flight < usize::from(self.options.prefetch_count)
    }

    fn priority(&self) -> i32 {
        self.options.priority.unwrap_or_default()
    }
}

struct Unacked {
    consumer: u64,
    stored: Stored,
}

struct Queue {
    declaration: QueueDeclaration,
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: Vec<Consumer>,
    cursor: usize,
    unacked: BTreeMap<u64, Unacked>,
    had_consumer: bool,
}

impl Queue {
    fn enqueue(&mut self, mut stored: Stored, front: bool) {
        stored.rank = match self.declaration.max_priority {
            Some(max) => stored.message.priority.unwrap_or_default().min(max),
            None => 0,
        };
        let rank = stored.rank;
        let position = if front {
            self.messages.iter().position(|m| m.rank <= rank)
        } else {
            self.messages.iter().position(|m| m.rank < rank)
        };
        match position {
            Some(index) => self.messages.insert(index, stored),
            None => self.messages.push_back(stored),
        }
    }

    /// Picks the next consumer with spare capacity: highest priority first,
    /// round-robin among equals.
    fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        let top = self
            .consumers
            .iter()
            .filter(|c| c.has_capacity())
            .map(Consumer::priority)
            .max()?;
        let index = (0..count)
            .map(|offset| (self.cursor + offset) % count)
            .find(|&i| self.consumers[i].has_capacity() && self.consumers[i].priority() == top)?;
        self.cursor = index + 1;
        Some(index)
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Stored> {
        let wall_clock = SystemTime::now();
        let (expired, live): (Vec<_>, Vec<_>) = self
            .messages
            .drain(..)
            .partition(|m| m.is_expired(now, wall_clock));
        self.messages = live.into();
        expired
    }
}

struct State {
    weak: Weak<Shared>,
    next_id: u64,
    next_tag: u64,
    connections: HashMap<u64, watch::Sender<Option<String>>>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

impl State {
    fn new(weak: Weak<Shared>) -> Self {
        Self {
            weak,
            next_id: 0,
            next_tag: 0,
            connections: HashMap::new(),
            exchanges: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------------

    fn declare_exchange(&mut self, declaration: &ExchangeDeclaration) -> TransportResult<()> {
        match self.exchanges.get(&declaration.name) {
            Some(existing) if existing.declaration.kind != declaration.kind => {
                Err(TransportError::PreconditionFailed(format!(
                    "exchange '{}' is declared as {}, not {}",
                    declaration.name, existing.declaration.kind, declaration.kind
                )))
            }
            Some(_) => Ok(()),
            None if declaration.passive => {
                Err(TransportError::ExchangeNotFound(declaration.name.clone()))
            }
            None => {
                debug!(exchange = %declaration.name, kind = %declaration.kind, "Declared exchange");
                self.exchanges.insert(
                    declaration.name.clone(),
                    Exchange {
                        declaration: declaration.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        declaration: &QueueDeclaration,
        connection: u64,
    ) -> TransportResult<String> {
        let name = match &declaration.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("amq.gen-{}", uuid::Uuid::new_v4().simple()),
        };

        if let Some(existing) = self.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != connection) {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue '{name}' is exclusive to another connection"
                )));
            }
            if existing.declaration.durable != declaration.durable {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue '{name}' durability differs from its declaration"
                )));
            }
            return Ok(name);
        }

        debug!(queue = %name, exclusive = declaration.exclusive, "Declared queue");
        let mut stored_declaration = declaration.clone();
        stored_declaration.name = Some(name.clone());
        self.queues.insert(
            name.clone(),
            Queue {
                declaration: stored_declaration,
                owner: declaration.exclusive.then_some(connection),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                unacked: BTreeMap::new(),
                had_consumer: false,
            },
        );
        Ok(name)
    }

    fn bind_queue(&mut self, queue: &str, exchange: &str, route_key: &str) -> TransportResult<()> {
        if !self.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        let entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;

        let binding = (queue.to_string(), route_key.to_string());
        if !entry.bindings.contains(&binding) {
            trace!(queue, exchange, route_key, "Bound queue");
            entry.bindings.push(binding);
        }
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            debug!(queue = name, "Deleted queue");
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|(queue, _)| queue != name);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    fn route_targets(&self, exchange: &str, route_key: &str, hops: u32) -> TransportResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(route_key)
                .then(|| route_key.to_string())
                .into_iter()
                .collect());
        }

        let entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for (queue, pattern) in &entry.bindings {
            let matched = match entry.declaration.kind {
                ExchangeKind::Direct => pattern == route_key,
                ExchangeKind::Topic => topic_matches(pattern, route_key),
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        if targets.is_empty()
            && hops < MAX_ROUTING_HOPS
            && let Some(alternate) = &entry.declaration.alternate_exchange
        {
            match self.route_targets(alternate, route_key, hops + 1) {
                Ok(alternates) => return Ok(alternates),
                Err(error) => debug!(exchange, alternate = %alternate, %error, "Alternate exchange unusable"),
            }
        }
        Ok(targets)
    }

    /// Enqueues a message on every matching queue and returns their names.
    fn route(
        &mut self,
        exchange: &str,
        route_key: &str,
        message: &TransportMessage,
        deaths: u32,
    ) -> TransportResult<Vec<String>> {
        let targets = self.route_targets(exchange, route_key, 0)?;
        let now = Instant::now();

        for name in &targets {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };
            let ttl = match (queue.declaration.message_ttl, message.properties.time_to_live) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            queue.enqueue(
                Stored {
                    message: message.clone(),
                    exchange: exchange.to_string(),
                    route_key: route_key.to_string(),
                    redelivered: false,
                    deaths,
                    rank: 0,
                    expires_at: ttl.map(|ttl| now + ttl),
                },
                false,
            );
        }
        Ok(targets)
    }

    fn dead_letter(&mut self, queue: &str, mut stored: Stored, reason: &str) -> Vec<String> {
        let Some(exchange) = self
            .queues
            .get(queue)
            .and_then(|q| q.declaration.dead_letter_exchange.clone())
        else {
            trace!(queue, reason, "Dropped message");
            return Vec::new();
        };

        if stored.deaths >= MAX_ROUTING_HOPS {
            warn!(queue, reason, "Dropped message caught in a dead-letter cycle");
            return Vec::new();
        }

        stored
            .message
            .headers
            .entry(DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| queue.to_string());
        stored
            .message
            .headers
            .entry(DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| reason.to_string());
        stored.message.properties.time_to_live = None;

        match self.route(&exchange, &stored.route_key, &stored.message, stored.deaths + 1) {
            Ok(targets) => {
                debug!(queue, dead_letter_exchange = %exchange, reason, "Dead-lettered message");
                targets
            }
            Err(error) => {
                warn!(queue, dead_letter_exchange = %exchange, %error, "Dead-lettering failed");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    fn consume(
        &mut self,
        queue: &str,
        options: ConsumeOptions,
        connection: u64,
        session: u64,
    ) -> TransportResult<DeliveryStream> {
        self.next_id += 1;
        let id = self.next_id;

        let entry = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        if entry.owner.is_some_and(|owner| owner != connection) {
            return Err(TransportError::PreconditionFailed(format!(
                "queue '{queue}' is exclusive to another connection"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(Consumer {
            id,
            connection,
            session,
            options,
            in_flight: 0,
            tx,
        });
        entry.had_consumer = true;
        debug!(queue, consumer = id, prefetch = options.prefetch_count, "Started consumer");

        self.drain(vec![queue.to_string()]);
        Ok(rx)
    }

    /// Pumps queues until no more deliveries are possible.
    fn drain(&mut self, mut pending: Vec<String>) {
        while let Some(queue) = pending.pop() {
            pending.extend(self.pump(&queue));
        }
    }

    /// Delivers ready messages of one queue; returns queues that received
    /// dead-lettered messages.
    fn pump(&mut self, name: &str) -> Vec<String> {
        let closed: Vec<u64> = match self.queues.get(name) {
            Some(queue) => queue
                .consumers
                .iter()
                .filter(|c| c.tx.is_closed())
                .map(|c| c.id)
                .collect(),
            None => return Vec::new(),
        };
        if !closed.is_empty() && !self.remove_consumers(name, |c| closed.contains(&c.id)) {
            return Vec::new();
        }

        let Some(queue) = self.queues.get_mut(name) else {
            return Vec::new();
        };
        let expired = queue.take_expired(Instant::now());

        while !queue.messages.is_empty() {
            let Some(index) = queue.next_consumer() else {
                break;
            };
            let Some(stored) = queue.messages.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &mut queue.consumers[index];

            let mut delivery = Delivery::new(
                stored.message.clone(),
                stored.exchange.clone(),
                stored.route_key.clone(),
                tag,
            )
            .redelivered(stored.redelivered);
            if !consumer.options.no_ack {
                delivery = delivery.with_acker(Arc::new(MemoryAcker {
                    shared: self.weak.clone(),
                    queue: name.to_string(),
                    connection: consumer.connection,
                }));
            }

            if consumer.tx.send(delivery).is_err() {
                // Receiver is gone; the consumer is removed on the next pump.
                queue.messages.push_front(stored);
                let id = consumer.id;
                queue.consumers.retain(|c| c.id != id);
                continue;
            }

            if !consumer.options.no_ack {
                consumer.in_flight += 1;
                queue.unacked.insert(
                    tag,
                    Unacked {
                        consumer: consumer.id,
                        stored,
                    },
                );
            }
        }

        let mut touched = Vec::new();
        for stored in expired {
            touched.extend(self.dead_letter(name, stored, "expired"));
        }
        touched
    }

    fn settle(&mut self, name: &str, tag: u64, outcome: Settlement) -> TransportResult<()> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| TransportError::QueueNotFound(name.to_string()))?;
        let Unacked { consumer, mut stored } = queue.unacked.remove(&tag).ok_or_else(|| {
            TransportError::PreconditionFailed(format!("unknown delivery tag {tag}"))
        })?;

        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        let mut touched = vec![name.to_string()];
        match outcome {
            Settlement::Ack => {}
            Settlement::Requeue => {
                stored.redelivered = true;
                queue.enqueue(stored, true);
            }
            Settlement::Reject => touched.extend(self.dead_letter(name, stored, "rejected")),
        }
        self.drain(touched);
        Ok(())
    }

    /// Removes matching consumers and requeues their unacknowledged messages.
    ///
    /// Returns `false` if the queue was auto-deleted.
    fn remove_consumers<F>(&mut self, name: &str, selected: F) -> bool
    where
        F: Fn(&Consumer) -> bool,
    {
        let Some(queue) = self.queues.get_mut(name) else {
            return false;
        };

        let removed: Vec<u64> = queue
            .consumers
            .iter()
            .filter(|c| selected(c))
            .map(|c| c.id)
            .collect();
        if removed.is_empty() {
            return true;
        }
        queue.consumers.retain(|c| !removed.contains(&c.id));

        let tags: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, unacked)| removed.contains(&unacked.consumer))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags.into_iter().rev() {
            if let Some(Unacked { mut stored, .. }) = queue.unacked.remove(&tag) {
                stored.redelivered = true;
                queue.enqueue(stored, true);
            }
        }
        debug!(queue = name, consumers = removed.len(), "Cancelled consumers");

        if queue.declaration.auto_delete && queue.had_consumer && queue.consumers.is_empty() {
            self.delete_queue(name);
            return false;
        }
        true
    }

    fn close_session(&mut self, session: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            self.remove_consumers(name, |c| c.session == session);
        }
        self.drain(names);
    }

    fn close_connection(&mut self, connection: u64, reason: &str) {
        let Some(closed_tx) = self.connections.remove(&connection) else {
            return;
        };

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            self.remove_consumers(name, |c| c.connection == connection);
        }
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            self.delete_queue(name);
        }

        debug!(connection, reason, "Closed memory broker connection");
        closed_tx.send_replace(Some(reason.to_string()));
        let remaining: Vec<String> = self.queues.keys().cloned().collect();
        self.drain(remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn session(broker: &MemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerSession>) {
        let connection = broker.connect("memory://test").await.unwrap();
        let session = connection.open_session().await.unwrap();
        (connection, session)
    }

    fn exchange(name: &str, kind: ExchangeKind) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
            passive: false,
            alternate_exchange: None,
        }
    }

    fn queue(name: &str) -> QueueDeclaration {
        QueueDeclaration {
            name: Some(name.into()),
            durable: true,
            ..Default::default()
        }
    }

    fn text(body: &str) -> TransportMessage {
        TransportMessage::new("text/plain", body.as_bytes().to_vec())
    }

    fn body(delivery: &Delivery) -> String {
        String::from_utf8(delivery.message.body.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_topic_routing() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_exchange(&exchange("orders", ExchangeKind::Topic)).await.unwrap();
        session.declare_queue(&queue("eu")).await.unwrap();
        session.declare_queue(&queue("all")).await.unwrap();
        session.bind_queue("eu", "orders", "orders.eu.*").await.unwrap();
        session.bind_queue("all", "orders", "orders.#").await.unwrap();

        session.publish("orders", "orders.eu.placed", text("1")).await.unwrap();
        session.publish("orders", "orders.us.placed", text("2")).await.unwrap();

        assert_eq!(broker.queue_depth("eu"), Some(1));
        assert_eq!(broker.queue_depth("all"), Some(2));
    }

    #[tokio::test]
    async fn test_default_exchange_and_missing_exchange() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_queue(&queue("work")).await.unwrap();
        session.publish("", "work", text("job")).await.unwrap();
        session.publish("", "nowhere", text("lost")).await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some(1));

        let err = session.publish("missing", "key", text("x")).await.unwrap_err();
        assert_eq!(err, TransportError::ExchangeNotFound("missing".into()));
    }

    #[tokio::test]
    async fn test_alternate_exchange_receives_unroutable() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_exchange(&exchange("unrouted", ExchangeKind::Fanout)).await.unwrap();
        let mut orders = exchange("orders", ExchangeKind::Direct);
        orders.alternate_exchange = Some("unrouted".into());
        session.declare_exchange(&orders).await.unwrap();
        session.declare_queue(&queue("lost")).await.unwrap();
        session.bind_queue("lost", "unrouted", "").await.unwrap();

        session.publish("orders", "nobody", text("x")).await.unwrap();
        assert_eq!(broker.queue_depth("lost"), Some(1));
    }

    #[tokio::test]
    async fn test_redeclare_with_other_kind_fails() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_exchange(&exchange("orders", ExchangeKind::Topic)).await.unwrap();
        let err = session
            .declare_exchange(&exchange("orders", ExchangeKind::Fanout))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));

        let mut passive = exchange("absent", ExchangeKind::Direct);
        passive.passive = true;
        assert!(matches!(
            session.declare_exchange(&passive).await,
            Err(TransportError::ExchangeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        session.declare_queue(&queue("work")).await.unwrap();
        for i in 0..3 {
            session.publish("", "work", text(&i.to_string())).await.unwrap();
        }

        let options = ConsumeOptions {
            prefetch_count: 2,
            ..Default::default()
        };
        let mut stream = session.consume("work", options).await.unwrap();

        let first = stream.recv().await.unwrap();
        let _second = stream.recv().await.unwrap();
        assert!(stream.try_recv().is_err());
        assert_eq!(broker.unacked_count("work"), Some(2));

        first.ack().await.unwrap();
        let third = stream.recv().await.unwrap();
        assert_eq!(body(&third), "2");
    }

    #[tokio::test]
    async fn test_competing_consumers_round_robin() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        session.declare_queue(&queue("work")).await.unwrap();

        let options = ConsumeOptions {
            prefetch_count: 0,
            no_ack: true,
            priority: None,
        };
        let mut a = session.consume("work", options).await.unwrap();
        let mut b = session.consume("work", options).await.unwrap();

        for i in 0..4 {
            session.publish("", "work", text(&i.to_string())).await.unwrap();
        }

        assert_eq!(body(&a.recv().await.unwrap()), "0");
        assert_eq!(body(&b.recv().await.unwrap()), "1");
        assert_eq!(body(&a.recv().await.unwrap()), "2");
        assert_eq!(body(&b.recv().await.unwrap()), "3");
    }

    #[tokio::test]
    async fn test_nack_requeue_and_dead_letter() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_exchange(&exchange("dlx", ExchangeKind::Fanout)).await.unwrap();
        session.declare_queue(&queue("dead")).await.unwrap();
        session.bind_queue("dead", "dlx", "").await.unwrap();
        let mut work = queue("work");
        work.dead_letter_exchange = Some("dlx".into());
        session.declare_queue(&work).await.unwrap();
        session.publish("", "work", text("job")).await.unwrap();

        let mut stream = session.consume("work", ConsumeOptions::default()).await.unwrap();
        let delivery = stream.recv().await.unwrap();
        assert!(!delivery.redelivered);
        delivery.nack(true).await.unwrap();

        let delivery = stream.recv().await.unwrap();
        assert!(delivery.redelivered);
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("work"), Some(0));
        assert_eq!(broker.queue_depth("dead"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_dead_lettered() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;

        session.declare_exchange(&exchange("dlx", ExchangeKind::Fanout)).await.unwrap();
        session.declare_queue(&queue("dead")).await.unwrap();
        session.bind_queue("dead", "dlx", "").await.unwrap();
        let mut work = queue("work");
        work.dead_letter_exchange = Some("dlx".into());
        work.message_ttl = Some(Duration::from_millis(100));
        session.declare_queue(&work).await.unwrap();

        session.publish("", "work", text("stale")).await.unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;
        session.publish("", "work", text("fresh")).await.unwrap();

        let mut stream = session.consume("work", ConsumeOptions::default()).await.unwrap();
        let delivery = stream.recv().await.unwrap();
        assert_eq!(body(&delivery), "fresh");
        assert_eq!(broker.queue_depth("dead"), Some(1));
    }

    #[tokio::test]
    async fn test_priority_queue_orders_by_priority() {
        let broker = MemoryBroker::new();
        let (_conn, session) = session(&broker).await;
        let mut work = queue("work");
        work.max_priority = Some(5);
        session.declare_queue(&work).await.unwrap();

        session.publish("", "work", text("low").with_priority(1)).await.unwrap();
        session.publish("", "work", text("high").with_priority(9)).await.unwrap();
        session.publish("", "work", text("plain")).await.unwrap();

        let mut stream = session.consume("work", ConsumeOptions::default()).await.unwrap();
        let order: Vec<String> = [
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
            stream.recv().await.unwrap(),
        ]
        .iter()
        .map(body)
        .collect();
        assert_eq!(order, ["high", "low", "plain"]);
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_with_connection() {
        let broker = MemoryBroker::new();
        let (conn, session) = session(&broker).await;

        let name = session
            .declare_queue(&QueueDeclaration {
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(name.starts_with("amq.gen-"));

        let (_other, other_session) = self::session(&broker).await;
        assert!(matches!(
            other_session.consume(&name, ConsumeOptions::default()).await,
            Err(TransportError::PreconditionFailed(_))
        ));

        conn.close().await;
        assert!(!broker.queue_exists(&name));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_disconnect_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (conn, session) = session(&broker).await;
        session.declare_queue(&queue("work")).await.unwrap();
        session.publish("", "work", text("job")).await.unwrap();

        let mut stream = session.consume("work", ConsumeOptions::default()).await.unwrap();
        let _delivery = stream.recv().await.unwrap();
        assert_eq!(broker.unacked_count("work"), Some(1));

        broker.disconnect_all("restart");
        assert_eq!(conn.closed().await, "restart");
        assert_eq!(broker.queue_depth("work"), Some(1));
        assert_eq!(broker.connection_count(), 0);

        broker.set_available(false);
        assert!(broker.connect("memory://test").await.is_err());
    }
}
