//! Declarative topology DSL.
//!
//! ```rust,ignore
//! let mut topology = TopologyBuilder::new("main");
//!
//! topology
//!     .define_exchange::<OrderPlaced>("orders", ExchangeType::Topic)
//!     .route_key_fn(|order| format!("orders.{}.placed", order.region));
//!
//! topology
//!     .subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Topic, ship_order)
//!     .queue_name("shipping")
//!     .route_key("orders.*.placed")
//!     .prefetch_count(20);
//!
//! topology.define_queue_with_response::<GetPrice, Price>("pricing");
//! ```

use std::marker::PhantomData;
use std::time::Duration;

use courier_core::dispatch::Dispatcher;
use courier_core::{AnyMessage, Message, decode_boxed};

use super::exchange::{ExchangeDefinition, ExchangeType};
use super::queue::{QueueDefinition, Subscription};
use super::route_key::RouteKey;

/// Default bound on concurrently running handlers per subscription.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 1;

/// Collects the entities one registry declares for one broker.
#[derive(Debug)]
pub struct TopologyBuilder {
    broker: String,
    exchanges: Vec<ExchangeDefinition>,
    subscriptions: Vec<Subscription>,
}

impl TopologyBuilder {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            exchanges: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub(crate) fn into_parts(self) -> (String, Vec<ExchangeDefinition>, Vec<Subscription>) {
        (self.broker, self.exchanges, self.subscriptions)
    }

    // ========================================================================
    // Publisher side
    // ========================================================================

    /// Publishes `T` to a named exchange.
    pub fn define_exchange<T: Message>(
        &mut self,
        name: impl Into<String>,
        exchange_type: ExchangeType,
    ) -> ExchangeConfig<'_, T> {
        let mut definition = ExchangeDefinition::new(&*self.broker, T::message_type(), exchange_type);
        definition.name = Some(name.into());
        self.push_exchange(definition)
    }

    /// Sends `T` straight to a queue.
    pub fn define_queue<T: Message>(&mut self, queue: impl Into<String>) -> ExchangeConfig<'_, T> {
        let mut definition =
            ExchangeDefinition::new(&*self.broker, T::message_type(), ExchangeType::WorkQueue);
        definition.queue = Some(queue.into());
        self.push_exchange(definition)
    }

    /// Sends `TReq` to a queue and waits for a `TResp` reply.
    pub fn define_queue_with_response<TReq: Message, TResp: Message>(
        &mut self,
        queue: impl Into<String>,
    ) -> ExchangeConfig<'_, TReq> {
        let mut definition =
            ExchangeDefinition::new(&*self.broker, TReq::message_type(), ExchangeType::Rpc);
        definition.queue = Some(queue.into());
        definition.no_ack = true;
        definition.durable = false;
        definition.response_type = Some(TResp::message_type());
        self.push_exchange(definition)
    }

    fn push_exchange<T: Message>(&mut self, definition: ExchangeDefinition) -> ExchangeConfig<'_, T> {
        self.exchanges.push(definition);
        let index = self.exchanges.len() - 1;
        ExchangeConfig {
            definition: &mut self.exchanges[index],
            _marker: PhantomData,
        }
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Consumes `T` from an exchange.
    ///
    /// Without a queue name the broker assigns an exclusive, auto-deleted
    /// queue for this process.
    pub fn subscribe_to_exchange<T: Message>(
        &mut self,
        exchange: impl Into<String>,
        exchange_type: ExchangeType,
        dispatcher: Dispatcher,
    ) -> QueueConfig<'_> {
        let mut queue = QueueDefinition::new(&*self.broker, exchange_type);
        queue.exchange = Some(exchange.into());
        queue.durable = false;
        queue.exclusive = true;
        queue.auto_delete = true;
        self.push_subscription::<T>(queue, dispatcher)
    }

    /// Consumes `T` from a work queue.
    pub fn route_to_queue<T: Message>(
        &mut self,
        queue: impl Into<String>,
        dispatcher: Dispatcher,
    ) -> QueueConfig<'_> {
        let mut definition = QueueDefinition::new(&*self.broker, ExchangeType::WorkQueue);
        definition.name = Some(queue.into());
        self.push_subscription::<T>(definition, dispatcher)
    }

    /// Consumes `TReq` from a queue and publishes the handler's `TResp`
    /// reply to the requester.
    pub fn route_to_queue_with_response<TReq: Message, TResp: Message>(
        &mut self,
        queue: impl Into<String>,
        dispatcher: Dispatcher,
    ) -> QueueConfig<'_> {
        let mut definition = QueueDefinition::new(&*self.broker, ExchangeType::Rpc);
        definition.name = Some(queue.into());
        definition.no_ack = true;
        definition.durable = false;
        definition.replies = true;
        tracing::trace!(
            request = TReq::message_type().name(),
            response = TResp::message_type().name(),
            "Declared rpc queue"
        );
        self.push_subscription::<TReq>(definition, dispatcher)
    }

    fn push_subscription<T: Message>(
        &mut self,
        queue: QueueDefinition,
        dispatcher: Dispatcher,
    ) -> QueueConfig<'_> {
        self.subscriptions.push(Subscription {
            queue,
            message_type: T::message_type(),
            dispatcher,
            decoder: decode_boxed::<T>,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
        });
        let index = self.subscriptions.len() - 1;
        QueueConfig {
            subscription: &mut self.subscriptions[index],
        }
    }
}

// ============================================================================
// Entity configurators
// ============================================================================

/// Configures a publisher entity for messages of type `T`.
pub struct ExchangeConfig<'a, T> {
    definition: &'a mut ExchangeDefinition,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> ExchangeConfig<'_, T> {
    pub fn durable(self, durable: bool) -> Self {
        self.definition.durable = durable;
        self
    }

    pub fn auto_delete(self, auto_delete: bool) -> Self {
        self.definition.auto_delete = auto_delete;
        self
    }

    /// Only check that the exchange exists instead of declaring it.
    pub fn passive(self, passive: bool) -> Self {
        self.definition.passive = passive;
        self
    }

    pub fn alternate_exchange(self, exchange: impl Into<String>) -> Self {
        self.definition.alternate_exchange = Some(exchange.into());
        self
    }

    pub fn route_key(self, key: impl Into<String>) -> Self {
        self.definition.route_key = Some(RouteKey::Static(key.into()));
        self
    }

    /// Computes the route key from each message.
    pub fn route_key_fn<F>(self, f: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.definition.route_key = Some(RouteKey::Computed(std::sync::Arc::new(
            move |message: &dyn AnyMessage| message.view::<T>().map(&f).unwrap_or_default(),
        )));
        self
    }

    /// Skips delivery of messages the predicate rejects.
    pub fn when<P>(self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.definition.predicate = Some(std::sync::Arc::new(move |message: &dyn AnyMessage| {
            message.view::<T>().is_some_and(&predicate)
        }));
        self
    }

    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.definition.content_type = content_type.into();
        self
    }

    /// Default time-to-live for messages that do not set their own.
    pub fn time_to_live(self, ttl: Duration) -> Self {
        self.definition.time_to_live = Some(ttl);
        self
    }

    pub fn rpc_timeout(self, timeout: Duration) -> Self {
        self.definition.rpc_timeout = timeout;
        self
    }
}

/// Configures a subscription's queue.
pub struct QueueConfig<'a> {
    subscription: &'a mut Subscription,
}

impl QueueConfig<'_> {
    /// Uses a named, shared queue instead of a broker-assigned one.
    pub fn queue_name(self, name: impl Into<String>) -> Self {
        let queue = &mut self.subscription.queue;
        queue.name = Some(name.into());
        queue.durable = true;
        queue.exclusive = false;
        queue.auto_delete = false;
        self
    }

    pub fn route_key(self, key: impl Into<String>) -> Self {
        self.subscription.queue.route_keys.push(key.into());
        self
    }

    pub fn route_keys<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription
            .queue
            .route_keys
            .extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn durable(self, durable: bool) -> Self {
        self.subscription.queue.durable = durable;
        self
    }

    pub fn exclusive(self, exclusive: bool) -> Self {
        self.subscription.queue.exclusive = exclusive;
        self
    }

    pub fn auto_delete(self, auto_delete: bool) -> Self {
        self.subscription.queue.auto_delete = auto_delete;
        self
    }

    pub fn max_priority(self, max_priority: u8) -> Self {
        self.subscription.queue.max_priority = Some(max_priority);
        self
    }

    pub fn prefetch_count(self, prefetch: u16) -> Self {
        self.subscription.queue.prefetch_count = prefetch;
        self
    }

    /// Consumer priority; higher priority consumers receive messages first.
    pub fn priority(self, priority: i32) -> Self {
        self.subscription.queue.priority = Some(priority);
        self
    }

    pub fn dead_letter_exchange(self, exchange: impl Into<String>) -> Self {
        self.subscription.queue.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn message_ttl(self, ttl: Duration) -> Self {
        self.subscription.queue.message_ttl = Some(ttl);
        self
    }

    pub fn no_ack(self, no_ack: bool) -> Self {
        self.subscription.queue.no_ack = no_ack;
        self
    }

    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.subscription.queue.content_type = content_type.into();
        self
    }

    pub fn max_concurrent_calls(self, max: usize) -> Self {
        self.subscription.max_concurrent_calls = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MessageType, command, domain_event, query};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        region: String,
    }

    impl Message for OrderPlaced {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType =
                MessageType::new("tests::OrderPlaced", "OrderPlaced", domain_event);
            &TYPE
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GetPrice {
        sku: String,
    }

    impl Message for GetPrice {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::GetPrice", "GetPrice", query);
            &TYPE
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Price {
        cents: u64,
    }

    impl Message for Price {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::Price", "Price", command);
            &TYPE
        }
    }

    #[test]
    fn test_computed_route_key() {
        let mut topology = TopologyBuilder::new("main");
        topology
            .define_exchange::<OrderPlaced>("orders", ExchangeType::Topic)
            .route_key_fn(|order| format!("orders.{}.placed", order.region));

        let entity = &topology.exchanges()[0];
        entity.validate().unwrap();
        let order = OrderPlaced {
            region: "eu".into(),
        };
        assert_eq!(entity.route_key_for(&order), "orders.eu.placed");
    }

    #[test]
    fn test_subscription_defaults_to_generated_queue() {
        let mut topology = TopologyBuilder::new("main");
        let dispatcher = Dispatcher::on::<OrderPlaced>().handle(|_| async { Ok(()) });
        topology
            .subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Fanout, dispatcher.clone());
        topology
            .subscribe_to_exchange::<OrderPlaced>("orders", ExchangeType::Fanout, dispatcher)
            .queue_name("shipping")
            .max_concurrent_calls(4);

        let generated = topology.subscriptions()[0].queue();
        assert!(generated.name().is_none());
        assert!(generated.is_exclusive() && generated.is_auto_delete());

        let named = &topology.subscriptions()[1];
        assert_eq!(named.queue().name(), Some("shipping"));
        assert!(named.queue().is_durable() && !named.queue().is_exclusive());
        assert_eq!(named.max_concurrent_calls(), 4);
        named.validate().unwrap();
    }

    #[test]
    fn test_rpc_declarations() {
        let mut topology = TopologyBuilder::new("main");
        topology
            .define_queue_with_response::<GetPrice, Price>("pricing")
            .rpc_timeout(Duration::from_millis(50));
        topology.route_to_queue_with_response::<GetPrice, Price>(
            "pricing",
            Dispatcher::on::<GetPrice>().handle(|_| async { Ok(()) }),
        );

        let entity = &topology.exchanges()[0];
        entity.validate().unwrap();
        assert_eq!(entity.publish_exchange(), "");
        assert_eq!(entity.response_type(), Some(Price::message_type()));
        assert_eq!(entity.rpc_timeout(), Duration::from_millis(50));

        let subscription = &topology.subscriptions()[0];
        subscription.validate().unwrap();
        assert!(subscription.queue().sends_replies());
        assert!(subscription.queue().is_no_ack());
    }
}
