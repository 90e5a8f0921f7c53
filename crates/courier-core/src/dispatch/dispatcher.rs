//! Dispatcher records.
//!
//! A [`Dispatcher`] binds one handler to one message type. It is built with
//! [`Dispatcher::on`] for a concrete message type or [`Dispatcher::on_type`]
//! for a runtime descriptor:
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::on::<OrderEvent>()
//!     .consumer("audit")
//!     .name("record")
//!     .include_derived(true)
//!     .when(|event| event.order_id.starts_with("vip-"))
//!     .handle(|ctx| async move {
//!         info!(order = %ctx.order_id, "Order event");
//!         Ok(())
//!     });
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;

use super::handler::{
    AsyncFnHandler, BoxFuture, BoxedHandler, Consumer, EnvelopeFnHandler, FactoryHandler,
    HandlerResult, IntoReply, MessageContext, SyncFnHandler,
};
use crate::foundation::{AnyMessage, Envelope, Message, MessageType};

/// A type-erased message predicate.
pub type Predicate = Arc<dyn Fn(&dyn AnyMessage) -> bool + Send + Sync>;

const DEFAULT_CONSUMER: &str = "anonymous";

/// A handler bound to a message type.
#[derive(Clone)]
pub struct Dispatcher {
    message_type: &'static MessageType,
    consumer: String,
    handler_name: String,
    include_derived: bool,
    predicate: Option<Predicate>,
    is_async: bool,
    handler: BoxedHandler,
}

impl Dispatcher {
    /// Starts a dispatcher for messages of type `M`.
    pub fn on<M: Message>() -> DispatcherBuilder<M> {
        DispatcherBuilder {
            settings: Settings::new(M::message_type()),
            predicate: None,
            _marker: PhantomData,
        }
    }

    /// Starts a dispatcher for a runtime message descriptor.
    ///
    /// The handler receives the raw envelope.
    pub fn on_type(message_type: &'static MessageType) -> EnvelopeDispatcherBuilder {
        EnvelopeDispatcherBuilder {
            settings: Settings::new(message_type),
            predicate: None,
        }
    }

    pub fn message_type(&self) -> &'static MessageType {
        self.message_type
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Returns `consumer::handler`, used in logs and errors.
    pub fn display_name(&self) -> String {
        format!("{}::{}", self.consumer, self.handler_name)
    }

    /// Whether messages of derived types are also dispatched to this handler.
    pub fn include_derived(&self) -> bool {
        self.include_derived
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn has_predicate(&self) -> bool {
        self.predicate.is_some()
    }

    /// Evaluates the predicate. Dispatchers without one accept every message.
    pub fn applies_to(&self, message: &dyn AnyMessage) -> bool {
        self.predicate.as_ref().is_none_or(|predicate| predicate(message))
    }

    /// Invokes the handler, returning its reply if any.
    pub fn invoke(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>> {
        self.handler.call(envelope)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("message_type", &self.message_type.name())
            .field("consumer", &self.consumer)
            .field("handler", &self.handler_name)
            .field("include_derived", &self.include_derived)
            .field("has_predicate", &self.predicate.is_some())
            .field("is_async", &self.is_async)
            .finish()
    }
}

// ============================================================================
// Builders
// ============================================================================

struct Settings {
    message_type: &'static MessageType,
    consumer: Option<String>,
    handler_name: Option<String>,
    include_derived: bool,
}

impl Settings {
    fn new(message_type: &'static MessageType) -> Self {
        Self {
            message_type,
            consumer: None,
            handler_name: None,
            include_derived: false,
        }
    }

    fn finish(
        self,
        default_consumer: &str,
        predicate: Option<Predicate>,
        is_async: bool,
        handler: BoxedHandler,
    ) -> Dispatcher {
        let handler_name = self
            .handler_name
            .unwrap_or_else(|| format!("on_{}", self.message_type.short_name()));
        Dispatcher {
            message_type: self.message_type,
            consumer: self.consumer.unwrap_or_else(|| default_consumer.to_string()),
            handler_name,
            include_derived: self.include_derived,
            predicate,
            is_async,
            handler,
        }
    }
}

/// Builder for a dispatcher over a concrete message type.
pub struct DispatcherBuilder<M> {
    settings: Settings,
    predicate: Option<Predicate>,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Message> DispatcherBuilder<M> {
    /// Names the consumer that owns this handler.
    pub fn consumer(mut self, name: impl Into<String>) -> Self {
        self.settings.consumer = Some(name.into());
        self
    }

    /// Names the handler within its consumer.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.handler_name = Some(name.into());
        self
    }

    /// Also dispatch messages whose type derives from `M`.
    pub fn include_derived(mut self, include: bool) -> Self {
        self.settings.include_derived = include;
        self
    }

    /// Only dispatch messages for which `predicate` returns `true`.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(move |message: &dyn AnyMessage| {
            message.view::<M>().is_some_and(&predicate)
        }));
        self
    }

    /// Finishes with an async handler.
    pub fn handle<F, Fut, R>(self, f: F) -> Dispatcher
    where
        F: Fn(MessageContext<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
        R: IntoReply + Send + 'static,
    {
        let handler = Arc::new(AsyncFnHandler::new(f));
        self.settings.finish(DEFAULT_CONSUMER, self.predicate, true, handler)
    }

    /// Finishes with a synchronous handler.
    pub fn handle_sync<F, R>(self, f: F) -> Dispatcher
    where
        F: Fn(MessageContext<M>) -> HandlerResult<R> + Send + Sync + 'static,
        R: IntoReply + Send + 'static,
    {
        let handler = Arc::new(SyncFnHandler::new(f));
        self.settings.finish(DEFAULT_CONSUMER, self.predicate, false, handler)
    }

    /// Finishes with a consumer built by `factory` for every delivery.
    ///
    /// The consumer name defaults to the consumer's type name.
    pub fn consume_with<C, F>(self, factory: F) -> Dispatcher
    where
        C: Consumer<M>,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let handler = Arc::new(FactoryHandler::<M, C, F>::new(factory));
        let consumer = short_type_name::<C>();
        self.settings.finish(consumer, self.predicate, true, handler)
    }
}

/// Builder for a dispatcher over a runtime descriptor.
pub struct EnvelopeDispatcherBuilder {
    settings: Settings,
    predicate: Option<Predicate>,
}

impl EnvelopeDispatcherBuilder {
    pub fn consumer(mut self, name: impl Into<String>) -> Self {
        self.settings.consumer = Some(name.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.handler_name = Some(name.into());
        self
    }

    pub fn include_derived(mut self, include: bool) -> Self {
        self.settings.include_derived = include;
        self
    }

    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&dyn AnyMessage) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn handle<F, Fut, R>(self, f: F) -> Dispatcher
    where
        F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
        R: IntoReply + Send + 'static,
    {
        let handler = Arc::new(EnvelopeFnHandler::new(f));
        self.settings.finish(DEFAULT_CONSUMER, self.predicate, true, handler)
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::Reply;
    use crate::foundation::{command, query};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Transfer {
        amount: u64,
    }

    impl Message for Transfer {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::Transfer", "Transfer", command);
            &TYPE
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Balance;

    impl Message for Balance {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::Balance", "Balance", query);
            &TYPE
        }
    }

    #[test]
    fn test_defaults() {
        let dispatcher = Dispatcher::on::<Transfer>().handle_sync(|_ctx| Ok(()));
        assert_eq!(dispatcher.display_name(), "anonymous::on_Transfer");
        assert!(!dispatcher.include_derived());
        assert!(!dispatcher.is_async());
        assert!(dispatcher.applies_to(&Transfer { amount: 1 }));
    }

    #[test]
    fn test_predicate_views_message() {
        let dispatcher = Dispatcher::on::<Transfer>()
            .when(|t| t.amount > 100)
            .handle(|_ctx| async { Ok(()) });

        assert!(dispatcher.has_predicate());
        assert!(dispatcher.applies_to(&Transfer { amount: 500 }));
        assert!(!dispatcher.applies_to(&Transfer { amount: 5 }));
        assert!(!dispatcher.applies_to(&Balance));
    }

    #[tokio::test]
    async fn test_consumer_factory_builds_per_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static BUILT: AtomicUsize = AtomicUsize::new(0);

        struct BalanceReader;

        #[async_trait]
        impl Consumer<Balance> for BalanceReader {
            type Reply = Reply<u64>;

            async fn consume(&self, _ctx: MessageContext<Balance>) -> HandlerResult<Reply<u64>> {
                Ok(Reply(42))
            }
        }

        let dispatcher = Dispatcher::on::<Balance>().consume_with(|| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            BalanceReader
        });
        assert_eq!(dispatcher.consumer(), "BalanceReader");

        let envelope = Arc::new(Envelope::new(Balance));
        for _ in 0..2 {
            let reply = dispatcher.invoke(Arc::clone(&envelope)).await.unwrap();
            assert_eq!(reply, Some(Value::from(42)));
        }
        assert_eq!(BUILT.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mismatched_envelope_is_an_error() {
        let dispatcher = Dispatcher::on::<Transfer>().handle_sync(|_ctx| Ok(()));
        let result = dispatcher.invoke(Arc::new(Envelope::new(Balance))).await;
        assert!(result.is_err());
    }
}
