//! Handler abstractions.
//!
//! Three handler shapes are supported, all erased into [`ErasedHandler`]:
//!
//! - async closures taking a [`MessageContext<M>`]
//! - sync closures taking a [`MessageContext<M>`]
//! - [`Consumer`] implementations built by a factory once per delivery
//!
//! A handler returns `()` when it produces nothing and [`Reply<T>`] when it
//! answers a request.

use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
pub use futures::future::BoxFuture;
use futures::future::{self, FutureExt};
use serde::Serialize;
use serde_json::Value;

use crate::error::{BoxError, CodecError, CodecResult, MessageMismatch};
use crate::foundation::{Envelope, Message};

/// Result type returned by handlers.
pub type HandlerResult<T = ()> = Result<T, BoxError>;

// ============================================================================
// Replies
// ============================================================================

/// A reply produced by a request handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T>(pub T);

/// Conversion of a handler's return value into an optional reply.
pub trait IntoReply {
    fn into_reply(self) -> CodecResult<Option<Value>>;
}

impl IntoReply for () {
    fn into_reply(self) -> CodecResult<Option<Value>> {
        Ok(None)
    }
}

impl<T: Serialize> IntoReply for Reply<T> {
    fn into_reply(self) -> CodecResult<Option<Value>> {
        serde_json::to_value(self.0)
            .map(Some)
            .map_err(|e| CodecError::Encode {
                content_type: "application/json".into(),
                reason: e.to_string(),
            })
    }
}

impl<T: Serialize> IntoReply for Option<Reply<T>> {
    fn into_reply(self) -> CodecResult<Option<Value>> {
        match self {
            Some(reply) => reply.into_reply(),
            None => Ok(None),
        }
    }
}

// ============================================================================
// Message Context
// ============================================================================

/// The message a handler receives, viewed as the handler's type, plus the
/// envelope it arrived in.
#[derive(Debug, Clone)]
pub struct MessageContext<M> {
    message: M,
    envelope: Arc<Envelope>,
}

impl<M: Message> MessageContext<M> {
    /// Views the envelope body as `M`.
    pub fn from_envelope(envelope: Arc<Envelope>) -> Result<Self, MessageMismatch> {
        let message = envelope
            .message::<M>()
            .cloned()
            .ok_or_else(|| MessageMismatch {
                expected: M::message_type().name(),
                actual: envelope.message_type().name(),
            })?;
        Ok(Self { message, envelope })
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn envelope(&self) -> &Arc<Envelope> {
        &self.envelope
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.envelope.correlation_id()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.envelope.message_id()
    }

    pub fn into_inner(self) -> M {
        self.message
    }
}

impl<M> Deref for MessageContext<M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

// ============================================================================
// Erased Handler
// ============================================================================

/// Object-safe handler invoked by the dispatcher.
pub trait ErasedHandler: Send + Sync {
    fn call(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>>;
}

/// A shared erased handler.
pub type BoxedHandler = Arc<dyn ErasedHandler>;

fn ready<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    future::ready(value).boxed()
}

/// Wraps an async closure over `MessageContext<M>`.
pub(crate) struct AsyncFnHandler<M, F> {
    f: F,
    _marker: PhantomData<fn() -> M>,
}

impl<M, F> AsyncFnHandler<M, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<M, F, Fut, R> ErasedHandler for AsyncFnHandler<M, F>
where
    M: Message,
    F: Fn(MessageContext<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>> {
        let ctx = match MessageContext::<M>::from_envelope(envelope) {
            Ok(ctx) => ctx,
            Err(e) => return ready(Err(e.into())),
        };
        let fut = (self.f)(ctx);
        async move { Ok::<_, BoxError>(fut.await?.into_reply()?) }.boxed()
    }
}

/// Wraps a synchronous closure over `MessageContext<M>`.
///
/// The closure runs inline when the dispatcher invokes the handler.
pub(crate) struct SyncFnHandler<M, F> {
    f: F,
    _marker: PhantomData<fn() -> M>,
}

impl<M, F> SyncFnHandler<M, F> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<M, F, R> ErasedHandler for SyncFnHandler<M, F>
where
    M: Message,
    F: Fn(MessageContext<M>) -> HandlerResult<R> + Send + Sync + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>> {
        let result = MessageContext::<M>::from_envelope(envelope)
            .map_err(BoxError::from)
            .and_then(|ctx| (self.f)(ctx))
            .and_then(|reply| reply.into_reply().map_err(BoxError::from));
        ready(result)
    }
}

/// Wraps an async closure over the raw envelope.
pub(crate) struct EnvelopeFnHandler<F> {
    f: F,
}

impl<F> EnvelopeFnHandler<F> {
    pub(crate) fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut, R> ErasedHandler for EnvelopeFnHandler<F>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>> {
        let fut = (self.f)(envelope);
        async move { Ok::<_, BoxError>(fut.await?.into_reply()?) }.boxed()
    }
}

// ============================================================================
// Consumers
// ============================================================================

/// A stateful message consumer.
///
/// A fresh consumer is built by its factory for every delivery, so per-call
/// state never leaks between messages.
///
/// ```rust,ignore
/// struct ShipOrder { store: Arc<OrderStore> }
///
/// #[async_trait]
/// impl Consumer<OrderPlaced> for ShipOrder {
///     type Reply = ();
///
///     async fn consume(&self, ctx: MessageContext<OrderPlaced>) -> HandlerResult {
///         self.store.mark_shipped(&ctx.order_id).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync + 'static {
    type Reply: IntoReply + Send;

    async fn consume(&self, ctx: MessageContext<M>) -> HandlerResult<Self::Reply>;
}

/// Builds a consumer per delivery and invokes it.
pub(crate) struct FactoryHandler<M, C, F> {
    factory: F,
    _marker: PhantomData<fn() -> (M, C)>,
}

impl<M, C, F> FactoryHandler<M, C, F> {
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            _marker: PhantomData,
        }
    }
}

impl<M, C, F> ErasedHandler for FactoryHandler<M, C, F>
where
    M: Message,
    C: Consumer<M>,
    F: Fn() -> C + Send + Sync + 'static,
{
    fn call(&self, envelope: Arc<Envelope>) -> BoxFuture<'static, HandlerResult<Option<Value>>> {
        let ctx = match MessageContext::<M>::from_envelope(envelope) {
            Ok(ctx) => ctx,
            Err(e) => return ready(Err(e.into())),
        };
        let consumer = (self.factory)();
        async move {
            let reply = consumer.consume(ctx).await?;
            Ok::<_, BoxError>(reply.into_reply()?)
        }
        .boxed()
    }
}
