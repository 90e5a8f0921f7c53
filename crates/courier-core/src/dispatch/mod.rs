//! Message dispatch: handlers, dispatchers and type-hierarchy resolution.

pub mod dispatcher;
pub mod handler;
pub mod resolver;

pub use dispatcher::{Dispatcher, DispatcherBuilder, EnvelopeDispatcherBuilder, Predicate};
pub use handler::{
    BoxFuture, BoxedHandler, Consumer, ErasedHandler, HandlerResult, IntoReply, MessageContext,
    Reply,
};
pub use resolver::{DispatchRegistry, DispatchReport, DispatchResolver};
