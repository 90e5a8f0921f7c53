//! Dispatcher resolution.
//!
//! The [`DispatchResolver`] is built once from a [`DispatchRegistry`] and
//! answers "which dispatchers receive this message?" by walking the message
//! type's lineage:
//!
//! 1. Dispatchers registered for the exact runtime type always match.
//! 2. Dispatchers registered for an ancestor match only if they opted into
//!    derived types.
//! 3. Predicates are evaluated once per candidate.
//!
//! Matching dispatchers are returned in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{Instrument, Level, debug, span, warn};

use super::dispatcher::Dispatcher;
use crate::error::{DispatchError, DispatchResult, HandlerFailure};
use crate::foundation::{AnyMessage, Envelope, MessageType};

// ============================================================================
// Registry
// ============================================================================

/// Collects dispatchers during startup.
#[derive(Default, Clone, Debug)]
pub struct DispatchRegistry {
    dispatchers: Vec<Dispatcher>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dispatcher. Registration order is invocation order.
    pub fn add(&mut self, dispatcher: Dispatcher) -> &mut Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Adds a dispatcher (builder pattern).
    pub fn with(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Appends every dispatcher from another registry.
    pub fn extend(&mut self, other: DispatchRegistry) -> &mut Self {
        self.dispatchers.extend(other.dispatchers);
        self
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    pub fn dispatchers(&self) -> &[Dispatcher] {
        &self.dispatchers
    }

    pub fn build(self) -> DispatchResolver {
        DispatchResolver::new(self.dispatchers)
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// The outcome of a successful dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Display names of the dispatchers that ran, in order.
    pub invoked: Vec<String>,
    /// Replies produced, keyed by dispatcher display name.
    pub replies: Vec<(String, Value)>,
}

impl DispatchReport {
    /// Returns the first reply produced.
    pub fn first_reply(&self) -> Option<&Value> {
        self.replies.first().map(|(_, value)| value)
    }
}

#[derive(Debug)]
struct Entry {
    sequence: usize,
    dispatcher: Arc<Dispatcher>,
}

/// Read-only lookup from message types to dispatchers.
#[derive(Debug, Default)]
pub struct DispatchResolver {
    table: HashMap<&'static str, Vec<Entry>>,
    count: usize,
}

impl DispatchResolver {
    pub fn new(dispatchers: impl IntoIterator<Item = Dispatcher>) -> Self {
        let mut table: HashMap<&'static str, Vec<Entry>> = HashMap::new();
        let mut count = 0;
        for (sequence, dispatcher) in dispatchers.into_iter().enumerate() {
            table
                .entry(dispatcher.message_type().name())
                .or_default()
                .push(Entry {
                    sequence,
                    dispatcher: Arc::new(dispatcher),
                });
            count += 1;
        }
        Self { table, count }
    }

    /// Creates a resolver without dispatchers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn dispatcher_count(&self) -> usize {
        self.count
    }

    /// Returns the dispatchers registered directly for `message_type`.
    pub fn dispatchers_for(&self, message_type: &MessageType) -> Vec<Arc<Dispatcher>> {
        self.table
            .get(message_type.name())
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.dispatcher)).collect())
            .unwrap_or_default()
    }

    /// Returns the dispatchers that should receive `message`, in
    /// registration order.
    pub fn message_dispatchers(&self, message: &dyn AnyMessage) -> Vec<Arc<Dispatcher>> {
        let mut matched: Vec<&Entry> = Vec::new();

        for (depth, ty) in message.runtime_type().lineage().enumerate() {
            let Some(entries) = self.table.get(ty.name()) else {
                continue;
            };
            for entry in entries {
                let dispatcher = &entry.dispatcher;
                if depth > 0 && !dispatcher.include_derived() {
                    continue;
                }
                if dispatcher.applies_to(message) {
                    matched.push(entry);
                }
            }
        }

        matched.sort_by_key(|entry| entry.sequence);
        matched
            .into_iter()
            .map(|entry| Arc::clone(&entry.dispatcher))
            .collect()
    }

    /// Returns `true` if at least one dispatcher would receive `message`.
    pub fn has_dispatchers(&self, message: &dyn AnyMessage) -> bool {
        !self.message_dispatchers(message).is_empty()
    }

    /// Invokes every matching dispatcher sequentially.
    ///
    /// A failing handler does not stop the remaining handlers; all failures
    /// are returned together once every handler has run.
    pub async fn dispatch(&self, envelope: Arc<Envelope>) -> DispatchResult<DispatchReport> {
        let message_type = envelope.message_type();
        let span = span!(Level::DEBUG, "dispatch", message_type = %message_type.name());

        async move {
            let dispatchers = self.message_dispatchers(envelope.body());
            if dispatchers.is_empty() {
                debug!("No dispatchers matched");
                return Ok(DispatchReport::default());
            }

            let mut report = DispatchReport::default();
            let mut failures = Vec::new();

            for dispatcher in dispatchers {
                let name = dispatcher.display_name();
                debug!(dispatcher = %name, "Invoking handler");

                match dispatcher.invoke(Arc::clone(&envelope)).await {
                    Ok(reply) => {
                        if let Some(value) = reply {
                            report.replies.push((name.clone(), value));
                        }
                        report.invoked.push(name);
                    }
                    Err(error) => {
                        warn!(dispatcher = %name, error = %error, "Handler failed");
                        failures.push(HandlerFailure {
                            dispatcher: name,
                            error,
                        });
                    }
                }
            }

            if failures.is_empty() {
                Ok(report)
            } else {
                Err(DispatchError {
                    message_type: message_type.name(),
                    failures,
                })
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::Reply;
    use crate::foundation::{Message, domain_event, query};
    use serde::{Deserialize, Serialize};
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AccountEvent {
        account: String,
    }

    impl Message for AccountEvent {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType =
                MessageType::new("tests::AccountEvent", "AccountEvent", domain_event);
            &TYPE
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AccountOpened {
        base: AccountEvent,
        owner: String,
    }

    impl Message for AccountOpened {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new(
                "tests::AccountOpened",
                "AccountOpened",
                AccountEvent::message_type,
            );
            &TYPE
        }

        fn view_as(&self, ty: &MessageType) -> Option<&dyn Any> {
            if ty == Self::message_type() {
                return Some(self as &dyn Any);
            }
            Message::view_as(&self.base, ty)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GetOwner;

    impl Message for GetOwner {
        fn message_type() -> &'static MessageType {
            static TYPE: MessageType = MessageType::new("tests::GetOwner", "GetOwner", query);
            &TYPE
        }
    }

    fn opened() -> AccountOpened {
        AccountOpened {
            base: AccountEvent {
                account: "acc-1".into(),
            },
            owner: "ada".into(),
        }
    }

    fn names(dispatchers: &[Arc<Dispatcher>]) -> Vec<String> {
        dispatchers.iter().map(|d| d.display_name()).collect()
    }

    #[test]
    fn test_derived_messages_need_opt_in() {
        let resolver = DispatchRegistry::new()
            .with(
                Dispatcher::on::<AccountEvent>()
                    .consumer("exact")
                    .handle_sync(|_ctx| Ok(())),
            )
            .with(
                Dispatcher::on::<AccountEvent>()
                    .consumer("derived")
                    .include_derived(true)
                    .handle_sync(|_ctx| Ok(())),
            )
            .with(
                Dispatcher::on::<AccountOpened>()
                    .consumer("leaf")
                    .handle_sync(|_ctx| Ok(())),
            )
            .build();

        let matched = resolver.message_dispatchers(&opened());
        assert_eq!(
            names(&matched),
            vec!["derived::on_AccountEvent", "leaf::on_AccountOpened"]
        );

        let base = AccountEvent {
            account: "acc-2".into(),
        };
        assert_eq!(
            names(&resolver.message_dispatchers(&base)),
            vec!["exact::on_AccountEvent", "derived::on_AccountEvent"]
        );
        assert!(!resolver.has_dispatchers(&GetOwner));
    }

    #[test]
    fn test_predicate_evaluated_once_per_candidate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let resolver = DispatchRegistry::new()
            .with(
                Dispatcher::on::<AccountEvent>()
                    .include_derived(true)
                    .when(move |event| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        event.account == "acc-1"
                    })
                    .handle_sync(|_ctx| Ok(())),
            )
            .build();

        assert_eq!(resolver.message_dispatchers(&opened()).len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_runs_all_and_collects_failures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&counter);
        let c2 = Arc::clone(&counter);

        let resolver = DispatchRegistry::new()
            .with(
                Dispatcher::on::<AccountOpened>()
                    .consumer("first")
                    .handle(move |_ctx| {
                        let c = Arc::clone(&c1);
                        async move {
                            c.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
            )
            .with(
                Dispatcher::on::<AccountOpened>()
                    .consumer("broken")
                    .handle_sync(|_ctx| Err::<(), _>("ledger offline".into())),
            )
            .with(
                Dispatcher::on::<AccountOpened>()
                    .consumer("last")
                    .handle_sync(move |_ctx| {
                        c2.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
            )
            .build();

        let err = resolver
            .dispatch(Arc::new(Envelope::new(opened())))
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(err.dispatchers(), vec!["broken::on_AccountOpened"]);
        assert_eq!(err.message_type, "tests::AccountOpened");
    }

    #[tokio::test]
    async fn test_dispatch_collects_replies_in_order() {
        let resolver = DispatchRegistry::new()
            .with(
                Dispatcher::on::<GetOwner>()
                    .consumer("primary")
                    .handle(|_ctx| async { Ok(Reply("ada")) }),
            )
            .with(
                Dispatcher::on::<GetOwner>()
                    .consumer("fallback")
                    .handle_sync(|_ctx| Ok(Reply("grace"))),
            )
            .build();

        let report = resolver
            .dispatch(Arc::new(Envelope::new(GetOwner)))
            .await
            .unwrap();

        assert_eq!(report.invoked.len(), 2);
        assert_eq!(report.first_reply(), Some(&Value::from("ada")));
    }

    #[tokio::test]
    async fn test_dispatch_without_matches_is_empty() {
        let resolver = DispatchResolver::empty();
        let report = resolver
            .dispatch(Arc::new(Envelope::new(GetOwner)))
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::default());
    }
}
