//! Composition and lifecycle of a messaging process.
//!
//! [`MessagingRuntime::builder`] collects the process's parts: one
//! [`MessageRoutes`] router component with the local dispatchers, topology
//! registries, pipeline stages, extra publishers and transports. `build`
//! loads configuration, composes and validates the topology, and wires the
//! router. Nothing touches a broker until [`MessagingRuntime::start`].
//!
//! ```rust,ignore
//! let runtime = MessagingRuntime::builder()
//!     .config_file("courier.toml")
//!     .routes(MessageRoutes::new("orders").dispatcher(ship_order))
//!     .topology(orders_topology)
//!     .build()?;
//!
//! runtime.run().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use courier_broker::{
    BrokerPublisher, BrokerTransport, ConnectionManager, MemoryBroker, RpcClient, SubscriberHost,
    Topology, TopologyRegistry,
};
use courier_core::{
    BoxedPublisher, Codec, DispatchRegistry, Dispatcher, Enricher, LocalPublisher, Message,
    MessageRouter, Pipeline, PostFilter, PreFilter, PublishReceipt, Publisher, SerializerRegistry,
};
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, CourierConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Transport scheme served by the built-in in-memory broker.
pub const MEMORY_SCHEME: &str = "memory";

// =============================================================================
// MessageRoutes
// =============================================================================

/// The router component: the dispatchers handling messages in-process.
///
/// A process has exactly one.
pub struct MessageRoutes {
    name: String,
    dispatchers: DispatchRegistry,
}

impl MessageRoutes {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dispatchers: DispatchRegistry::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatchers.add(dispatcher);
        self
    }

    /// Adds every dispatcher of a module's registry.
    pub fn dispatchers(mut self, registry: DispatchRegistry) -> Self {
        self.dispatchers.extend(registry);
        self
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }
}

// =============================================================================
// MessagingRuntime
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Built,
    Running,
    Stopped,
}

/// A composed messaging process.
pub struct MessagingRuntime {
    config: CourierConfig,
    router: Arc<MessageRouter>,
    topology: Arc<Topology>,
    connections: Arc<ConnectionManager>,
    rpc: Arc<RpcClient>,
    hosts: Vec<Arc<SubscriberHost>>,
    rpc_watcher: RwLock<Option<JoinHandle<()>>>,
    lifecycle: RwLock<Lifecycle>,
}

impl MessagingRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    pub async fn is_running(&self) -> bool {
        *self.lifecycle.read().await == Lifecycle::Running
    }

    /// Publishes through the router.
    pub async fn publish<M: Message>(&self, message: M) -> RuntimeResult<PublishReceipt> {
        Ok(self.router.publish(message).await?)
    }

    /// Sends a request through the router and decodes its reply.
    pub async fn send<R: DeserializeOwned, M: Message>(&self, message: M) -> RuntimeResult<R> {
        Ok(self.router.send(message).await?)
    }

    /// Connects every broker and starts consumers.
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.write().await;
        match *lifecycle {
            Lifecycle::Running => {
                warn!("Runtime is already running");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(RuntimeError::Stopped),
            Lifecycle::Built => {}
        }

        info!(brokers = self.topology.brokers().count(), "Starting messaging runtime");

        for broker in self.connections.broker_names() {
            self.connections.connect(broker).await?;
            debug!(broker, "Broker connected");
        }

        *self.rpc_watcher.write().await = Some(self.rpc.watch_connections());

        for host in &self.hosts {
            if let Err(e) = host.start().await {
                error!(broker = host.broker(), error = %e, "Failed to start subscriber host");
                self.shutdown().await;
                *lifecycle = Lifecycle::Stopped;
                return Err(e.into());
            }
            info!(broker = host.broker(), "Subscriber host started");
        }

        *lifecycle = Lifecycle::Running;
        info!("Runtime started");
        Ok(())
    }

    /// Stops consumers, cancels pending requests and closes connections.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle != Lifecycle::Running {
            warn!("Runtime is not running");
            return Ok(());
        }

        info!("Stopping messaging runtime");
        self.shutdown().await;
        *lifecycle = Lifecycle::Stopped;
        info!("Runtime stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        for host in &self.hosts {
            host.stop().await;
        }
        if let Some(watcher) = self.rpc_watcher.write().await.take() {
            watcher.abort();
        }
        self.rpc.shutdown().await;
        self.connections.shutdown().await;
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Messaging runtime is running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;
        self.stop().await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }
}

impl std::fmt::Debug for MessagingRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingRuntime")
            .field("brokers", &self.topology.broker_names().collect::<Vec<_>>())
            .field("publishers", &self.router.chain().publisher_names())
            .finish_non_exhaustive()
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Collects the parts of a [`MessagingRuntime`].
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<CourierConfig>,
    init_logging: bool,
    routes: Vec<MessageRoutes>,
    registries: Vec<Box<dyn TopologyRegistry>>,
    transports: HashMap<String, Arc<dyn BrokerTransport>>,
    pipeline: Pipeline,
    publishers: Vec<BoxedPublisher>,
    codecs: SerializerRegistry,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        let mut transports: HashMap<String, Arc<dyn BrokerTransport>> = HashMap::new();
        transports.insert(MEMORY_SCHEME.to_string(), Arc::new(MemoryBroker::new()));

        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            config: None,
            init_logging: true,
            routes: Vec::new(),
            registries: Vec::new(),
            transports,
            pipeline: Pipeline::with_default_enrichers(),
            publishers: Vec::new(),
            codecs: SerializerRegistry::with_defaults(),
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges values into the loaded configuration.
    pub fn merge(mut self, config: CourierConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses this configuration instead of loading one.
    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    // ------------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------------

    /// Registers the router component.
    pub fn routes(mut self, routes: MessageRoutes) -> Self {
        self.routes.push(routes);
        self
    }

    pub fn topology<R: TopologyRegistry + 'static>(mut self, registry: R) -> Self {
        self.registries.push(Box::new(registry));
        self
    }

    /// Serves broker URLs with this scheme through `transport`.
    pub fn transport(mut self, scheme: impl Into<String>, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transports.insert(scheme.into(), transport);
        self
    }

    pub fn enricher<E: Enricher + 'static>(mut self, enricher: E) -> Self {
        self.pipeline.add_enricher(enricher);
        self
    }

    pub fn pre_filter<F: PreFilter + 'static>(mut self, filter: F) -> Self {
        self.pipeline.add_pre_filter(filter);
        self
    }

    pub fn post_filter<F: PostFilter + 'static>(mut self, filter: F) -> Self {
        self.pipeline.add_post_filter(filter);
        self
    }

    /// Appends a publisher after the local and broker publishers.
    pub fn publisher<P: Publisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    pub fn serializer<C: Codec + 'static>(mut self, codec: C) -> Self {
        self.codecs.add_serializer(codec);
        self
    }

    // ------------------------------------------------------------------------
    // Build
    // ------------------------------------------------------------------------

    pub fn build(mut self) -> RuntimeResult<MessagingRuntime> {
        let routes = self.single_routes()?;

        let config = match self.config {
            Some(config) => {
                validate_config(&config)?;
                config
            }
            None => self.config_loader.load()?,
        };
        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let topology = compose_topology(&self.registries, &config)?;
        let connections = Arc::new(connect_brokers(&topology, &config, &self.transports)?);
        let codecs = Arc::new(self.codecs);
        let rpc = Arc::new(RpcClient::new(Arc::clone(&connections), Arc::clone(&codecs)));

        let resolver = Arc::new(routes.dispatchers.build());
        let mut router = MessageRouter::builder()
            .pipeline(self.pipeline)
            .publisher(LocalPublisher::new(resolver));
        if !topology.is_empty() {
            router = router.publisher(BrokerPublisher::new(
                Arc::clone(&topology),
                Arc::clone(&connections),
                Arc::clone(&codecs),
                Arc::clone(&rpc),
            ));
        }
        for publisher in self.publishers {
            router = router.boxed_publisher(publisher);
        }
        let router = Arc::new(router.build());

        let hosts = topology
            .brokers()
            .filter(|broker| !broker.subscriptions().is_empty())
            .map(|broker| {
                Arc::new(SubscriberHost::new(
                    broker.name(),
                    Arc::clone(&topology),
                    Arc::clone(&connections),
                    Arc::clone(&codecs),
                ))
            })
            .collect();

        info!(
            routes = %routes.name,
            brokers = topology.brokers().count(),
            publishers = ?router.chain().publisher_names(),
            "Runtime built"
        );

        Ok(MessagingRuntime {
            config,
            router,
            topology,
            connections,
            rpc,
            hosts,
            rpc_watcher: RwLock::new(None),
            lifecycle: RwLock::new(Lifecycle::Built),
        })
    }

    /// Takes the router component, rejecting a second one.
    fn single_routes(&mut self) -> RuntimeResult<MessageRoutes> {
        let mut routes = std::mem::take(&mut self.routes).into_iter();
        let first = routes.next();
        if let (Some(first), Some(second)) = (&first, routes.next()) {
            return Err(RuntimeError::DuplicateRouter {
                first: first.name.clone(),
                second: second.name,
            });
        }
        Ok(first.unwrap_or_else(|| MessageRoutes::new("default")))
    }
}

/// Composes registries, then applies messaging defaults and per-broker
/// settings before validating.
fn compose_topology(
    registries: &[Box<dyn TopologyRegistry>],
    config: &CourierConfig,
) -> RuntimeResult<Arc<Topology>> {
    let mut topology = Topology::compose(registries.iter().map(|r| r.as_ref()))?;

    topology.apply_defaults(
        &config.messaging.default_content_type,
        config.messaging.rpc_timeout(),
    );
    for (name, broker) in &config.brokers {
        topology.apply_settings(name, &broker.topology_settings());
    }
    topology.validate()?;

    Ok(Arc::new(topology))
}

fn connect_brokers(
    topology: &Topology,
    config: &CourierConfig,
    transports: &HashMap<String, Arc<dyn BrokerTransport>>,
) -> RuntimeResult<ConnectionManager> {
    if let Some(missing) = topology
        .broker_names()
        .find(|name| !config.brokers.contains_key(*name))
    {
        return Err(RuntimeError::UnconfiguredBroker(missing.to_string()));
    }

    let mut connections = ConnectionManager::new();
    for (name, broker) in &config.brokers {
        let scheme = broker.scheme().unwrap_or_default();
        let transport = transports
            .get(scheme)
            .ok_or_else(|| RuntimeError::UnsupportedTransport {
                broker: name.clone(),
                scheme: scheme.to_string(),
            })?;
        connections.add_broker(name.clone(), Arc::clone(transport), broker.to_options());
        debug!(broker = %name, url = %broker.url, transport = transport.name(), "Registered broker");
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use courier_broker::topology::{ExchangeType, QueueSettings, topology_registry};
    use courier_core::{BoxError, Reply};
    use courier_macros::Message;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize, Message)]
    #[message(kind = "event")]
    struct InvoiceIssued {
        number: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Message)]
    #[message(kind = "query")]
    struct GetTotal {
        number: u32,
    }

    fn config_with_broker(name: &str) -> CourierConfig {
        let mut config = CourierConfig::default();
        config.brokers.insert(
            name.into(),
            BrokerConfig {
                url: "memory://test".into(),
                reconnect_interval_ms: 20,
                ..Default::default()
            },
        );
        config
    }

    #[test]
    fn test_second_router_is_rejected() {
        let result = MessagingRuntime::builder()
            .config(CourierConfig::default())
            .without_logging()
            .routes(MessageRoutes::new("billing"))
            .routes(MessageRoutes::new("shipping"))
            .build();

        assert!(matches!(
            result,
            Err(RuntimeError::DuplicateRouter { ref first, ref second })
                if first == "billing" && second == "shipping"
        ));
    }

    #[test]
    fn test_unconfigured_broker_is_rejected() {
        let result = MessagingRuntime::builder()
            .config(CourierConfig::default())
            .without_logging()
            .topology(topology_registry("billing", "main", |t| {
                t.define_queue::<InvoiceIssued>("invoices");
            }))
            .build();

        assert!(matches!(result, Err(RuntimeError::UnconfiguredBroker(name)) if name == "main"));
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let mut config = CourierConfig::default();
        config.brokers.insert(
            "main".into(),
            BrokerConfig {
                url: "amqp://localhost".into(),
                ..Default::default()
            },
        );
        let result = MessagingRuntime::builder()
            .config(config)
            .without_logging()
            .build();

        assert!(matches!(result, Err(RuntimeError::UnsupportedTransport { .. })));
    }

    #[test]
    fn test_settings_are_merged_before_validation() {
        let mut config = config_with_broker("main");
        config.brokers.get_mut("main").unwrap().queues.insert(
            "billing".into(),
            QueueSettings {
                clear_route_keys: true,
                ..Default::default()
            },
        );

        let result = MessagingRuntime::builder()
            .config(config)
            .without_logging()
            .topology(topology_registry("billing", "main", |t| {
                t.subscribe_to_exchange::<InvoiceIssued>(
                    "invoices",
                    ExchangeType::Topic,
                    Dispatcher::on::<InvoiceIssued>().handle(|_| async { Ok(()) }),
                )
                .queue_name("billing")
                .route_key("invoices.#");
            }))
            .build();

        assert!(matches!(result, Err(RuntimeError::Topology(_))));
    }

    #[tokio::test]
    async fn test_local_and_broker_delivery() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let runtime = MessagingRuntime::builder()
            .config(config_with_broker("main"))
            .without_logging()
            .transport(MEMORY_SCHEME, Arc::new(broker.clone()))
            .routes(MessageRoutes::new("billing").dispatcher(
                Dispatcher::on::<GetTotal>().handle(|ctx| async move {
                    Ok::<_, BoxError>(Reply(ctx.number * 100))
                }),
            ))
            .topology(topology_registry("billing", "main", move |t| {
                let tx = tx.clone();
                t.define_exchange::<InvoiceIssued>("invoices", ExchangeType::Fanout);
                t.subscribe_to_exchange::<InvoiceIssued>(
                    "invoices",
                    ExchangeType::Fanout,
                    Dispatcher::on::<InvoiceIssued>().handle(move |ctx| {
                        let tx = tx.clone();
                        async move {
                            tx.send(ctx.number).ok();
                            Ok(())
                        }
                    }),
                );
            }))
            .build()
            .unwrap();

        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);

        let total: u32 = runtime.send(GetTotal { number: 4 }).await.unwrap();
        assert_eq!(total, 400);

        runtime.publish(InvoiceIssued { number: 12 }).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(12));

        runtime.stop().await.unwrap();
        assert!(!runtime.is_running().await);
        assert_eq!(broker.connection_count(), 0);
        assert!(matches!(runtime.start().await, Err(RuntimeError::Stopped)));
    }

    #[tokio::test]
    async fn test_run_until_stops_on_signal() {
        let runtime = MessagingRuntime::builder()
            .config(CourierConfig::default())
            .without_logging()
            .build()
            .unwrap();

        runtime
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(!runtime.is_running().await);
    }
}
