//! Broker topology: exchanges, queues, subscriptions and their composition.

pub mod builder;
pub mod exchange;
pub mod queue;
pub mod registry;
pub mod route_key;
pub mod settings;

pub use builder::{DEFAULT_MAX_CONCURRENT_CALLS, ExchangeConfig, QueueConfig, TopologyBuilder};
pub use exchange::{DEFAULT_RPC_TIMEOUT, ExchangeDefinition, ExchangeType};
pub use queue::{DEFAULT_PREFETCH_COUNT, MessageDecoder, QueueDefinition, Subscription};
pub use registry::{BrokerTopology, FnTopologyRegistry, Topology, TopologyRegistry, topology_registry};
pub use route_key::{RouteKey, RouteKeyFn, topic_matches, validate_topic_pattern};
pub use settings::{ExchangeSettings, QueueSettings, TopologySettings};
