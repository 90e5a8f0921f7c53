//! Courier Runtime - composition layer for the Courier message bus.
//!
//! This crate provides:
//! - Layered configuration (`ConfigLoader`, `CourierConfig`)
//! - Logging setup on `tracing-subscriber` (`LoggingBuilder`)
//! - Process composition and lifecycle (`MessagingRuntime`)
//!
//! # Composition
//!
//! A process registers exactly one [`MessageRoutes`] with its local
//! dispatchers, any number of topology registries, and optional pipeline
//! stages and publishers. Broker connections come from configuration; the
//! URL scheme selects the transport.
//!
//! ```ignore
//! use courier_runtime::{MessageRoutes, MessagingRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = MessagingRuntime::builder()
//!         .routes(MessageRoutes::new("orders").dispatchers(orders::dispatchers()))
//!         .topology(orders::topology())
//!         .build()?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [messaging]
//! rpc_timeout_ms = 5000
//!
//! [brokers.main]
//! url = "memory://local"
//!
//! [brokers.main.queues.shipping]
//! prefetch_count = 20
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

// Re-exports
pub use config::{
    BrokerConfig, ConfigError, ConfigLoader, ConfigResult, CourierConfig, LoggingConfig,
    MessagingConfig, Profile,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, LoggingError, SpanEvents};
pub use runtime::{MEMORY_SCHEME, MessageRoutes, MessagingRuntime, RuntimeBuilder};

pub use tracing;
pub use tracing_subscriber;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{ConfigLoader, CourierConfig};
    pub use crate::error::{RuntimeError, RuntimeResult};
    pub use crate::logging::{LoggingBuilder, SpanEvents};
    pub use crate::runtime::{MessageRoutes, MessagingRuntime};
}
