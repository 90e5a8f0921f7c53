//! Configuration for the Courier runtime.
//!
//! Loading is layered with figment (defaults, files, `COURIER_*` environment
//! variables, programmatic merges) and followed by an explicit validation pass.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BrokerConfig, CourierConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, MessagingConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
