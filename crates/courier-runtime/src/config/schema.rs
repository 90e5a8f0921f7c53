//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use courier_broker::BrokerOptions;
use courier_broker::topology::{DEFAULT_RPC_TIMEOUT, ExchangeSettings, QueueSettings, TopologySettings};
use courier_core::content_types;
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CourierConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults applied to every broker entity.
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Broker connections by name.
    #[serde(default)]
    pub brokers: BTreeMap<String, BrokerConfig>,
}

// =============================================================================
// Messaging
// =============================================================================

/// Messaging defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Content type of entities that do not declare one.
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// RPC timeout of entities that do not declare one, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_content_type: default_content_type(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl MessagingConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn default_content_type() -> String {
    content_types::JSON.to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_RPC_TIMEOUT.as_millis() as u64
}

// =============================================================================
// Brokers
// =============================================================================

/// One broker connection and its topology overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker URL; the scheme selects the transport.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Delay between reconnection attempts in milliseconds.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Attempts before giving up; unlimited when absent.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Sessions kept for publishing when the transport shares sessions.
    #[serde(default = "default_session_pool_size")]
    pub session_pool_size: usize,

    /// Carry the content type inside the payload.
    #[serde(default)]
    pub channel_encoded_payload: bool,

    /// Exchange overrides by entity name.
    #[serde(default)]
    pub exchanges: BTreeMap<String, ExchangeSettings>,

    /// Queue overrides by queue name.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSettings>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: None,
            session_pool_size: default_session_pool_size(),
            channel_encoded_payload: false,
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
        }
    }
}

impl BrokerConfig {
    /// The URL scheme, e.g. `memory` for `memory://local`.
    pub fn scheme(&self) -> Option<&str> {
        self.url.split_once("://").map(|(scheme, _)| scheme)
    }

    pub fn to_options(&self) -> BrokerOptions {
        let mut options = BrokerOptions::new(self.url.clone())
            .with_reconnect_interval(Duration::from_millis(self.reconnect_interval_ms))
            .with_session_pool_size(self.session_pool_size)
            .with_channel_encoded_payload(self.channel_encoded_payload);
        if let Some(attempts) = self.max_reconnect_attempts {
            options = options.with_max_reconnect_attempts(attempts);
        }
        options
    }

    pub fn topology_settings(&self) -> TopologySettings {
        TopologySettings {
            exchanges: self.exchanges.clone(),
            queues: self.queues.clone(),
        }
    }
}

fn default_broker_url() -> String {
    "memory://localhost".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_session_pool_size() -> usize {
    4
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub span_events: SpanEventConfig,
    pub thread_ids: bool,
    /// Include file names and line numbers.
    pub file_location: bool,
    /// Log file for `output = "file"`.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Rotated files kept on disk.
    pub max_files: usize,
    /// Per-module levels, e.g. `courier_broker = "debug"`.
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: 5,
            filters: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_options_from_config() {
        let config = BrokerConfig {
            url: "memory://orders".into(),
            reconnect_interval_ms: 250,
            max_reconnect_attempts: Some(3),
            ..Default::default()
        };
        let options = config.to_options();

        assert_eq!(config.scheme(), Some("memory"));
        assert_eq!(options.reconnect_interval, Duration::from_millis(250));
        assert_eq!(options.max_reconnect_attempts, Some(3));
        assert_eq!(options.session_pool_size, 4);
    }

    #[test]
    fn test_messaging_defaults() {
        let messaging = MessagingConfig::default();
        assert_eq!(messaging.default_content_type, content_types::JSON);
        assert_eq!(messaging.rpc_timeout(), Duration::from_secs(10));
    }
}
