//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("config file {0} does not exist")]
    NotFound(PathBuf),

    /// The file extension is unknown or its format feature is disabled.
    #[error("config file {0} has no enabled format (enable `toml-config` or `yaml-config`)")]
    UnsupportedFormat(PathBuf),

    /// A source could not be read or did not match the schema.
    #[error("could not read configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    /// A value is out of range or inconsistent.
    #[error("{section}: {message}")]
    Invalid { section: String, message: String },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("broker '{broker}' has url '{url}', expected scheme://host")]
    InvalidUrl { broker: String, url: String },
}

impl ConfigError {
    pub fn invalid(section: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            section: section.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
