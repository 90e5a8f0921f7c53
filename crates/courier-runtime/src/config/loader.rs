//! Layered configuration loading on figment.
//!
//! Later layers override earlier ones:
//!
//! 1. Built-in defaults
//! 2. Values passed to [`ConfigLoader::merge`]
//! 3. `courier.toml` / `courier.yaml` from the first search directory that has one
//! 4. `courier.{profile}.toml` / `courier.{profile}.yaml` next to it
//! 5. `COURIER_*` environment variables
//!
//! An explicit [`ConfigLoader::file`] replaces steps 3 and 4. Formats are
//! enabled by the `toml-config` and `yaml-config` features.
//!
//! Environment variables nest with `__`:
//!
//! - `COURIER_LOGGING__LEVEL=debug` sets `logging.level`
//! - `COURIER_MESSAGING__RPC_TIMEOUT_MS=5000` sets `messaging.rpc_timeout_ms`
//! - `COURIER_BROKERS__MAIN__URL=memory://main` sets `brokers.main.url`
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .search_path("/etc/courier")
//!     .profile("staging")
//!     .load()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::CourierConfig;
use super::validation::validate_config;

pub const ENV_PREFIX: &str = "COURIER_";
/// Selects the profile when none is set on the loader.
pub const PROFILE_ENV: &str = "COURIER_PROFILE";

const FILE_STEM: &str = "courier";

// =============================================================================
// Profile
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Test,
    Named(String),
}

impl Profile {
    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        match name.as_str() {
            "dev" | "development" => Self::Development,
            "prod" | "production" => Self::Production,
            "test" => Self::Test,
            _ => Self::Named(name),
        }
    }

    pub fn from_env() -> Self {
        std::env::var(PROFILE_ENV)
            .ok()
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }

    fn file_suffix(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
            Self::Named(name) => name,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_suffix())
    }
}

// =============================================================================
// File formats
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Toml,
    Yaml,
}

impl FileFormat {
    const ALL: [FileFormat; 2] = [FileFormat::Toml, FileFormat::Yaml];

    fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Toml => &["toml"],
            Self::Yaml => &["yaml", "yml"],
        }
    }

    fn enabled(self) -> bool {
        match self {
            Self::Toml => cfg!(feature = "toml-config"),
            Self::Yaml => cfg!(feature = "yaml-config"),
        }
    }

    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extensions().contains(&ext.as_str()))
    }

    fn merge(self, figment: Figment, path: &Path) -> ConfigResult<Figment> {
        match self {
            #[cfg(feature = "toml-config")]
            Self::Toml => {
                use figment::providers::{Format, Toml};
                Ok(figment.merge(Toml::file(path)))
            }
            #[cfg(feature = "yaml-config")]
            Self::Yaml => {
                use figment::providers::{Format, Yaml};
                Ok(figment.merge(Yaml::file(path)))
            }
            #[allow(unreachable_patterns)]
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// The first existing `courier.<ext>` in `dir` with an enabled format.
fn find_main_file(dir: &Path) -> Option<(FileFormat, PathBuf)> {
    FileFormat::ALL
        .into_iter()
        .filter(|format| format.enabled())
        .flat_map(|format| {
            format
                .extensions()
                .iter()
                .map(move |ext| (format, dir.join(format!("{FILE_STEM}.{ext}"))))
        })
        .find(|(_, path)| path.is_file())
}

/// `courier.toml` -> `courier.production.toml`.
fn profile_variant(main: &Path, profile: &Profile) -> Option<PathBuf> {
    let ext = main.extension()?.to_str()?;
    Some(main.with_file_name(format!("{FILE_STEM}.{profile}.{ext}")))
}

// =============================================================================
// ConfigLoader
// =============================================================================

/// Builds a [`CourierConfig`] from defaults, files, overrides and the
/// environment.
pub struct ConfigLoader {
    overrides: Vec<CourierConfig>,
    profile: Option<Profile>,
    search_dirs: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    read_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            overrides: Vec::new(),
            profile: None,
            search_dirs: Vec::new(),
            explicit_file: None,
            read_env: true,
        }
    }

    /// Overrides `COURIER_PROFILE`.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(Profile::parse(&profile.into()));
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.search_dirs.push(dir.as_ref().to_owned());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(dir) => self.search_path(dir),
            Err(e) => {
                warn!(error = %e, "Current directory is unavailable");
                self
            }
        }
    }

    /// Adds `<user config dir>/courier`.
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join(FILE_STEM)),
            None => self,
        }
    }

    /// Loads exactly this file; search directories are ignored.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_owned());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.read_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    /// Layers `config` over the defaults, beneath files and environment.
    pub fn merge(mut self, config: CourierConfig) -> Self {
        self.overrides.push(config);
        self
    }

    pub fn load(self) -> ConfigResult<CourierConfig> {
        let profile = self.profile.clone().unwrap_or_else(Profile::from_env);
        let figment = self.figment(&profile)?;

        let config: CourierConfig = figment.extract().map_err(Box::new)?;
        validate_config(&config)?;

        debug!(
            %profile,
            level = %config.logging.level,
            brokers = ?config.brokers.keys().collect::<Vec<_>>(),
            "Configuration loaded"
        );
        Ok(config)
    }

    fn figment(&self, profile: &Profile) -> ConfigResult<Figment> {
        let mut figment = self
            .overrides
            .iter()
            .fold(Figment::from(Serialized::defaults(CourierConfig::default())), |f, config| {
                f.merge(Serialized::defaults(config))
            });

        for path in self.config_files(profile)? {
            let format = FileFormat::of(&path)
                .ok_or_else(|| ConfigError::UnsupportedFormat(path.clone()))?;
            info!(path = %path.display(), "Reading configuration file");
            figment = format.merge(figment, &path)?;
        }

        if self.read_env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }

    /// Files to merge, lowest precedence first.
    fn config_files(&self, profile: &Profile) -> ConfigResult<Vec<PathBuf>> {
        if let Some(path) = &self.explicit_file {
            if !path.is_file() {
                return Err(ConfigError::NotFound(path.clone()));
            }
            return Ok(vec![path.clone()]);
        }

        let dirs = if self.search_dirs.is_empty() {
            default_search_dirs()
        } else {
            self.search_dirs.clone()
        };

        let Some((_, main)) = dirs.iter().find_map(|dir| find_main_file(dir)) else {
            warn!(dirs = ?dirs, "No configuration file found, using defaults");
            return Ok(Vec::new());
        };

        let mut files = vec![main];
        if let Some(variant) = profile_variant(&files[0], profile)
            && variant.is_file()
        {
            files.push(variant);
        }
        Ok(files)
    }
}

fn default_search_dirs() -> Vec<PathBuf> {
    std::env::current_dir()
        .ok()
        .into_iter()
        .chain(dirs::config_dir().map(|dir| dir.join(FILE_STEM)))
        .collect()
}

/// Loads from the current directory and the environment.
pub fn load_config() -> ConfigResult<CourierConfig> {
    ConfigLoader::new().with_current_dir().load()
}

/// Loads one file plus the environment.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<CourierConfig> {
    ConfigLoader::new().file(path).load()
}
