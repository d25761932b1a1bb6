//! core::config
//!
//! Local settings: cache roots and backend selection.
//!
//! # Overview
//!
//! Settings are user-scoped and session-scoped: they bind a persistence
//! backend, a map of transport backends and the cache roots. Nothing here
//! is versioned. Per-project values (version naming, default repository)
//! are persisted through the database as a [`ProjectRecord`].
//!
//! [`ProjectRecord`]: crate::core::metadata::ProjectRecord
//!
//! # Precedence
//!
//! 1. Default values
//! 2. Settings file (first match in the search order of [`schema`])
//! 3. Explicit overrides by the caller (not handled here)
//!
//! # Example
//!
//! ```no_run
//! use pulse::core::config::Config;
//!
//! let result = Config::load().unwrap();
//! let config = result.config;
//!
//! println!("Sandbox: {}", config.sandbox_root().unwrap().display());
//! println!("Database: {}", config.database().backend);
//! ```

pub mod schema;

pub use schema::{BackendSettings, Settings};

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::fsutil;

/// Name of the backend used when nothing is configured.
pub const DEFAULT_BACKEND: &str = "memory";

/// Name of the repository used when nothing is configured.
pub const DEFAULT_REPOSITORY: &str = "default";

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("failed to write config file '{path}': {message}")]
    WriteError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),

    #[error("home directory not found")]
    NoHomeDir,
}

/// Warnings generated during config loading.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub path: PathBuf,
}

/// Result of loading configuration.
#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub warnings: Vec<ConfigWarning>,
}

/// Loaded settings plus where they came from.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub settings: Settings,
    path: Option<PathBuf>,
}

impl Config {
    /// Wrap settings built in code.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the settings do not validate.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            settings,
            path: None,
        })
    }

    /// Load settings from the default locations.
    ///
    /// Missing files are not an error (defaults are used).
    pub fn load() -> Result<ConfigLoadResult, ConfigError> {
        let mut warnings = Vec::new();

        if let Ok(path) = std::env::var("PULSE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(ConfigLoadResult {
                    config: Self::load_from(&path)?,
                    warnings,
                });
            }
            warnings.push(ConfigWarning {
                message: "PULSE_CONFIG points to a missing file, ignoring it".to_string(),
                path,
            });
        }

        if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_home).join("pulse/config.toml");
            if path.exists() {
                return Ok(ConfigLoadResult {
                    config: Self::load_from(&path)?,
                    warnings,
                });
            }
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".pulse/config.toml");
            if path.exists() {
                return Ok(ConfigLoadResult {
                    config: Self::load_from(&path)?,
                    warnings,
                });
            }
        }

        Ok(ConfigLoadResult {
            config: Config::default(),
            warnings,
        })
    }

    /// Load and validate a specific settings file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        settings.validate()?;

        Ok(Self {
            settings,
            path: Some(path.to_path_buf()),
        })
    }

    /// Get the canonical settings path (`~/.pulse/config.toml`).
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".pulse/config.toml"))
    }

    /// Write settings atomically, creating parent directories if needed.
    pub fn write(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        let contents = toml::to_string_pretty(settings)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        fsutil::atomic_write(path, contents.as_bytes()).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    // =========================================================================
    // Accessor methods with defaults
    // =========================================================================

    /// Root of work directories.
    ///
    /// Defaults to `~/.pulse/sandbox`.
    pub fn sandbox_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.settings.sandbox_root {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::pulse_home()?.join("sandbox")),
        }
    }

    /// Root of the product cache.
    ///
    /// Defaults to `~/.pulse/products`.
    pub fn products_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.settings.products_root {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::pulse_home()?.join("products")),
        }
    }

    fn pulse_home() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".pulse"))
            .ok_or(ConfigError::NoHomeDir)
    }

    /// Persistence backend, defaulting to the in-memory one.
    pub fn database(&self) -> BackendSettings {
        self.settings
            .database
            .clone()
            .unwrap_or_else(|| BackendSettings::new(DEFAULT_BACKEND))
    }

    /// Transport backends by repository name.
    ///
    /// Defaults to a single in-memory repository named "default".
    pub fn repositories(&self) -> Vec<(String, BackendSettings)> {
        if self.settings.repositories.is_empty() {
            return vec![(
                DEFAULT_REPOSITORY.to_string(),
                BackendSettings::new(DEFAULT_BACKEND),
            )];
        }
        self.settings
            .repositories
            .iter()
            .map(|(name, backend)| (name.clone(), backend.clone()))
            .collect()
    }

    /// Repository assigned to newly created projects.
    pub fn default_repository(&self) -> String {
        if let Some(name) = &self.settings.default_repository {
            return name.clone();
        }
        if self.settings.repositories.contains_key(DEFAULT_REPOSITORY)
            || self.settings.repositories.is_empty()
        {
            return DEFAULT_REPOSITORY.to_string();
        }
        self.settings
            .repositories
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| DEFAULT_REPOSITORY.to_string())
    }

    /// Path the settings were loaded from, if any.
    pub fn loaded_from(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
