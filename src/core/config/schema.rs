//! core::config::schema
//!
//! Configuration schema types.
//!
//! # Location
//!
//! Searched in order:
//! 1. `$PULSE_CONFIG` if set
//! 2. `$XDG_CONFIG_HOME/pulse/config.toml`
//! 3. `~/.pulse/config.toml` (canonical write location)
//!
//! # Validation
//!
//! Config values are validated after parsing: backend names must be
//! non-empty and the default repository must be declared.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Local, per-user settings.
///
/// # Example
///
/// ```toml
/// sandbox_root = "/home/me/pulse/sandbox"
/// products_root = "/home/me/pulse/products"
/// default_repository = "main"
///
/// [database]
/// backend = "memory"
///
/// [repositories.main]
/// backend = "memory"
///
/// [repositories.archive]
/// backend = "memory"
/// options = { bucket = "cold" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Root of work directories
    pub sandbox_root: Option<PathBuf>,

    /// Root of the product cache
    pub products_root: Option<PathBuf>,

    /// Repository assigned to newly created projects
    pub default_repository: Option<String>,

    /// Persistence backend
    pub database: Option<BackendSettings>,

    /// Transport backends by repository name
    pub repositories: BTreeMap<String, BackendSettings>,
}

impl Settings {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(database) = &self.database {
            database.validate("database")?;
        }

        for (name, repository) in &self.repositories {
            if name.is_empty() {
                return Err(ConfigError::InvalidValue(
                    "repository name cannot be empty".to_string(),
                ));
            }
            repository.validate(&format!("repositories.{name}"))?;
        }

        if let Some(default) = &self.default_repository {
            if !self.repositories.is_empty() && !self.repositories.contains_key(default) {
                return Err(ConfigError::InvalidValue(format!(
                    "default_repository '{}' is not declared, must be one of: {}",
                    default,
                    self.repositories
                        .keys()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }

        Ok(())
    }
}

/// Backend selection plus free-form options handed to its factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    /// Registered backend name (e.g., "memory")
    pub backend: String,

    /// Backend-specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BackendSettings {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.backend.trim().is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "{section}: backend cannot be empty"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_settings() {
        let settings: Settings = toml::from_str(
            r#"
            sandbox_root = "/tmp/sb"
            default_repository = "main"

            [database]
            backend = "memory"
            options = { user = "alice" }

            [repositories.main]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(settings.sandbox_root, Some(PathBuf::from("/tmp/sb")));
        assert_eq!(
            settings.database.as_ref().and_then(|d| d.option("user")),
            Some("alice")
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn undeclared_default_repository_rejected() {
        let settings = Settings {
            default_repository: Some("nas".to_string()),
            repositories: BTreeMap::from([("main".to_string(), BackendSettings::new("memory"))]),
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("nas"));
    }

    #[test]
    fn empty_backend_rejected() {
        let settings = Settings {
            database: Some(BackendSettings::new(" ")),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
