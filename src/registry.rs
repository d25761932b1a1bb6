//! registry
//!
//! Backend selection by name.
//!
//! # Design
//!
//! Backends are compiled in and looked up by the name found in the
//! settings (`backend = "memory"`). A registry is an explicit value
//! handed to [`Connection::open`]; there is no global table. Embedders add
//! their own implementations with [`BackendRegistry::register_database`]
//! and [`BackendRegistry::register_transport`].
//!
//! [`Connection::open`]: crate::project::Connection::open
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pulse::core::config::BackendSettings;
//! use pulse::database::MemoryDatabase;
//! use pulse::registry::BackendRegistry;
//!
//! let shared = MemoryDatabase::new("alice");
//! let mut registry = BackendRegistry::with_builtins();
//! registry.register_database("shared", move |_settings| Ok(Arc::new(shared.clone())));
//!
//! let db = registry.create_database(&BackendSettings::new("shared")).unwrap();
//! assert_eq!(db.get_user_name(), "alice");
//! assert!(registry.create_database(&BackendSettings::new("sql")).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::config::BackendSettings;
use crate::database::{Database, MemoryDatabase};
use crate::transport::{MemoryTransport, Transport};

/// Name of the built-in in-memory backends.
pub const MEMORY_BACKEND: &str = "memory";

/// Option naming the user of a memory database.
pub const USER_OPTION: &str = "user";

/// Errors from backend creation.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {kind} backend '{name}', available: {available}")]
    UnknownBackend {
        kind: &'static str,
        name: String,
        available: String,
    },

    #[error("failed to create {kind} backend '{name}': {message}")]
    Creation {
        kind: &'static str,
        name: String,
        message: String,
    },
}

/// Factory building a persistence backend from its settings.
pub type DatabaseFactory =
    Box<dyn Fn(&BackendSettings) -> Result<Arc<dyn Database>, RegistryError> + Send + Sync>;

/// Factory building a transport backend from its settings.
pub type TransportFactory =
    Box<dyn Fn(&BackendSettings) -> Result<Arc<dyn Transport>, RegistryError> + Send + Sync>;

/// Name to factory maps for both ports.
#[derive(Default)]
pub struct BackendRegistry {
    databases: BTreeMap<String, DatabaseFactory>,
    transports: BTreeMap<String, TransportFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in backends.
    ///
    /// - `memory` database: option `user` names the connected user
    ///   (defaults to `$USER`)
    /// - `memory` transport: a fresh empty store per creation
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_database(MEMORY_BACKEND, |settings| {
            let user = settings
                .option(USER_OPTION)
                .map(str::to_string)
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "unknown".to_string());
            Ok(Arc::new(MemoryDatabase::new(user)))
        });
        registry.register_transport(MEMORY_BACKEND, |_settings| Ok(Arc::new(MemoryTransport::new())));
        registry
    }

    /// Register (or replace) a persistence backend.
    pub fn register_database<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendSettings) -> Result<Arc<dyn Database>, RegistryError> + Send + Sync + 'static,
    {
        self.databases.insert(name.into(), Box::new(factory));
    }

    /// Register (or replace) a transport backend.
    pub fn register_transport<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendSettings) -> Result<Arc<dyn Transport>, RegistryError> + Send + Sync + 'static,
    {
        self.transports.insert(name.into(), Box::new(factory));
    }

    pub fn database_names(&self) -> Vec<&str> {
        self.databases.keys().map(String::as_str).collect()
    }

    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.keys().map(String::as_str).collect()
    }

    /// Build the persistence backend named by `settings.backend`.
    pub fn create_database(
        &self,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn Database>, RegistryError> {
        let factory = self.databases.get(&settings.backend).ok_or_else(|| {
            RegistryError::UnknownBackend {
                kind: "database",
                name: settings.backend.clone(),
                available: self.database_names().join(", "),
            }
        })?;
        factory(settings)
    }

    /// Build the transport backend named by `settings.backend`.
    pub fn create_transport(
        &self,
        settings: &BackendSettings,
    ) -> Result<Arc<dyn Transport>, RegistryError> {
        let factory = self.transports.get(&settings.backend).ok_or_else(|| {
            RegistryError::UnknownBackend {
                kind: "transport",
                name: settings.backend.clone(),
                available: self.transport_names().join(", "),
            }
        })?;
        factory(settings)
    }
}
