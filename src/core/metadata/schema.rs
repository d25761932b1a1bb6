//! core::metadata::schema
//!
//! Persisted entity records (v1).
//!
//! # Schema Design
//!
//! Records are:
//! - Self-describing with `kind` and `schema_version`
//! - Explicit: every persisted field is named here, nothing is derived
//!   from in-memory state by reflection
//! - Strictly parsed (unknown fields rejected)
//!
//! Records cross the persistence port as JSON objects. Partial updates
//! are plain objects holding a subset of a record's fields.
//!
//! # Example
//!
//! ```
//! use pulse::core::metadata::schema::{Record, ResourceRecord};
//! use pulse::core::uri::Uri;
//!
//! let uri = Uri::parse("anna-rig").unwrap();
//! let record = ResourceRecord::new(&uri, "main", None);
//! assert_eq!(record.last_version, 0);
//!
//! let value = record.to_value().unwrap();
//! let parsed = ResourceRecord::from_value(value).unwrap();
//! assert_eq!(parsed, record);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{Alias, FileManifest, ProductType, UtcTimestamp};
use crate::core::uri::Uri;

/// Current schema version of every record.
pub const SCHEMA_VERSION: u32 = 1;

pub const PROJECT_KIND: &str = "pulse.project";
pub const RESOURCE_KIND: &str = "pulse.resource";
pub const COMMIT_KIND: &str = "pulse.commit";

/// Errors from record (de)serialization.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to parse record: {0}")]
    ParseError(String),

    #[error("failed to serialize record: {0}")]
    SerializeError(String),

    #[error("invalid kind '{found}', expected '{expected}'")]
    InvalidKind { found: String, expected: String },

    #[error("unsupported schema version {0}, supported: {SCHEMA_VERSION}")]
    UnsupportedVersion(u32),
}

/// Entity families stored through the persistence port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Config,
    Resource,
    Commit,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Config => "config",
            EntityKind::Resource => "resource",
            EntityKind::Commit => "commit",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for version dispatch before full parsing.
#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    kind: String,
    schema_version: u32,
}

/// A record persisted through the database port.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const ENTITY: EntityKind;

    /// Serialize to the JSON object handed to the port.
    fn to_value(&self) -> Result<serde_json::Value, MetadataError> {
        serde_json::to_value(self).map_err(|e| MetadataError::SerializeError(e.to_string()))
    }

    /// Parse a JSON object read from the port, checking kind and version.
    fn from_value(value: serde_json::Value) -> Result<Self, MetadataError> {
        let envelope: RecordEnvelope = serde_json::from_value(value.clone())
            .map_err(|e| MetadataError::ParseError(e.to_string()))?;

        if envelope.kind != Self::KIND {
            return Err(MetadataError::InvalidKind {
                found: envelope.kind,
                expected: Self::KIND.to_string(),
            });
        }

        match envelope.schema_version {
            SCHEMA_VERSION => serde_json::from_value(value)
                .map_err(|e| MetadataError::ParseError(e.to_string())),
            v => Err(MetadataError::UnsupportedVersion(v)),
        }
    }
}

/// Per-project configuration persisted alongside the entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectRecord {
    pub kind: String,
    pub schema_version: u32,
    pub name: String,
    /// Repository assigned to new resources
    pub default_repository: String,
    /// Prefix of version directory names
    pub version_prefix: String,
    /// Zero padding of version directory names
    pub version_padding: usize,
    pub created_at: UtcTimestamp,
}

impl ProjectRecord {
    pub fn new(name: &str, default_repository: &str) -> Self {
        Self {
            kind: PROJECT_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            name: name.to_string(),
            default_repository: default_repository.to_string(),
            version_prefix: "V".to_string(),
            version_padding: 3,
            created_at: UtcTimestamp::now(),
        }
    }
}

impl Record for ProjectRecord {
    const KIND: &'static str = PROJECT_KIND;
    const ENTITY: EntityKind = EntityKind::Config;
}

/// Identity and versioning state of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceRecord {
    pub kind: String,
    pub schema_version: u32,
    pub entity: String,
    pub resource_type: String,
    pub lock_state: bool,
    pub lock_user: Option<String>,
    /// Last published version, 0 while unpublished
    pub last_version: u32,
    /// Name of the transport backend holding the commits
    pub repository: String,
    /// Resource the first checkout is seeded from
    pub resource_template: Option<Uri>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ResourceRecord {
    pub fn new(uri: &Uri, repository: &str, resource_template: Option<Uri>) -> Self {
        Self {
            kind: RESOURCE_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            entity: uri.entity().to_string(),
            resource_type: uri.resource_type().to_string(),
            lock_state: false,
            lock_user: None,
            last_version: 0,
            repository: repository.to_string(),
            resource_template,
            metadata: BTreeMap::new(),
        }
    }
}

impl Record for ResourceRecord {
    const KIND: &'static str = RESOURCE_KIND;
    const ENTITY: EntityKind = EntityKind::Resource;
}

/// An immutable published version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommitRecord {
    pub kind: String,
    pub schema_version: u32,
    pub entity: String,
    pub resource_type: String,
    pub version: u32,
    pub comment: String,
    pub author: String,
    pub created_at: UtcTimestamp,
    /// Published work files
    pub files: FileManifest,
    /// Published product directories
    pub products: Vec<ProductType>,
    /// Pinned dependencies of the products, by alias
    pub products_inputs: BTreeMap<Alias, Uri>,
}

impl Record for CommitRecord {
    const KIND: &'static str = COMMIT_KIND;
    const ENTITY: EntityKind = EntityKind::Commit;
}
