//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`ProductType`] - Validated product directory name
//! - [`Alias`] - Validated input alias
//! - [`UtcTimestamp`] - RFC3339 timestamp
//! - [`Fingerprint`] - Content hash of a single file
//! - [`FileManifest`] - Relative path to fingerprint map of a directory
//! - [`ChangeKind`] / [`ChangePath`] - Entries of a work status report
//! - [`ConflictPolicy`] - Caller-chosen outcome when a download collides
//!   with a local work
//!
//! # Validation
//!
//! Names enforce validity at construction time so that a value which
//! exists can always be used as a single directory level.
//!
//! # Examples
//!
//! ```
//! use pulse::core::types::{Alias, Fingerprint, ProductType};
//!
//! let product = ProductType::new("skeleton").unwrap();
//! assert_eq!(product.as_str(), "skeleton");
//! assert!(ProductType::new("a/b").is_err());
//! assert!(Alias::new("").is_err());
//!
//! let fp = Fingerprint::of_bytes(b"hello");
//! assert_eq!(fp, Fingerprint::of_bytes(b"hello"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid product type: {0}")]
    InvalidProductType(String),

    #[error("invalid alias: {0}")]
    InvalidAlias(String),

    #[error("unknown conflict policy '{0}' (valid: error, mine, theirs)")]
    InvalidConflictPolicy(String),

    #[error("invalid project name: {0}")]
    InvalidProjectName(String),
}

/// Shared rule for names used as a single directory level.
fn validate_dir_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".into());
    }
    if name == "." || name == ".." {
        return Err(format!("'{name}' is reserved"));
    }
    if name.starts_with('.') {
        return Err("name cannot start with '.'".into());
    }
    for c in name.chars() {
        if c.is_control() || matches!(c, '/' | '\\' | '@' | ':') {
            return Err(format!("name cannot contain '{}'", c.escape_default()));
        }
    }
    Ok(())
}

/// Check that a project name can be used as a cache directory.
pub fn validate_project_name(name: &str) -> Result<(), TypeError> {
    validate_dir_name(name).map_err(|reason| TypeError::InvalidProjectName(format!("'{name}': {reason}")))
}

/// A validated product type, i.e. the name of a product directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductType(String);

impl ProductType {
    /// Create a new validated product type.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidProductType` if the name is empty, hidden,
    /// or contains a path separator.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        validate_dir_name(&name).map_err(TypeError::InvalidProductType)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProductType {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProductType> for String {
    fn from(value: ProductType) -> Self {
        value.0
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated input alias.
///
/// Aliases double as link names under `<work>/.pulse/inputs/`, so they follow
/// the same rules as product types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Alias(String);

impl Alias {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        validate_dir_name(&name).map_err(TypeError::InvalidAlias)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Alias {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Alias> for String {
    fn from(value: Alias) -> Self {
        value.0
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A UTC timestamp serialized as RFC3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(chrono::DateTime<chrono::Utc>);

impl UtcTimestamp {
    /// Create a timestamp for the current moment.
    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    /// Compact form usable as a directory name (`20240131T120000123`).
    pub fn to_dir_name(&self) -> String {
        self.0.format("%Y%m%dT%H%M%S%3f").to_string()
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// SHA-256 content hash of a file, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a file differs from the last written manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Edited,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "added",
            ChangeKind::Edited => "edited",
            ChangeKind::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Location of a changed file: the work directory or one of its
/// unpublished product directories.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangePath {
    Work(String),
    Product {
        product_type: ProductType,
        path: String,
    },
}

impl fmt::Display for ChangePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangePath::Work(path) => f.write_str(path),
            ChangePath::Product { product_type, path } => {
                write!(f, "[{product_type}] {path}")
            }
        }
    }
}

/// Result of `Work::status`.
pub type WorkStatus = BTreeMap<ChangePath, ChangeKind>;

/// Relative file path (always `/`-separated) to content fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileManifest(BTreeMap<String, Fingerprint>);

impl FileManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, fingerprint: Fingerprint) {
        self.0.insert(path.into(), fingerprint);
    }

    pub fn get(&self, path: &str) -> Option<&Fingerprint> {
        self.0.get(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Fingerprint)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Changes needed to go from `previous` to `self`.
    pub fn diff(&self, previous: &FileManifest) -> BTreeMap<String, ChangeKind> {
        let mut changes = BTreeMap::new();
        for (path, fingerprint) in &self.0 {
            match previous.0.get(path) {
                None => {
                    changes.insert(path.clone(), ChangeKind::Added);
                }
                Some(old) if old != fingerprint => {
                    changes.insert(path.clone(), ChangeKind::Edited);
                }
                Some(_) => {}
            }
        }
        for path in previous.0.keys() {
            if !self.0.contains_key(path) {
                changes.insert(path.clone(), ChangeKind::Removed);
            }
        }
        changes
    }
}

/// Outcome when a download would overwrite a local, uncommitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Abort with `WorkConflict` and leave the work untouched.
    #[default]
    Error,
    /// Keep the local work and use it instead of the download.
    Mine,
    /// Trash the local work (no backup) and download.
    Theirs,
}

impl FromStr for ConflictPolicy {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(ConflictPolicy::Error),
            "mine" => Ok(ConflictPolicy::Mine),
            "theirs" => Ok(ConflictPolicy::Theirs),
            other => Err(TypeError::InvalidConflictPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictPolicy::Error => "error",
            ConflictPolicy::Mine => "mine",
            ConflictPolicy::Theirs => "theirs",
        };
        f.write_str(s)
    }
}
