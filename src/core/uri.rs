//! core::uri
//!
//! Resource addressing scheme.
//!
//! # Grammar
//!
//! ```text
//! <entity>-<resource_type>[@<version>][/<subpath>]
//! ```
//!
//! - `entity` may contain `-` and uses `:` to separate hierarchy levels
//! - `resource_type` is the text after the last `-`
//! - `version` is either `last` (resolved later by the resource) or a
//!   decimal integer without leading zeros; absent means mutable
//! - `subpath` is one or more `/`-separated segments, the first of which
//!   names a product
//!
//! # Invariants
//!
//! Every value that parses formats back to the exact same string, so
//! `Uri::parse(&uri.to_string()) == Ok(uri)` holds for every `Uri`.
//!
//! # Example
//!
//! ```
//! use pulse::core::uri::{Uri, UriVersion};
//!
//! let uri = Uri::parse("chars:anna-rig@3/skeleton").unwrap();
//! assert_eq!(uri.entity(), "chars:anna");
//! assert_eq!(uri.resource_type(), "rig");
//! assert_eq!(uri.version(), Some(UriVersion::Number(3)));
//! assert_eq!(uri.product_type(), Some("skeleton"));
//! assert_eq!(uri.to_string(), "chars:anna-rig@3/skeleton");
//!
//! assert!(Uri::parse("anna-rig").unwrap().is_mutable());
//! assert!(Uri::parse("no_type").is_err());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal used for the deferred "latest" version marker.
pub const LAST_VERSION_MARKER: &str = "last";

/// Errors from URI parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("malformed uri '{uri}': {reason}")]
    Malformed { uri: String, reason: String },
}

impl UriError {
    fn malformed(uri: &str, reason: impl Into<String>) -> Self {
        UriError::Malformed {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}

/// The version component of a URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UriVersion {
    /// Deferred marker, resolved through `Resource::last_version`.
    Last,
    /// Pinned published version.
    Number(u32),
}

impl fmt::Display for UriVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriVersion::Last => f.write_str(LAST_VERSION_MARKER),
            UriVersion::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A parsed resource address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri {
    entity: String,
    resource_type: String,
    version: Option<UriVersion>,
    subpath: Option<String>,
}

impl Uri {
    /// Build a mutable URI for a resource.
    ///
    /// # Errors
    ///
    /// Returns `UriError::Malformed` if either component is invalid.
    pub fn new(entity: &str, resource_type: &str) -> Result<Self, UriError> {
        Self::parse(&format!("{entity}-{resource_type}"))
    }

    /// Parse a URI string.
    pub fn parse(s: &str) -> Result<Self, UriError> {
        if s.is_empty() {
            return Err(UriError::malformed(s, "uri cannot be empty"));
        }

        let (head, subpath) = match s.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (s, None),
        };

        let (name, version) = match head.split_once('@') {
            Some((name, version)) => (name, Some(parse_version(s, version)?)),
            None => (head, None),
        };

        let (entity, resource_type) = name
            .rsplit_once('-')
            .ok_or_else(|| UriError::malformed(s, "missing '-' between entity and resource type"))?;

        validate_entity(s, entity)?;
        validate_resource_type(s, resource_type)?;
        if let Some(subpath) = subpath {
            validate_subpath(s, subpath)?;
        }

        Ok(Self {
            entity: entity.to_string(),
            resource_type: resource_type.to_string(),
            version,
            subpath: subpath.map(str::to_string),
        })
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn version(&self) -> Option<UriVersion> {
        self.version
    }

    pub fn subpath(&self) -> Option<&str> {
        self.subpath.as_deref()
    }

    /// The product named by the first subpath segment, if any.
    pub fn product_type(&self) -> Option<&str> {
        self.subpath
            .as_deref()
            .and_then(|s| s.split('/').next())
    }

    /// The part of the subpath below the product directory.
    pub fn product_subpath(&self) -> &str {
        self.subpath
            .as_deref()
            .and_then(|s| s.split_once('/'))
            .map(|(_, rest)| rest)
            .unwrap_or("")
    }

    /// True unless the URI pins an explicit integer version.
    pub fn is_mutable(&self) -> bool {
        !matches!(self.version, Some(UriVersion::Number(_)))
    }

    /// The URI of the resource itself (no version, no subpath).
    pub fn resource_uri(&self) -> Uri {
        Uri {
            entity: self.entity.clone(),
            resource_type: self.resource_type.clone(),
            version: None,
            subpath: None,
        }
    }

    /// Copy of this URI with a different version component.
    pub fn with_version(&self, version: Option<UriVersion>) -> Uri {
        Uri {
            version,
            ..self.clone()
        }
    }

    /// Copy of this URI pinned to a published version.
    pub fn pinned(&self, version: u32) -> Uri {
        self.with_version(Some(UriVersion::Number(version)))
    }

    /// Copy of this URI with a different subpath.
    ///
    /// # Errors
    ///
    /// Returns `UriError::Malformed` if the subpath is invalid.
    pub fn with_subpath(&self, subpath: &str) -> Result<Uri, UriError> {
        let mut uri = self.clone();
        if subpath.is_empty() {
            uri.subpath = None;
        } else {
            validate_subpath(subpath, subpath)?;
            uri.subpath = Some(subpath.to_string());
        }
        Ok(uri)
    }

    /// Entity hierarchy levels, used to lay out directories.
    pub fn entity_levels(&self) -> impl Iterator<Item = &str> {
        self.entity.split(':')
    }
}

fn parse_version(uri: &str, version: &str) -> Result<UriVersion, UriError> {
    if version == LAST_VERSION_MARKER {
        return Ok(UriVersion::Last);
    }
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
        return Err(UriError::malformed(
            uri,
            format!("version must be '{LAST_VERSION_MARKER}' or an integer"),
        ));
    }
    if version.len() > 1 && version.starts_with('0') {
        return Err(UriError::malformed(uri, "version cannot have leading zeros"));
    }
    version
        .parse::<u32>()
        .map(UriVersion::Number)
        .map_err(|e| UriError::malformed(uri, format!("invalid version: {e}")))
}

fn validate_entity(uri: &str, entity: &str) -> Result<(), UriError> {
    if entity.is_empty() {
        return Err(UriError::malformed(uri, "entity cannot be empty"));
    }
    if let Some(c) = entity
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(UriError::malformed(uri, format!("entity cannot contain '{c}'")));
    }
    for level in entity.split(':') {
        if level.is_empty() || level.starts_with('.') {
            return Err(UriError::malformed(uri, "entity has an empty or hidden level"));
        }
    }
    Ok(())
}

fn validate_resource_type(uri: &str, resource_type: &str) -> Result<(), UriError> {
    if resource_type.is_empty() {
        return Err(UriError::malformed(uri, "resource type cannot be empty"));
    }
    if resource_type.starts_with('.') {
        return Err(UriError::malformed(uri, "resource type cannot start with '.'"));
    }
    if let Some(c) = resource_type
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.')))
    {
        return Err(UriError::malformed(
            uri,
            format!("resource type cannot contain '{c}'"),
        ));
    }
    Ok(())
}

fn validate_subpath(uri: &str, subpath: &str) -> Result<(), UriError> {
    for segment in subpath.split('/') {
        if segment.is_empty() {
            return Err(UriError::malformed(uri, "subpath has an empty segment"));
        }
        if segment == "." || segment == ".." {
            return Err(UriError::malformed(uri, "subpath cannot be relative"));
        }
        if segment.chars().any(|c| c.is_control() || c == '\\' || c == '@') {
            return Err(UriError::malformed(uri, "subpath has an invalid character"));
        }
    }
    Ok(())
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.entity, self.resource_type)?;
        if let Some(version) = self.version {
            write!(f, "@{version}")?;
        }
        if let Some(subpath) = &self.subpath {
            write!(f, "/{subpath}")?;
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s)
    }
}

impl TryFrom<String> for Uri {
    type Error = UriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Uri::parse(&value)
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.to_string()
    }
}
