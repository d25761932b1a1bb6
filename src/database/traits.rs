//! database::traits
//!
//! Persistence port definition.
//!
//! # Design
//!
//! The `Database` trait is a record store keyed by
//! `(project, entity kind, uri)`. Records are JSON objects; typed records
//! live in [`crate::core::metadata`]. The port is synchronous and every
//! method takes `&self`, so implementations use interior mutability and
//! must be `Send + Sync`.
//!
//! # Consistency
//!
//! `update` is a plain merge, not a conditional write. Callers that read,
//! decide and then update (the resource lock does exactly that) can race
//! with another process doing the same.

use thiserror::Error;

use crate::core::metadata::EntityKind;

/// Errors from persistence operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    /// No record (or project) under the given key.
    #[error("{0} not found")]
    NotFound(String),

    /// A record (or project) already exists under the given key.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The record handed to the store is not a JSON object.
    #[error("invalid record for {uri}: {message}")]
    InvalidRecord { uri: String, message: String },

    /// The glob pattern could not be compiled.
    #[error("invalid pattern '{0}'")]
    InvalidPattern(String),

    /// The backend failed for another reason.
    #[error("database backend error: {0}")]
    Backend(String),
}

/// Persistence port.
///
/// # Keys
///
/// - `project`: project name
/// - `kind`: entity family
/// - `uri`: the entity's URI string (`anna-rig`, `anna-rig@3`), or the
///   project name for [`EntityKind::Config`]
pub trait Database: Send + Sync {
    /// Register a project namespace.
    ///
    /// Fails with `AlreadyExists` if the project is already registered.
    fn create_project(&self, name: &str) -> Result<(), DatabaseError>;

    /// URIs of `kind` in `project` matching a glob (`*` and `?`).
    ///
    /// Results are sorted.
    fn find_uris(
        &self,
        project: &str,
        kind: EntityKind,
        pattern: &str,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Store a new record. Fails with `AlreadyExists`.
    fn create(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
        fields: serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Merge `fields` into an existing record. Fails with `NotFound`.
    fn update(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
        fields: serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Read a full record. Fails with `NotFound`.
    fn read(
        &self,
        project: &str,
        kind: EntityKind,
        uri: &str,
    ) -> Result<serde_json::Value, DatabaseError>;

    /// Name of the connected user: default lock owner and commit author.
    fn get_user_name(&self) -> String;

    /// Check if a record exists.
    ///
    /// Default implementation uses `read()`.
    fn exists(&self, project: &str, kind: EntityKind, uri: &str) -> Result<bool, DatabaseError> {
        match self.read(project, kind, uri) {
            Ok(_) => Ok(true),
            Err(DatabaseError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<regex::Regex, DatabaseError> {
    let mut s = regex::escape(pattern);
    s = s.replace("\\*", ".*");
    s = s.replace("\\?", ".");
    regex::Regex::new(&format!("^{s}$")).map_err(|_| DatabaseError::InvalidPattern(pattern.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_whole_string() {
        let re = glob_to_regex("_template-*").unwrap();
        assert!(re.is_match("_template-rig"));
        assert!(!re.is_match("x_template-rig"));

        let re = glob_to_regex("anna-rig@?").unwrap();
        assert!(re.is_match("anna-rig@3"));
        assert!(!re.is_match("anna-rig@12"));
    }

    #[test]
    fn glob_escapes_regex_syntax() {
        let re = glob_to_regex("a.b-rig").unwrap();
        assert!(re.is_match("a.b-rig"));
        assert!(!re.is_match("axb-rig"));
    }

    #[test]
    fn error_display_formatting() {
        let err = DatabaseError::NotFound("resource anna-rig".into());
        assert_eq!(err.to_string(), "resource anna-rig not found");

        let err = DatabaseError::AlreadyExists("project film".into());
        assert!(err.to_string().contains("already exists"));
    }
}
