//! error
//!
//! Errors surfaced by engine operations.
//!
//! Every failure is typed and carries a human-readable reason. Errors
//! from the ports and the local cache are folded into the taxonomy where
//! a taxonomy entry exists (a missing record is `NotFound` whichever port
//! reported it) and wrapped otherwise.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::config::ConfigError;
use crate::core::fsutil::FsError;
use crate::core::metadata::{MetadataError, SidecarError};
use crate::core::types::TypeError;
use crate::core::uri::UriError;
use crate::database::DatabaseError;
use crate::registry::RegistryError;
use crate::transport::TransportError;

/// Result type of engine operations.
pub type Result<T, E = PulseError> = std::result::Result<T, E>;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum PulseError {
    /// An entity, version or product does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An entity or product already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The work no longer targets the next version of its resource.
    #[error("work on {uri} targets version {work_version}, but the resource is at version {last_version}")]
    Stale {
        uri: String,
        work_version: u32,
        last_version: u32,
    },

    /// The resource lock is held by another user.
    #[error("{uri} is locked by {user}")]
    Locked { uri: String, user: String },

    /// A product still has users.
    #[error("{product} is in use by {} user(s)", users.len())]
    InUse {
        product: String,
        users: Vec<PathBuf>,
    },

    /// A download would overwrite a local uncommitted work.
    #[error("{uri} has a local work at version {version}; choose a conflict policy to proceed")]
    WorkConflict { uri: String, version: u32 },

    /// The work has no changes.
    #[error("nothing to commit in {0}")]
    NothingToCommit(String),

    /// An input of the work has no published commit.
    #[error("input '{alias}' ({uri}) is not published")]
    UnpublishedInput { alias: String, uri: String },

    /// A URI string could not be parsed.
    #[error(transparent)]
    MalformedUri(#[from] UriError),

    /// A directory is held open by another process.
    #[error("{} is in use by another process", path.display())]
    FilesystemBusy { path: PathBuf },

    /// The requested change would not change anything.
    #[error("{0}")]
    Conflict(String),

    /// A well-formed URI that cannot be used here.
    #[error("invalid uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// An input alias is already declared.
    #[error("input alias '{0}' is already declared")]
    DuplicateAlias(String),

    /// The work has uncommitted changes.
    #[error("{uri} has {changes} uncommitted change(s)")]
    DirtyWorkingTree { uri: String, changes: usize },

    /// A product type or alias is not a valid name.
    #[error(transparent)]
    InvalidName(#[from] TypeError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend error: {0}")]
    Registry(#[from] RegistryError),

    #[error("database error: {0}")]
    Database(DatabaseError),

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("invalid record: {0}")]
    Metadata(#[from] MetadataError),

    #[error("invalid local state: {0}")]
    Sidecar(SidecarError),

    #[error(transparent)]
    Fs(FsError),
}

impl From<DatabaseError> for PulseError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => PulseError::NotFound(what),
            DatabaseError::AlreadyExists(what) => PulseError::AlreadyExists(what),
            other => PulseError::Database(other),
        }
    }
}

impl From<TransportError> for PulseError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(what) => PulseError::NotFound(what),
            TransportError::Fs(fs) => fs.into(),
            other => PulseError::Transport(other),
        }
    }
}

impl From<FsError> for PulseError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::Busy { path } => PulseError::FilesystemBusy { path },
            other => PulseError::Fs(other),
        }
    }
}

impl From<SidecarError> for PulseError {
    fn from(err: SidecarError) -> Self {
        match err {
            SidecarError::Fs(fs) => fs.into(),
            other => PulseError::Sidecar(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_errors_map_into_taxonomy() {
        let err: PulseError = DatabaseError::NotFound("resource anna-rig".into()).into();
        assert!(matches!(err, PulseError::NotFound(_)));

        let err: PulseError = DatabaseError::AlreadyExists("project film".into()).into();
        assert!(matches!(err, PulseError::AlreadyExists(_)));

        let err: PulseError = DatabaseError::Backend("down".into()).into();
        assert!(matches!(err, PulseError::Database(_)));

        let err: PulseError = TransportError::NotFound("anna-rig@2".into()).into();
        assert!(matches!(err, PulseError::NotFound(_)));
    }

    #[test]
    fn busy_paths_become_filesystem_busy() {
        let busy = FsError::Busy {
            path: PathBuf::from("/sb/film/anna/rig"),
        };
        let err: PulseError = TransportError::Fs(busy).into();
        assert!(matches!(err, PulseError::FilesystemBusy { .. }));
    }

    #[test]
    fn messages_are_readable() {
        let err = PulseError::Stale {
            uri: "anna-rig".into(),
            work_version: 2,
            last_version: 2,
        };
        assert_eq!(
            err.to_string(),
            "work on anna-rig targets version 2, but the resource is at version 2"
        );

        let err = PulseError::InUse {
            product: "anna-model@2/geo".into(),
            users: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        assert_eq!(err.to_string(), "anna-model@2/geo is in use by 2 user(s)");
    }
}
