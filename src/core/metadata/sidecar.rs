//! core::metadata::sidecar
//!
//! Local bookkeeping records kept next to the cache.
//!
//! # Records
//!
//! - [`WorkRecord`] - state of a checked-out work, stored in
//!   `<work>/.pulse/work.json`. It makes `checkout` and `status`
//!   idempotent across restarts.
//! - [`ProductUsersRecord`] - reference count of a product directory.
//! - [`WorkIndexRecord`] - where each work of a project is checked out,
//!   stored in `<sandbox>/<project>/.pulse/works.json`.
//!
//! All are written atomically (temp file + fsync + rename). Nothing
//! guards concurrent writers: the local cache is single-writer per
//! machine, and two processes mutating the same user set can lose an
//! update.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::schema::{MetadataError, SCHEMA_VERSION};
use crate::core::fsutil::{self, FsError};
use crate::core::types::{Alias, FileManifest, ProductType, UtcTimestamp};
use crate::core::uri::Uri;

pub const WORK_KIND: &str = "pulse.work";
pub const PRODUCT_USERS_KIND: &str = "pulse.product-users";
pub const WORK_INDEX_KIND: &str = "pulse.work-index";

/// Errors from sidecar files.
#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("invalid sidecar '{path}': {source}")]
    Invalid {
        path: PathBuf,
        source: MetadataError,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SidecarError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(fsutil::io_err(path)(e).into()),
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|e| SidecarError::Invalid {
            path: path.to_path_buf(),
            source: MetadataError::ParseError(e.to_string()),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SidecarError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| SidecarError::Invalid {
        path: path.to_path_buf(),
        source: MetadataError::SerializeError(e.to_string()),
    })?;
    fsutil::atomic_write(path, json.as_bytes())?;
    Ok(())
}

fn check_envelope(
    path: &Path,
    kind: &str,
    expected: &str,
    schema_version: u32,
) -> Result<(), SidecarError> {
    if kind != expected {
        return Err(SidecarError::Invalid {
            path: path.to_path_buf(),
            source: MetadataError::InvalidKind {
                found: kind.to_string(),
                expected: expected.to_string(),
            },
        });
    }
    if schema_version != SCHEMA_VERSION {
        return Err(SidecarError::Invalid {
            path: path.to_path_buf(),
            source: MetadataError::UnsupportedVersion(schema_version),
        });
    }
    Ok(())
}

/// One declared input of a work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InputEntry {
    /// URI as declared (may be mutable)
    pub uri: Uri,
    /// Version the URI resolved to when it was added
    pub resolved_version: u32,
    /// True when the input is served by a local work instead of a commit
    #[serde(default)]
    pub from_work: bool,
}

impl InputEntry {
    /// The resolved URI, pinned to the version actually consumed.
    pub fn pinned_uri(&self) -> Uri {
        self.uri.pinned(self.resolved_version)
    }
}

/// State of a checked-out work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkRecord {
    pub kind: String,
    pub schema_version: u32,
    /// Resource this work belongs to
    pub uri: Uri,
    /// Version the next commit will publish
    pub version: u32,
    pub inputs: BTreeMap<Alias, InputEntry>,
    /// File manifest at the last `write`
    pub files: FileManifest,
    /// Unpublished product directories
    pub products: BTreeSet<ProductType>,
    pub checked_out_at: UtcTimestamp,
}

impl WorkRecord {
    pub fn new(uri: &Uri, version: u32) -> Self {
        Self {
            kind: WORK_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            uri: uri.resource_uri(),
            version,
            inputs: BTreeMap::new(),
            files: FileManifest::new(),
            products: BTreeSet::new(),
            checked_out_at: UtcTimestamp::now(),
        }
    }

    /// Read the record at `path`; `Ok(None)` if there is none.
    pub fn load(path: &Path) -> Result<Option<Self>, SidecarError> {
        let record: Option<Self> = read_json(path)?;
        if let Some(record) = &record {
            check_envelope(path, &record.kind, WORK_KIND, record.schema_version)?;
        }
        Ok(record)
    }

    pub fn save(&self, path: &Path) -> Result<(), SidecarError> {
        write_json(path, self)
    }
}

/// Directories of a project's works, keyed by resource.
///
/// Entries can go stale when a work directory is removed by hand; readers
/// check the work record at the listed directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkIndexRecord {
    pub kind: String,
    pub schema_version: u32,
    pub works: BTreeMap<Uri, PathBuf>,
}

impl Default for WorkIndexRecord {
    fn default() -> Self {
        Self {
            kind: WORK_INDEX_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            works: BTreeMap::new(),
        }
    }
}

impl WorkIndexRecord {
    /// Read the index at `path`, or an empty one if absent.
    pub fn load(path: &Path) -> Result<Self, SidecarError> {
        match read_json::<Self>(path)? {
            Some(record) => {
                check_envelope(path, &record.kind, WORK_INDEX_KIND, record.schema_version)?;
                Ok(record)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SidecarError> {
        write_json(path, self)
    }
}

/// Reference count of one product directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProductUsersRecord {
    pub kind: String,
    pub schema_version: u32,
    /// Directories (works or products) consuming this product
    pub users: BTreeSet<PathBuf>,
    /// When the user set last became empty
    pub unused_since: Option<UtcTimestamp>,
    /// Pinned product URIs this product is registered as a user of
    #[serde(default)]
    pub inputs: BTreeSet<Uri>,
    /// The whole product is in the local cache
    #[serde(default)]
    pub complete: bool,
    /// Product subpaths downloaded on their own
    #[serde(default)]
    pub subpaths: BTreeSet<String>,
}

impl Default for ProductUsersRecord {
    fn default() -> Self {
        Self {
            kind: PRODUCT_USERS_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            users: BTreeSet::new(),
            unused_since: None,
            inputs: BTreeSet::new(),
            complete: false,
            subpaths: BTreeSet::new(),
        }
    }
}

impl ProductUsersRecord {
    /// Read the record at `path`, or an empty one if absent.
    pub fn load(path: &Path) -> Result<Self, SidecarError> {
        match read_json::<Self>(path)? {
            Some(record) => {
                check_envelope(path, &record.kind, PRODUCT_USERS_KIND, record.schema_version)?;
                Ok(record)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SidecarError> {
        write_json(path, self)
    }

    /// Returns true if the user was not present.
    pub fn add_user(&mut self, user: &Path) -> bool {
        let inserted = self.users.insert(user.to_path_buf());
        if inserted {
            self.unused_since = None;
        }
        inserted
    }

    /// Returns true if the user was present.
    pub fn remove_user(&mut self, user: &Path) -> bool {
        let removed = self.users.remove(user);
        if removed && self.users.is_empty() {
            self.unused_since = Some(UtcTimestamp::now());
        }
        removed
    }

    /// True if `subpath` (empty for the whole product) is already local.
    pub fn has_downloaded(&self, subpath: &str) -> bool {
        if self.complete {
            return true;
        }
        !subpath.is_empty()
            && self.subpaths.iter().any(|done| {
                subpath == done
                    || subpath
                        .strip_prefix(done.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    /// Remember that `subpath` (empty for the whole product) was downloaded.
    pub fn mark_downloaded(&mut self, subpath: &str) {
        if subpath.is_empty() {
            self.complete = true;
            self.subpaths.clear();
        } else if !self.complete {
            self.subpaths.insert(subpath.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn work_record_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".pulse/work.json");
        let uri = Uri::parse("anna-rig@3").unwrap();

        assert!(WorkRecord::load(&path).unwrap().is_none());

        let mut record = WorkRecord::new(&uri, 4);
        record.inputs.insert(
            Alias::new("geo").unwrap(),
            InputEntry {
                uri: Uri::parse("anna-model/geo").unwrap(),
                resolved_version: 2,
                from_work: false,
            },
        );
        record.save(&path).unwrap();

        let loaded = WorkRecord::load(&path).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.uri.to_string(), "anna-rig");
        assert_eq!(
            loaded.inputs.values().next().unwrap().pinned_uri().to_string(),
            "anna-model@2/geo"
        );
    }

    #[test]
    fn corrupt_work_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("work.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            WorkRecord::load(&path),
            Err(SidecarError::Invalid { .. })
        ));
    }

    #[test]
    fn users_track_unused_since() {
        let mut record = ProductUsersRecord::default();
        let user = Path::new("/sb/p/anna/rig");

        assert!(record.add_user(user));
        assert!(!record.add_user(user));
        assert!(record.unused_since.is_none());

        assert!(record.remove_user(user));
        assert!(!record.remove_user(user));
        assert!(record.unused_since.is_some());
    }

    #[test]
    fn missing_users_record_is_empty() {
        let temp = TempDir::new().unwrap();
        let record = ProductUsersRecord::load(&temp.path().join("nope.json")).unwrap();
        assert!(record.users.is_empty());
    }

    #[test]
    fn partial_downloads_do_not_count_as_whole() {
        let mut record = ProductUsersRecord::default();
        assert!(!record.has_downloaded(""));

        record.mark_downloaded("lod0");
        assert!(record.has_downloaded("lod0"));
        assert!(record.has_downloaded("lod0/mesh.obj"));
        assert!(!record.has_downloaded("lod0x"));
        assert!(!record.has_downloaded("lod1"));
        assert!(!record.has_downloaded(""));

        record.mark_downloaded("");
        assert!(record.complete);
        assert!(record.subpaths.is_empty());
        assert!(record.has_downloaded("lod1"));
    }
}
