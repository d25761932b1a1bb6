//! transport::traits
//!
//! Transport port definition.
//!
//! # Design
//!
//! A transport ("repository") durably stores the file content of commits.
//! Content is addressed by commit coordinates; records about that content
//! live in the database, not here. Like the database port, the trait is
//! synchronous, takes `&self` and requires `Send + Sync`.
//!
//! # Resource archives
//!
//! `download_resource` and `upload_resource` move the full history of a
//! resource through a local directory with this layout:
//!
//! ```text
//! <dir>/<version>/work/<files>
//! <dir>/<version>/products/<product_type>/<files>
//! ```
//!
//! Only repository migration uses them, so the layout is shared by every
//! transport rather than owned by the cache.

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::core::fsutil::FsError;
use crate::core::types::ProductType;
use crate::core::uri::Uri;

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nothing stored under the given key.
    #[error("{0} not found in repository")]
    NotFound(String),

    /// A local path could not be read or written.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The backend failed for another reason.
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Coordinates of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub entity: String,
    pub resource_type: String,
}

impl ResourceKey {
    pub fn from_uri(uri: &Uri) -> Self {
        Self {
            entity: uri.entity().to_string(),
            resource_type: uri.resource_type().to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.entity, self.resource_type)
    }
}

/// Coordinates of one published version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitKey {
    pub resource: ResourceKey,
    pub version: u32,
}

impl CommitKey {
    pub fn new(uri: &Uri, version: u32) -> Self {
        Self {
            resource: ResourceKey::from_uri(uri),
            version,
        }
    }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.version)
    }
}

/// Coordinates of one product of a published version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductKey {
    pub commit: CommitKey,
    pub product_type: ProductType,
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit, self.product_type)
    }
}

/// Transport port.
pub trait Transport: Send + Sync {
    /// Store the content of a new commit.
    ///
    /// `files` are `/`-separated paths relative to `work_dir`. Every
    /// subdirectory of `products_dir` is stored as one product, including
    /// empty ones.
    fn upload_resource_commit(
        &self,
        commit: &CommitKey,
        work_dir: &Path,
        files: &[String],
        products_dir: Option<&Path>,
    ) -> Result<(), TransportError>;

    /// Write the work files of a commit into `destination`.
    fn download_work(&self, commit: &CommitKey, destination: &Path) -> Result<(), TransportError>;

    /// Write a product into `destination`.
    ///
    /// With an empty `subpath` the whole product is written; otherwise only
    /// the file or directory at `subpath` is, at the same relative place.
    fn download_product(
        &self,
        product: &ProductKey,
        subpath: &str,
        destination: &Path,
    ) -> Result<(), TransportError>;

    /// Write every stored version of a resource into `destination` as an
    /// archive.
    fn download_resource(
        &self,
        resource: &ResourceKey,
        destination: &Path,
    ) -> Result<(), TransportError>;

    /// Store every version found in an archive directory.
    fn upload_resource(&self, resource: &ResourceKey, source: &Path) -> Result<(), TransportError>;

    /// Drop every stored version of a resource.
    fn remove_resource(&self, resource: &ResourceKey) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_render_like_uris() {
        let uri = Uri::parse("chars:anna-rig@3/skeleton").unwrap();
        let commit = CommitKey::new(&uri, 3);
        assert_eq!(commit.resource.to_string(), "chars:anna-rig");
        assert_eq!(commit.to_string(), "chars:anna-rig@3");

        let product = ProductKey {
            commit,
            product_type: ProductType::new("skeleton").unwrap(),
        };
        assert_eq!(product.to_string(), "chars:anna-rig@3/skeleton");
    }
}
