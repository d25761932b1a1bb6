//! project::commit
//!
//! Immutable published versions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::product::{CommitProduct, ProductSite};
use super::Project;
use crate::core::metadata::CommitRecord;
use crate::core::types::{Alias, ConflictPolicy, FileManifest, ProductType, UtcTimestamp};
use crate::core::uri::Uri;
use crate::error::{PulseError, Result};
use crate::transport::CommitKey;

/// A published version of a resource.
#[derive(Debug, Clone)]
pub struct Commit<'p> {
    project: &'p Project,
    resource: Uri,
    repository: String,
    record: CommitRecord,
}

impl<'p> Commit<'p> {
    /// Read the commit `version` of `resource`, stored in `repository`.
    pub(crate) fn load(
        project: &'p Project,
        resource: &Uri,
        version: u32,
        repository: &str,
    ) -> Result<Self> {
        let uri = resource.resource_uri().pinned(version);
        let record: CommitRecord = project.read_record(&uri.to_string())?;
        Ok(Self::from_record(project, resource, repository, record))
    }

    pub(crate) fn from_record(
        project: &'p Project,
        resource: &Uri,
        repository: &str,
        record: CommitRecord,
    ) -> Self {
        Self {
            project,
            resource: resource.resource_uri(),
            repository: repository.to_string(),
            record,
        }
    }

    /// `<entity>-<type>@<version>`
    pub fn uri(&self) -> Uri {
        self.resource.pinned(self.record.version)
    }

    pub fn resource_uri(&self) -> &Uri {
        &self.resource
    }

    pub fn version(&self) -> u32 {
        self.record.version
    }

    pub fn comment(&self) -> &str {
        &self.record.comment
    }

    pub fn author(&self) -> &str {
        &self.record.author
    }

    pub fn created_at(&self) -> UtcTimestamp {
        self.record.created_at
    }

    pub fn files(&self) -> &FileManifest {
        &self.record.files
    }

    pub fn product_types(&self) -> &[ProductType] {
        &self.record.products
    }

    /// Pinned dependencies of the products, by alias.
    pub fn products_inputs(&self) -> &BTreeMap<Alias, Uri> {
        &self.record.products_inputs
    }

    pub fn record(&self) -> &CommitRecord {
        &self.record
    }

    pub fn get_product(&self, product_type: &ProductType) -> Result<CommitProduct<'p>> {
        if !self.record.products.contains(product_type) {
            return Err(PulseError::NotFound(format!(
                "product {} of {}",
                product_type,
                self.uri()
            )));
        }
        let site = ProductSite::new(self.project, &self.resource, self.record.version, product_type);
        Ok(CommitProduct::new(
            self.project,
            site,
            self.repository.clone(),
            self.record.products_inputs.clone(),
        ))
    }

    pub fn products(&self) -> Vec<CommitProduct<'p>> {
        self.record
            .products
            .iter()
            .map(|t| {
                let site = ProductSite::new(self.project, &self.resource, self.record.version, t);
                CommitProduct::new(
                    self.project,
                    site,
                    self.repository.clone(),
                    self.record.products_inputs.clone(),
                )
            })
            .collect()
    }

    /// Bring products of this commit into the local cache.
    ///
    /// An empty `subpath` downloads every product and returns the version
    /// directory. Otherwise its first segment names the product and the
    /// rest a path inside it; the returned path points there.
    pub fn download(&self, policy: ConflictPolicy, subpath: &str) -> Result<PathBuf> {
        if subpath.is_empty() {
            for product in self.products() {
                product.download(policy, "")?;
            }
            return Ok(self
                .project
                .paths()
                .version_products_dir(&self.resource, self.record.version));
        }
        let (product_type, rest) = subpath.split_once('/').unwrap_or((subpath, ""));
        let product_type = ProductType::new(product_type)?;
        let product = self.get_product(&product_type)?.download(policy, rest)?;
        if rest.is_empty() {
            Ok(product.directory().to_path_buf())
        } else {
            Ok(product.directory().join(rest))
        }
    }

    /// Write the published work files into `destination`.
    pub(crate) fn download_work(&self, destination: &Path) -> Result<()> {
        let key = CommitKey::new(&self.resource, self.record.version);
        debug!(commit = %key, destination = %destination.display(), "downloading work files");
        self.project
            .transport(&self.repository)?
            .download_work(&key, destination)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::uri::UriVersion;
    use crate::project::test_support::{publish, TestEnv};

    fn geo() -> ProductType {
        ProductType::new("geo").unwrap()
    }

    #[test]
    fn download_all_products_into_version_dir() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo", "cache"]);
        project
            .get_work(&Uri::parse("anna-model").unwrap())
            .unwrap()
            .trash(true)
            .unwrap();
        let resource = project.get_resource("anna", "model").unwrap();
        let commit = resource.get_commit(UriVersion::Last).unwrap();
        for product in commit.products() {
            product.remove_from_local_products(false).unwrap();
        }

        let dir = commit.download(ConflictPolicy::Error, "").unwrap();
        assert_eq!(dir, project.paths().version_products_dir(resource.uri(), 1));
        assert!(dir.join("geo/data.bin").is_file());
        assert!(dir.join("cache/data.bin").is_file());

        let file = commit.download(ConflictPolicy::Error, "geo/data.bin").unwrap();
        assert_eq!(file, dir.join("geo/data.bin"));
    }

    #[test]
    fn unknown_product_is_not_found() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);
        let commit = project
            .get_resource("anna", "model")
            .unwrap()
            .get_commit(UriVersion::Number(1))
            .unwrap();
        assert_eq!(commit.uri().to_string(), "anna-model@1");
        assert!(commit.get_product(&geo()).is_ok());
        assert!(matches!(
            commit.get_product(&ProductType::new("cache").unwrap()),
            Err(PulseError::NotFound(_))
        ));
        assert!(matches!(
            commit.download(ConflictPolicy::Error, "cache"),
            Err(PulseError::NotFound(_))
        ));
    }
}
