//! project::purge
//!
//! Eviction of cached commit products nobody uses.
//!
//! The product cache is laid out as
//! `<products_root>/<project>/<level>/.../@<type>/<V003>/<product>`. Purging
//! walks that tree, so products whose commit record is gone are still
//! found (and reported as skipped). Products of a local work are never
//! touched.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::product::{product_uri, ProductSite};
use super::Project;
use crate::core::fsutil::{self, FsError};
use crate::core::paths::{CachePaths, BOOKKEEPING_DIR};
use crate::core::types::ProductType;
use crate::core::uri::Uri;
use crate::database::glob_to_regex;
use crate::error::{PulseError, Result};

/// A cached product directory found on disk.
#[derive(Debug)]
struct CachedProduct {
    resource: Uri,
    version: u32,
    product_type: ProductType,
}

impl Project {
    /// Evict local commit products unused for at least `min_unused`.
    ///
    /// `resource_filter` is a glob over resource URIs. Removal cascades to
    /// inputs that become unused. With `dry_run` nothing is removed and the
    /// candidate directories are returned instead of the removed ones.
    pub fn purge_unused_user_products(
        &self,
        min_unused: Duration,
        resource_filter: Option<&str>,
        dry_run: bool,
    ) -> Result<Vec<PathBuf>> {
        let filter = resource_filter.map(glob_to_regex).transpose()?;
        let mut purged = Vec::new();

        for cached in self.cached_products()? {
            if let Some(filter) = &filter {
                if !filter.is_match(&cached.resource.to_string()) {
                    continue;
                }
            }
            let site = ProductSite::new(self, &cached.resource, cached.version, &cached.product_type);
            // Removed earlier in this pass by a cascade.
            if !site.exists() {
                continue;
            }
            if self.local_work_at(&cached.resource, cached.version)?.is_some() {
                continue;
            }
            match site.unused_time()? {
                Some(unused) if unused >= min_unused => {}
                _ => continue,
            }

            if dry_run {
                debug!(product = %site.directory.display(), "would purge");
                purged.push(site.directory);
                continue;
            }
            let uri = product_uri(&cached.resource, cached.version, &cached.product_type)?;
            let product = match self.get_commit_product(&uri) {
                Ok(product) => product,
                Err(PulseError::NotFound(what)) => {
                    warn!(product = %uri, missing = %what, "cached product has no commit, skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match product.remove_from_local_products(true) {
                Ok(removed) => purged.extend(removed),
                Err(PulseError::InUse { product, .. }) => {
                    debug!(product = %product, "product in use, kept");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            project = self.name(),
            count = purged.len(),
            dry_run,
            "purged unused products"
        );
        Ok(purged)
    }

    /// Every product directory in this project's cache, in path order.
    fn cached_products(&self) -> Result<Vec<CachedProduct>> {
        let root = self.paths().project_products();
        let mut found = Vec::new();
        if !root.is_dir() {
            return Ok(found);
        }
        let mut entries = WalkDir::new(&root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = entries.next() {
            let entry = entry.map_err(|e| FsError::Io {
                path: e.path().unwrap_or(&root).to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.file_name() == BOOKKEEPING_DIR {
                entries.skip_current_dir();
                continue;
            }
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| self.paths().parse_version_dir_name(name))
            else {
                continue;
            };
            let Some(resource) = entry
                .path()
                .parent()
                .and_then(|parent| CachePaths::resource_from_dir(&root, parent))
            else {
                continue;
            };
            entries.skip_current_dir();

            let products = std::fs::read_dir(entry.path())
                .map_err(fsutil::io_err(entry.path()))?;
            let mut types = Vec::new();
            for product in products {
                let product = product.map_err(fsutil::io_err(entry.path()))?;
                if !product.path().is_dir() {
                    continue;
                }
                if let Some(product_type) = product
                    .file_name()
                    .to_str()
                    .and_then(|name| ProductType::new(name).ok())
                {
                    types.push(product_type);
                }
            }
            types.sort();
            found.extend(types.into_iter().map(|product_type| CachedProduct {
                resource: resource.clone(),
                version,
                product_type,
            }));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ConflictPolicy;
    use crate::core::uri::UriVersion;
    use crate::project::test_support::{publish, TestEnv};

    #[test]
    fn purges_downloaded_unused_products() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);
        project
            .get_work(&Uri::parse("anna-model").unwrap())
            .unwrap()
            .trash(true)
            .unwrap();

        let geo = Uri::parse("anna-model@1/geo").unwrap();
        let product = project
            .get_commit_product(&geo)
            .unwrap()
            .download(ConflictPolicy::Error, "")
            .unwrap();
        let directory = product.directory().to_path_buf();
        assert!(directory.is_dir());

        let candidates = project
            .purge_unused_user_products(Duration::ZERO, None, true)
            .unwrap();
        assert_eq!(candidates, vec![directory.clone()]);
        assert!(directory.is_dir());

        let purged = project
            .purge_unused_user_products(Duration::ZERO, None, false)
            .unwrap();
        assert_eq!(purged, vec![directory.clone()]);
        assert!(!directory.exists());
    }

    #[test]
    fn keeps_recent_filtered_and_used_products() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);
        publish(&project, "bob-model", &["geo"]);

        let rig = project.create_resource("anna", "rig", None).unwrap();
        let mut work = rig
            .checkout(UriVersion::Last, None, ConflictPolicy::Error)
            .unwrap();
        work.add_input(
            &Uri::parse("anna-model@1/geo").unwrap(),
            None,
            crate::project::ResolveOptions::default(),
        )
        .unwrap();

        // Too recent.
        let purged = project
            .purge_unused_user_products(Duration::from_secs(3600), None, false)
            .unwrap();
        assert!(purged.is_empty());

        // anna's geo has a user; bob's is filtered out.
        let purged = project
            .purge_unused_user_products(Duration::ZERO, Some("anna-*"), false)
            .unwrap();
        assert!(purged.is_empty());
        let bob = project.paths().product_dir(
            &Uri::parse("bob-model").unwrap(),
            1,
            &ProductType::new("geo").unwrap(),
        );
        assert!(bob.is_dir());
    }

    #[test]
    fn never_purges_local_work_products() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);

        // The work now targets v2 with a fresh, unused geo directory.
        let purged = project
            .purge_unused_user_products(Duration::ZERO, None, false)
            .unwrap();
        let work_geo = project.paths().product_dir(
            &Uri::parse("anna-model").unwrap(),
            2,
            &ProductType::new("geo").unwrap(),
        );
        assert!(work_geo.is_dir());
        assert!(!purged.contains(&work_geo));
    }
}
