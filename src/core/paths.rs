//! core::paths
//!
//! Centralized path routing for the local cache.
//!
//! # Architecture
//!
//! Every location the engine writes to is computed here. No other module
//! joins cache-relative paths by hand.
//!
//! # Storage Layout
//!
//! Work directories live under the sandbox root, products under the
//! products root. Bookkeeping sits in `.pulse/` directories that are
//! never part of a manifest or an upload:
//!
//! ```text
//! <sandbox_root>/<project>/<entity levels>/@<type>/          work directory
//! <sandbox_root>/<project>/<entity levels>/@<type>/.pulse/work.json
//! <sandbox_root>/<project>/<entity levels>/@<type>/.pulse/inputs/<alias>
//! <sandbox_root>/<project>/.pulse/works.json                 work index
//! <sandbox_root>/<project>/.pulse/trash/<entity>-<type>/<timestamp>/
//! <products_root>/<project>/<entity levels>/@<type>/V003/<product_type>/
//! <products_root>/<project>/.pulse/users/<entity levels>/@<type>/V003/<product_type>.json
//! ```
//!
//! Entity levels never contain `@`, so the resource type directory is a
//! leaf of the entity hierarchy: `chars-anna` (`chars/@anna`) and
//! `chars:anna-rig` (`chars/anna/@rig`) never nest.
//!
//! # Example
//!
//! ```
//! use pulse::core::paths::CachePaths;
//! use pulse::core::uri::Uri;
//! use std::path::PathBuf;
//!
//! let paths = CachePaths::new("/sandbox", "/products", "film", "V", 3);
//! let uri = Uri::parse("chars:anna-rig").unwrap();
//!
//! assert_eq!(paths.work_dir(&uri), PathBuf::from("/sandbox/film/chars/anna/@rig"));
//! assert_eq!(
//!     paths.version_products_dir(&uri, 2),
//!     PathBuf::from("/products/film/chars/anna/@rig/V002")
//! );
//! ```

use std::path::{Path, PathBuf};

use super::types::{ProductType, UtcTimestamp};
use super::uri::Uri;

/// Name of bookkeeping directories, excluded from manifests and uploads.
pub const BOOKKEEPING_DIR: &str = ".pulse";

/// Directory holding convenience links to input products, inside a
/// work's bookkeeping directory.
pub const INPUT_LINKS_DIR: &str = "inputs";

/// Prefix of the directory level naming a resource type.
pub const RESOURCE_TYPE_PREFIX: char = '@';

/// Work sidecar file name inside the bookkeeping directory.
pub const WORK_RECORD_FILE: &str = "work.json";

/// Path routing for one project's local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    sandbox_root: PathBuf,
    products_root: PathBuf,
    project: String,
    version_prefix: String,
    version_padding: usize,
}

impl CachePaths {
    pub fn new(
        sandbox_root: impl Into<PathBuf>,
        products_root: impl Into<PathBuf>,
        project: impl Into<String>,
        version_prefix: impl Into<String>,
        version_padding: usize,
    ) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
            products_root: products_root.into(),
            project: project.into(),
            version_prefix: version_prefix.into(),
            version_padding,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    // =========================================================================
    // Work directories
    // =========================================================================

    /// Root of every work directory of this project.
    pub fn project_sandbox(&self) -> PathBuf {
        self.sandbox_root.join(&self.project)
    }

    fn resource_rel(uri: &Uri) -> PathBuf {
        let mut rel = PathBuf::new();
        for level in uri.entity_levels() {
            rel.push(level);
        }
        rel.push(format!("{}{}", RESOURCE_TYPE_PREFIX, uri.resource_type()));
        rel
    }

    /// Resource URI of a work or products directory `dir` under `root`.
    ///
    /// Inverse of the layout used by [`work_dir`](Self::work_dir) and
    /// [`resource_products_dir`](Self::resource_products_dir).
    pub fn resource_from_dir(root: &Path, dir: &Path) -> Option<Uri> {
        let rel = dir.strip_prefix(root).ok()?;
        let mut parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        let resource_type = parts.pop()?.strip_prefix(RESOURCE_TYPE_PREFIX)?;
        if parts.is_empty() {
            return None;
        }
        Uri::new(&parts.join(":"), resource_type).ok()
    }

    /// Default work directory of a resource.
    pub fn work_dir(&self, uri: &Uri) -> PathBuf {
        self.project_sandbox().join(Self::resource_rel(uri))
    }

    /// Sidecar record of the work checked out in `work_dir`.
    pub fn work_record_path(work_dir: &Path) -> PathBuf {
        work_dir.join(BOOKKEEPING_DIR).join(WORK_RECORD_FILE)
    }

    /// Directory of convenience links to input products.
    pub fn input_links_dir(work_dir: &Path) -> PathBuf {
        work_dir.join(BOOKKEEPING_DIR).join(INPUT_LINKS_DIR)
    }

    /// Index of every work checked out for this project.
    pub fn work_index_path(&self) -> PathBuf {
        self.project_sandbox()
            .join(BOOKKEEPING_DIR)
            .join("works.json")
    }

    /// Timestamped trash location for one resource.
    pub fn trash_dir(&self, uri: &Uri, at: &UtcTimestamp) -> PathBuf {
        self.project_sandbox()
            .join(BOOKKEEPING_DIR)
            .join("trash")
            .join(uri.resource_uri().to_string().replace(':', "_"))
            .join(at.to_dir_name())
    }

    /// Scratch directory used while migrating between repositories.
    pub fn migration_dir(&self, id: &str) -> PathBuf {
        self.project_sandbox()
            .join(BOOKKEEPING_DIR)
            .join("migrate")
            .join(id)
    }

    // =========================================================================
    // Products
    // =========================================================================

    /// Root of every product directory of this project.
    pub fn project_products(&self) -> PathBuf {
        self.products_root.join(&self.project)
    }

    /// Directory name of a version (`V003`).
    pub fn version_dir_name(&self, version: u32) -> String {
        format!(
            "{}{:0width$}",
            self.version_prefix,
            version,
            width = self.version_padding
        )
    }

    /// Parse a version directory name back into its number.
    pub fn parse_version_dir_name(&self, name: &str) -> Option<u32> {
        name.strip_prefix(self.version_prefix.as_str())
            .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok())
    }

    /// Every version directory of a resource lives here.
    pub fn resource_products_dir(&self, uri: &Uri) -> PathBuf {
        self.project_products().join(Self::resource_rel(uri))
    }

    pub fn version_products_dir(&self, uri: &Uri, version: u32) -> PathBuf {
        self.resource_products_dir(uri)
            .join(self.version_dir_name(version))
    }

    pub fn product_dir(&self, uri: &Uri, version: u32, product_type: &ProductType) -> PathBuf {
        self.version_products_dir(uri, version)
            .join(product_type.as_str())
    }

    /// Reference-count sidecar of a product directory.
    pub fn product_users_path(
        &self,
        uri: &Uri,
        version: u32,
        product_type: &ProductType,
    ) -> PathBuf {
        self.project_products()
            .join(BOOKKEEPING_DIR)
            .join("users")
            .join(Self::resource_rel(uri))
            .join(self.version_dir_name(version))
            .join(format!("{}.json", product_type.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> CachePaths {
        CachePaths::new("/sb", "/pr", "proj", "V", 3)
    }

    #[test]
    fn work_paths() {
        let uri = Uri::parse("anna-rig@4/skeleton").unwrap();
        let work = paths().work_dir(&uri);
        assert_eq!(work, PathBuf::from("/sb/proj/anna/@rig"));
        assert_eq!(
            CachePaths::work_record_path(&work),
            PathBuf::from("/sb/proj/anna/@rig/.pulse/work.json")
        );
        assert_eq!(
            CachePaths::input_links_dir(&work),
            PathBuf::from("/sb/proj/anna/@rig/.pulse/inputs")
        );
    }

    #[test]
    fn product_paths() {
        let uri = Uri::parse("seq:sh010-anim").unwrap();
        let geo = ProductType::new("geo").unwrap();
        assert_eq!(
            paths().product_dir(&uri, 12, &geo),
            PathBuf::from("/pr/proj/seq/sh010/@anim/V012/geo")
        );
        assert_eq!(
            paths().product_users_path(&uri, 12, &geo),
            PathBuf::from("/pr/proj/.pulse/users/seq/sh010/@anim/V012/geo.json")
        );
    }

    #[test]
    fn version_dir_names_round_trip() {
        let p = paths();
        assert_eq!(p.version_dir_name(7), "V007");
        assert_eq!(p.version_dir_name(1234), "V1234");
        assert_eq!(p.parse_version_dir_name("V007"), Some(7));
        assert_eq!(p.parse_version_dir_name("V"), None);
        assert_eq!(p.parse_version_dir_name("geo"), None);
    }

    #[test]
    fn nested_entities_do_not_nest_directories() {
        let outer = paths().work_dir(&Uri::parse("chars-anna").unwrap());
        let inner = paths().work_dir(&Uri::parse("chars:anna-rig").unwrap());
        assert_eq!(outer, PathBuf::from("/sb/proj/chars/@anna"));
        assert_eq!(inner, PathBuf::from("/sb/proj/chars/anna/@rig"));
        assert!(!inner.starts_with(&outer));

        let v1 = paths().version_products_dir(&Uri::parse("anna-model").unwrap(), 1);
        let other = paths().resource_products_dir(&Uri::parse("anna:model-V001").unwrap());
        assert_ne!(v1, other);
        assert!(!other.starts_with(&v1));
    }

    #[test]
    fn resource_from_dir_inverts_layout() {
        let root = Path::new("/sb/proj");
        for s in ["chars:anna-rig", "my-character-rig", "a:b-c:e-f"] {
            let uri = Uri::parse(s).unwrap();
            let dir = paths().work_dir(&uri);
            assert_eq!(CachePaths::resource_from_dir(root, &dir), Some(uri));
        }
        assert!(CachePaths::resource_from_dir(root, &root.join("chars/anna")).is_none());
        assert!(CachePaths::resource_from_dir(root, &root.join("@model")).is_none());
    }

    #[test]
    fn trash_dir_is_per_resource() {
        let uri = Uri::parse("chars:anna-rig@2").unwrap();
        let at = UtcTimestamp::now();
        let trash = paths().trash_dir(&uri, &at);
        assert!(trash.starts_with("/sb/proj/.pulse/trash/chars_anna-rig"));
    }
}
