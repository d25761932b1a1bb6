//! project::product
//!
//! Named output directories and their reference counts.
//!
//! # Variants
//!
//! - [`CommitProduct`] belongs to a published commit. It can be downloaded
//!   into the local cache and evicted from it again.
//! - [`WorkProduct`] belongs to a live work. It only exists locally.
//!
//! Both sit at the same place in the cache
//! (`<products>/<project>/<levels>/@<type>/V003/<product>`), so a work
//! product turns into a commit product on commit without moving.
//!
//! # Reference counting
//!
//! Each product has a users sidecar listing the directories that consume
//! it, and the input products it consumes itself. A product is evictable
//! only when its user set is empty. The sidecar is not guarded against
//! concurrent local writers.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::resolve;
use super::{Project, Work};
use crate::core::fsutil;
use crate::core::metadata::ProductUsersRecord;
use crate::core::types::{Alias, ConflictPolicy, ProductType, UtcTimestamp};
use crate::core::uri::{Uri, UriVersion};
use crate::error::{PulseError, Result};
use crate::transport::{CommitKey, ProductKey};

/// Pinned URI naming one product of one version (`anna-model@2/geo`).
pub fn product_uri(resource: &Uri, version: u32, product_type: &ProductType) -> Result<Uri> {
    Ok(resource
        .resource_uri()
        .pinned(version)
        .with_subpath(product_type.as_str())?)
}

/// Where a product lives in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProductSite {
    pub(crate) resource: Uri,
    pub(crate) version: u32,
    pub(crate) product_type: ProductType,
    pub(crate) directory: PathBuf,
    pub(crate) users_path: PathBuf,
}

impl ProductSite {
    pub(crate) fn new(
        project: &Project,
        resource: &Uri,
        version: u32,
        product_type: &ProductType,
    ) -> Self {
        let resource = resource.resource_uri();
        let paths = project.paths();
        Self {
            directory: paths.product_dir(&resource, version, product_type),
            users_path: paths.product_users_path(&resource, version, product_type),
            resource,
            version,
            product_type: product_type.clone(),
        }
    }

    /// Site of the product named by a pinned product URI.
    pub(crate) fn from_pinned(project: &Project, uri: &Uri) -> Result<Self> {
        let (Some(UriVersion::Number(version)), Some(product_type)) =
            (uri.version(), uri.product_type())
        else {
            return Err(PulseError::InvalidUri {
                uri: uri.to_string(),
                reason: "expected a pinned product uri".to_string(),
            });
        };
        let product_type = ProductType::new(product_type)?;
        Ok(Self::new(project, uri, version, &product_type))
    }

    pub(crate) fn uri(&self) -> Result<Uri> {
        product_uri(&self.resource, self.version, &self.product_type)
    }

    pub(crate) fn exists(&self) -> bool {
        self.directory.is_dir()
    }

    pub(crate) fn load(&self) -> Result<ProductUsersRecord> {
        Ok(ProductUsersRecord::load(&self.users_path)?)
    }

    fn save(&self, record: &ProductUsersRecord) -> Result<()> {
        Ok(record.save(&self.users_path)?)
    }

    pub(crate) fn add_user(&self, user: &Path) -> Result<bool> {
        let mut record = self.load()?;
        let added = record.add_user(user);
        if added {
            self.save(&record)?;
            debug!(product = %self.directory.display(), user = %user.display(), "registered product user");
        }
        Ok(added)
    }

    pub(crate) fn remove_user(&self, user: &Path) -> Result<bool> {
        let mut record = self.load()?;
        let removed = record.remove_user(user);
        if removed {
            self.save(&record)?;
            debug!(product = %self.directory.display(), user = %user.display(), "unregistered product user");
        }
        Ok(removed)
    }

    pub(crate) fn users(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(self.load()?.users)
    }

    /// True if `subpath` (empty for everything) is in the local cache.
    pub(crate) fn has_downloaded(&self, subpath: &str) -> Result<bool> {
        Ok(self.exists() && self.load()?.has_downloaded(subpath))
    }

    pub(crate) fn mark_downloaded(&self, subpath: &str) -> Result<()> {
        let mut record = self.load()?;
        if !record.has_downloaded(subpath) {
            record.mark_downloaded(subpath);
            self.save(&record)?;
        }
        Ok(())
    }

    pub(crate) fn unused_time(&self) -> Result<Option<Duration>> {
        if !self.exists() {
            return Ok(None);
        }
        let record = self.load()?;
        if !record.users.is_empty() {
            return Ok(None);
        }
        if let Some(since) = record.unused_since {
            let elapsed = UtcTimestamp::now()
                .as_datetime()
                .signed_duration_since(*since.as_datetime());
            return Ok(Some(elapsed.to_std().unwrap_or(Duration::ZERO)));
        }
        let meta = fs::metadata(&self.directory).map_err(fsutil::io_err(&self.directory))?;
        let born = meta.created().or_else(|_| meta.modified());
        Ok(Some(
            born.ok()
                .and_then(|t| t.elapsed().ok())
                .unwrap_or(Duration::ZERO),
        ))
    }

    /// Remember that this product consumes `input`.
    pub(crate) fn record_input(&self, input: &Uri) -> Result<()> {
        let mut record = self.load()?;
        if record.inputs.insert(input.clone()) {
            self.save(&record)?;
        }
        Ok(())
    }

    pub(crate) fn forget_input(&self, input: &Uri) -> Result<()> {
        let mut record = self.load()?;
        if record.inputs.remove(input) {
            self.save(&record)?;
        }
        Ok(())
    }

    /// Register this product as a user of `input` and remember it.
    pub(crate) fn attach_input(&self, project: &Project, input: &Uri) -> Result<()> {
        ProductSite::from_pinned(project, input)?.add_user(&self.directory)?;
        self.record_input(input)
    }

    /// Unregister this product from every input it consumes.
    ///
    /// Returns the inputs it was registered with.
    pub(crate) fn detach_inputs(&self, project: &Project) -> Result<BTreeSet<Uri>> {
        let mut record = self.load()?;
        let inputs = std::mem::take(&mut record.inputs);
        for input in &inputs {
            ProductSite::from_pinned(project, input)?.remove_user(&self.directory)?;
        }
        if record.users.is_empty() {
            self.remove_sidecar(project)?;
        } else {
            self.save(&record)?;
        }
        Ok(inputs)
    }

    fn remove_sidecar(&self, project: &Project) -> Result<()> {
        match fs::remove_file(&self.users_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(fsutil::io_err(&self.users_path)(e).into()),
        }
        if let Some(parent) = self.users_path.parent() {
            fsutil::prune_empty_parents(parent, &project.paths().project_products());
        }
        Ok(())
    }
}

// =============================================================================
// CommitProduct
// =============================================================================

/// A product of a published commit.
#[derive(Debug, Clone)]
pub struct CommitProduct<'p> {
    project: &'p Project,
    site: ProductSite,
    repository: String,
    products_inputs: BTreeMap<Alias, Uri>,
}

impl<'p> CommitProduct<'p> {
    pub(crate) fn new(
        project: &'p Project,
        site: ProductSite,
        repository: String,
        products_inputs: BTreeMap<Alias, Uri>,
    ) -> Self {
        Self {
            project,
            site,
            repository,
            products_inputs,
        }
    }

    pub fn uri(&self) -> Result<Uri> {
        self.site.uri()
    }

    pub fn resource_uri(&self) -> &Uri {
        &self.site.resource
    }

    pub fn version(&self) -> u32 {
        self.site.version
    }

    pub fn product_type(&self) -> &ProductType {
        &self.site.product_type
    }

    pub fn directory(&self) -> &Path {
        &self.site.directory
    }

    /// True when the product is in the local cache.
    pub fn is_local(&self) -> bool {
        self.site.exists()
    }

    /// Dependencies declared by the commit this product belongs to.
    pub fn declared_inputs(&self) -> &BTreeMap<Alias, Uri> {
        &self.products_inputs
    }

    pub fn add_user(&self, user: &Path) -> Result<bool> {
        self.site.add_user(user)
    }

    pub fn remove_user(&self, user: &Path) -> Result<bool> {
        self.site.remove_user(user)
    }

    pub fn get_users(&self) -> Result<BTreeSet<PathBuf>> {
        self.site.users()
    }

    /// Time since the product became unused; `None` while it has users or
    /// is not in the local cache.
    pub fn unused_time(&self) -> Result<Option<Duration>> {
        self.site.unused_time()
    }

    /// Bring the product into the local cache.
    ///
    /// With a `subpath` only that part is fetched; a later call without
    /// one fetches the rest. A local work of the same resource targeting the same version would
    /// be overwritten; `policy` decides what happens then. With
    /// [`ConflictPolicy::Mine`] the work's product is returned instead of a
    /// download. Inputs of the commit are downloaded recursively and this
    /// product is registered as their user.
    pub fn download(self, policy: ConflictPolicy, subpath: &str) -> Result<Product<'p>> {
        let project = self.project;
        match project.resolve_conflict(&self.site.resource, self.site.version, policy)? {
            super::ConflictOutcome::KeepMine(work) => {
                debug!(uri = %self.site.resource, version = self.site.version, "keeping local work");
                return Ok(Product::Work(work.get_product(&self.site.product_type)?));
            }
            super::ConflictOutcome::Trashed | super::ConflictOutcome::NoConflict => {}
        }

        if self.site.has_downloaded(subpath)? {
            debug!(product = %self.site.directory.display(), subpath, "product already local");
            return Ok(Product::Commit(self));
        }

        let fresh = !self.site.exists();
        let key = ProductKey {
            commit: CommitKey::new(&self.site.resource, self.site.version),
            product_type: self.site.product_type.clone(),
        };
        let transport = project.transport(&self.repository)?;
        fsutil::set_read_only(&self.site.directory, false)?;
        transport.download_product(&key, subpath, &self.site.directory)?;
        fsutil::set_read_only(&self.site.directory, true)?;
        self.site.mark_downloaded(subpath)?;
        info!(product = %key, subpath, "downloaded product");

        if fresh {
            for (alias, input) in &self.products_inputs {
                debug!(product = %key, alias = %alias, input = %input, "resolving product input");
                let resolved = resolve::resolve_input(project, input, policy, false)?;
                resolved.product.add_user(&self.site.directory)?;
                self.site.record_input(&resolved.pinned)?;
            }
        }
        Ok(Product::Commit(self))
    }

    /// Evict the product from the local cache.
    ///
    /// Fails with `InUse` while users remain. With `recursive_clean`, the
    /// inputs it consumed are evicted as well when nothing else uses them;
    /// inputs still in use are skipped. Returns every removed directory.
    pub fn remove_from_local_products(&self, recursive_clean: bool) -> Result<Vec<PathBuf>> {
        let users = self.site.users()?;
        if !users.is_empty() {
            return Err(PulseError::InUse {
                product: self.site.uri()?.to_string(),
                users: users.into_iter().collect(),
            });
        }
        let project = self.project;
        let mut removed = Vec::new();
        if self.site.exists() {
            fsutil::ensure_not_busy(&self.site.directory)?;
            fsutil::remove_tree(&self.site.directory)?;
            removed.push(self.site.directory.clone());
            if let Some(parent) = self.site.directory.parent() {
                fsutil::prune_empty_parents(parent, &project.paths().project_products());
            }
            info!(product = %self.site.directory.display(), "removed local product");
        }
        let inputs = self.site.detach_inputs(project)?;

        if recursive_clean {
            for input in inputs {
                removed.extend(cascade_remove(project, &input));
            }
        }
        Ok(removed)
    }
}

/// Best-effort eviction of an input product.
fn cascade_remove(project: &Project, input: &Uri) -> Vec<PathBuf> {
    let attempt = || -> Result<Vec<PathBuf>> {
        let site = ProductSite::from_pinned(project, input)?;
        if project.local_work_at(&site.resource, site.version)?.is_some() {
            debug!(input = %input, "input belongs to a local work, not cascading");
            return Ok(Vec::new());
        }
        project.get_commit_product(input)?.remove_from_local_products(true)
    };
    match attempt() {
        Ok(removed) => removed,
        Err(PulseError::InUse { product, .. }) => {
            debug!(product = %product, "input still in use, kept");
            Vec::new()
        }
        Err(e) => {
            warn!(input = %input, error = %e, "skipped cleaning input");
            Vec::new()
        }
    }
}

// =============================================================================
// WorkProduct
// =============================================================================

/// A product of a live work.
#[derive(Debug, Clone)]
pub struct WorkProduct<'p> {
    project: &'p Project,
    site: ProductSite,
}

impl<'p> WorkProduct<'p> {
    pub(crate) fn new(project: &'p Project, site: ProductSite) -> Self {
        Self { project, site }
    }

    pub(crate) fn site(&self) -> &ProductSite {
        &self.site
    }

    /// The live work this product belongs to.
    pub fn work(&self) -> Result<Work<'p>> {
        self.project
            .local_work_at(&self.site.resource, self.site.version)?
            .ok_or_else(|| {
                PulseError::NotFound(format!(
                    "local work of {} at version {}",
                    self.site.resource, self.site.version
                ))
            })
    }

    pub fn uri(&self) -> Result<Uri> {
        self.site.uri()
    }

    pub fn resource_uri(&self) -> &Uri {
        &self.site.resource
    }

    pub fn version(&self) -> u32 {
        self.site.version
    }

    pub fn product_type(&self) -> &ProductType {
        &self.site.product_type
    }

    pub fn directory(&self) -> &Path {
        &self.site.directory
    }

    pub fn add_user(&self, user: &Path) -> Result<bool> {
        self.site.add_user(user)
    }

    pub fn remove_user(&self, user: &Path) -> Result<bool> {
        self.site.remove_user(user)
    }

    pub fn get_users(&self) -> Result<BTreeSet<PathBuf>> {
        self.site.users()
    }

    pub fn unused_time(&self) -> Result<Option<Duration>> {
        self.site.unused_time()
    }

    /// Input products this product is registered with.
    pub fn inputs(&self) -> Result<BTreeSet<Uri>> {
        Ok(self.site.load()?.inputs)
    }
}

// =============================================================================
// Product
// =============================================================================

/// A product of either kind.
#[derive(Debug, Clone)]
pub enum Product<'p> {
    Commit(CommitProduct<'p>),
    Work(WorkProduct<'p>),
}

impl<'p> Product<'p> {
    fn site(&self) -> &ProductSite {
        match self {
            Product::Commit(p) => &p.site,
            Product::Work(p) => &p.site,
        }
    }

    pub fn uri(&self) -> Result<Uri> {
        self.site().uri()
    }

    pub fn version(&self) -> u32 {
        self.site().version
    }

    pub fn product_type(&self) -> &ProductType {
        &self.site().product_type
    }

    pub fn directory(&self) -> &Path {
        &self.site().directory
    }

    pub fn is_work_product(&self) -> bool {
        matches!(self, Product::Work(_))
    }

    pub fn add_user(&self, user: &Path) -> Result<bool> {
        self.site().add_user(user)
    }

    pub fn remove_user(&self, user: &Path) -> Result<bool> {
        self.site().remove_user(user)
    }

    pub fn get_users(&self) -> Result<BTreeSet<PathBuf>> {
        self.site().users()
    }

    pub fn unused_time(&self) -> Result<Option<Duration>> {
        self.site().unused_time()
    }

    pub fn as_commit_product(&self) -> Option<&CommitProduct<'p>> {
        match self {
            Product::Commit(p) => Some(p),
            Product::Work(_) => None,
        }
    }

    pub fn as_work_product(&self) -> Option<&WorkProduct<'p>> {
        match self {
            Product::Work(p) => Some(p),
            Product::Commit(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::test_support::TestEnv;

    fn site(env: &TestEnv, uri: &str) -> ProductSite {
        let project = env.project();
        let uri = Uri::parse(uri).unwrap();
        ProductSite::from_pinned(&project, &uri).unwrap()
    }

    #[test]
    fn product_uri_is_pinned() {
        let uri = Uri::parse("anna-model/geo/lod").unwrap();
        let pinned = product_uri(&uri, 2, &ProductType::new("geo").unwrap()).unwrap();
        assert_eq!(pinned.to_string(), "anna-model@2/geo");
    }

    #[test]
    fn site_requires_pinned_product_uri() {
        let env = TestEnv::new();
        let project = env.project();
        for bad in ["anna-model/geo", "anna-model@2", "anna-model@last/geo"] {
            let uri = Uri::parse(bad).unwrap();
            assert!(matches!(
                ProductSite::from_pinned(&project, &uri),
                Err(PulseError::InvalidUri { .. })
            ));
        }
    }

    #[test]
    fn unused_time_lifecycle() {
        let env = TestEnv::new();
        let site = site(&env, "anna-model@2/geo");

        // Absent directory.
        assert_eq!(site.unused_time().unwrap(), None);

        fs::create_dir_all(&site.directory).unwrap();
        assert!(site.unused_time().unwrap().is_some());

        let user = Path::new("/sb/film/anna/rig");
        assert!(site.add_user(user).unwrap());
        assert_eq!(site.unused_time().unwrap(), None);

        assert!(site.remove_user(user).unwrap());
        let unused = site.unused_time().unwrap().unwrap();
        assert!(unused < Duration::from_secs(60));
    }

    #[test]
    fn user_mutations_are_idempotent() {
        let env = TestEnv::new();
        let site = site(&env, "anna-model@1/geo");
        let user = Path::new("/consumer");

        assert!(site.add_user(user).unwrap());
        assert!(!site.add_user(user).unwrap());
        assert_eq!(site.users().unwrap().len(), 1);
        assert!(site.remove_user(user).unwrap());
        assert!(!site.remove_user(user).unwrap());
    }

    #[test]
    fn attach_and_detach_inputs() {
        let env = TestEnv::new();
        let project = env.project();
        let consumer = site(&env, "anna-rig@1/skeleton");
        let input = Uri::parse("anna-model@2/geo").unwrap();

        consumer.attach_input(&project, &input).unwrap();
        let input_site = ProductSite::from_pinned(&project, &input).unwrap();
        assert!(input_site.users().unwrap().contains(&consumer.directory));

        let detached = consumer.detach_inputs(&project).unwrap();
        assert!(detached.contains(&input));
        assert!(input_site.users().unwrap().is_empty());
        assert!(!consumer.users_path.exists());
    }
}
