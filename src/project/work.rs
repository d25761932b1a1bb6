//! project::work
//!
//! Local, mutable checkouts.
//!
//! # Lifecycle
//!
//! ```text
//! absent --checkout--> checked-out (N+1) --commit--> checked-out (N+2)
//!                           |
//!                           +--trash--> absent
//!                           +--revert/update--> checked-out (fresh)
//! ```
//!
//! A work keeps its state in `<work>/.pulse/work.json`: target version,
//! declared inputs, the file manifest at the last write, and its product
//! directories. Reloading a work from that record is what makes checkout
//! idempotent across restarts.
//!
//! # Reference counting
//!
//! The work directory is a user of every input product. So is each of the
//! work's own products, which keeps inputs alive for as long as a local
//! product (published or not) was built from them.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::commit::Commit;
use super::product::{Product, ProductSite, WorkProduct};
use super::resolve::{self, ResolveOptions};
use super::resource::{Resource, COMMIT_USER};
use super::Project;
use crate::core::fsutil;
use crate::core::metadata::{CommitRecord, EntityKind, InputEntry, WorkRecord, COMMIT_KIND, SCHEMA_VERSION};
use crate::core::paths::{CachePaths, BOOKKEEPING_DIR};
use crate::core::types::{
    Alias, ChangeKind, ChangePath, ConflictPolicy, FileManifest, ProductType, UtcTimestamp,
    WorkStatus,
};
use crate::core::uri::{Uri, UriVersion};
use crate::error::{PulseError, Result};
use crate::transport::CommitKey;

/// Top-level work entries that are never published.
const WORK_EXCLUDES: [&str; 1] = [BOOKKEEPING_DIR];

/// Fingerprint the files of the work in `directory`.
///
/// Works checked out inside it are not part of it.
pub(crate) fn scan_work_dir(directory: &Path) -> Result<FileManifest> {
    let marker = CachePaths::work_record_path(Path::new(""));
    Ok(fsutil::scan_manifest(directory, &WORK_EXCLUDES, Some(&marker))?)
}

/// A checked-out resource.
#[derive(Debug, Clone)]
pub struct Work<'p> {
    project: &'p Project,
    directory: PathBuf,
    record: WorkRecord,
}

impl<'p> Work<'p> {
    /// Load the work checked out in `directory`, if any.
    pub(crate) fn load(project: &'p Project, directory: &Path) -> Result<Option<Self>> {
        let record = WorkRecord::load(&CachePaths::work_record_path(directory))?;
        Ok(record.map(|record| Self::from_record(project, directory.to_path_buf(), record)))
    }

    pub(crate) fn from_record(project: &'p Project, directory: PathBuf, record: WorkRecord) -> Self {
        Self {
            project,
            directory,
            record,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.record.uri
    }

    /// Version the next commit will publish.
    pub fn version(&self) -> u32 {
        self.record.version
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn record(&self) -> &WorkRecord {
        &self.record
    }

    pub fn inputs(&self) -> &std::collections::BTreeMap<Alias, InputEntry> {
        &self.record.inputs
    }

    pub fn resource(&self) -> Result<Resource<'p>> {
        Resource::load(self.project, &self.record.uri)
    }

    fn save(&self) -> Result<()> {
        Ok(self
            .record
            .save(&CachePaths::work_record_path(&self.directory))?)
    }

    fn product_site(&self, product_type: &ProductType) -> ProductSite {
        ProductSite::new(self.project, &self.record.uri, self.record.version, product_type)
    }

    /// Pinned URIs of every product consumed by the declared inputs.
    fn consumed_products(&self) -> Result<BTreeSet<Uri>> {
        self.record
            .inputs
            .values()
            .map(resolve::consumed_product)
            .collect()
    }

    // =========================================================================
    // Change detection
    // =========================================================================

    fn scan(&self) -> Result<FileManifest> {
        scan_work_dir(&self.directory)
    }

    /// Changes since the last [`write`](Self::write).
    ///
    /// Every file in an unpublished product directory counts as added.
    pub fn status(&self) -> Result<WorkStatus> {
        let mut status = WorkStatus::new();
        for (path, kind) in self.scan()?.diff(&self.record.files) {
            status.insert(ChangePath::Work(path), kind);
        }
        for product_type in &self.record.products {
            let site = self.product_site(product_type);
            for path in fsutil::list_files(&site.directory, &[])? {
                status.insert(
                    ChangePath::Product {
                        product_type: product_type.clone(),
                        path,
                    },
                    ChangeKind::Added,
                );
            }
        }
        Ok(status)
    }

    /// Persist the record with a fresh file manifest.
    pub fn write(&mut self) -> Result<()> {
        self.record.files = self.scan()?;
        self.save()
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Publish the work as the next version of its resource.
    ///
    /// The content is uploaded before the commit record is created; if
    /// creating the record fails, the upload stays behind without a record.
    /// On success the work moves on to the following version with fresh,
    /// empty product directories.
    pub fn commit(&mut self, comment: &str) -> Result<Commit<'p>> {
        let project = self.project;
        let mut resource = self.resource()?;
        resource.check_lock()?;
        if self.record.version != resource.last_version() + 1 {
            return Err(PulseError::Stale {
                uri: self.record.uri.to_string(),
                work_version: self.record.version,
                last_version: resource.last_version(),
            });
        }
        if self.status()?.is_empty() {
            return Err(PulseError::NothingToCommit(self.record.uri.to_string()));
        }
        for (alias, entry) in &self.record.inputs {
            let pinned = entry.uri.resource_uri().pinned(entry.resolved_version);
            if !project.record_exists(EntityKind::Commit, &pinned.to_string())? {
                return Err(PulseError::UnpublishedInput {
                    alias: alias.to_string(),
                    uri: pinned.to_string(),
                });
            }
        }

        let files = self.scan()?;
        let prior = (
            resource.lock_state(),
            resource.lock_user().map(str::to_string),
        );
        resource.set_lock(true, Some(COMMIT_USER), true)?;
        let published = self.publish(&mut resource, comment, &files);
        let restored = resource.restore_lock(prior.0, prior.1);
        let record = published?;
        restored?;

        self.advance(files)?;
        info!(
            uri = %self.record.uri,
            version = record.version,
            author = %record.author,
            "committed work"
        );
        Ok(Commit::from_record(
            project,
            &self.record.uri,
            resource.repository(),
            record,
        ))
    }

    fn publish(
        &self,
        resource: &mut Resource<'p>,
        comment: &str,
        files: &FileManifest,
    ) -> Result<CommitRecord> {
        let project = self.project;
        let uri = &self.record.uri;
        let version = self.record.version;

        let file_list: Vec<String> = files.paths().map(str::to_string).collect();
        let products_dir = project.paths().version_products_dir(uri, version);
        let products_dir = (!self.record.products.is_empty()).then_some(products_dir.as_path());
        project
            .transport(resource.repository())?
            .upload_resource_commit(&CommitKey::new(uri, version), &self.directory, &file_list, products_dir)?;
        debug!(uri = %uri, version, files = file_list.len(), "uploaded commit content");

        let record = CommitRecord {
            kind: COMMIT_KIND.to_string(),
            schema_version: SCHEMA_VERSION,
            entity: uri.entity().to_string(),
            resource_type: uri.resource_type().to_string(),
            version,
            comment: comment.to_string(),
            author: project.user(),
            created_at: UtcTimestamp::now(),
            files: files.clone(),
            products: self.record.products.iter().cloned().collect(),
            products_inputs: self
                .record
                .inputs
                .iter()
                .map(|(alias, entry)| (alias.clone(), entry.pinned_uri()))
                .collect(),
        };
        project.create_record(&uri.pinned(version).to_string(), &record)?;
        resource.set_last_version(version)?;
        Ok(record)
    }

    /// Move on to the next version after a commit.
    fn advance(&mut self, files: FileManifest) -> Result<()> {
        for product_type in &self.record.products {
            let site = self.product_site(product_type);
            fsutil::set_read_only(&site.directory, true)?;
            site.mark_downloaded("")?;
        }
        self.record.version += 1;
        self.record.files = files;
        for entry in self.record.inputs.values_mut() {
            entry.from_work = false;
        }
        let inputs = self.consumed_products()?;
        for product_type in &self.record.products {
            let site = self.product_site(product_type);
            fs::create_dir_all(&site.directory).map_err(fsutil::io_err(&site.directory))?;
            for input in &inputs {
                site.attach_input(self.project, input)?;
            }
        }
        self.save()
    }

    // =========================================================================
    // Trash, revert, update
    // =========================================================================

    /// Remove the work from the local cache.
    ///
    /// The work and its products are moved to a timestamped trash
    /// directory, or deleted with `no_backup`. Fails with `FilesystemBusy`
    /// before touching anything if a directory is held open.
    pub fn trash(self, no_backup: bool) -> Result<()> {
        let project = self.project;
        let paths = project.paths();
        fsutil::ensure_not_busy(&self.directory)?;
        for product_type in &self.record.products {
            fsutil::ensure_not_busy(&self.product_site(product_type).directory)?;
        }

        for input in self.consumed_products()? {
            ProductSite::from_pinned(project, &input)?.remove_user(&self.directory)?;
        }

        let trash = paths.trash_dir(&self.record.uri, &UtcTimestamp::now());
        for product_type in &self.record.products {
            let site = self.product_site(product_type);
            site.detach_inputs(project)?;
            if no_backup {
                fsutil::remove_tree(&site.directory)?;
            } else if site.exists() {
                fsutil::set_read_only(&site.directory, false)?;
                fsutil::move_tree(&site.directory, &trash.join("products").join(product_type.as_str()))?;
            }
        }
        if no_backup {
            fsutil::remove_tree(&self.directory)?;
        } else {
            fsutil::move_tree(&self.directory, &trash.join("work"))?;
        }

        project.unindex_work(&self.record.uri, &self.directory)?;

        if let Some(parent) = self.directory.parent() {
            fsutil::prune_empty_parents(parent, &paths.project_sandbox());
        }
        fsutil::prune_empty_parents(
            &paths.version_products_dir(&self.record.uri, self.record.version),
            &paths.project_products(),
        );
        info!(
            uri = %self.record.uri,
            version = self.record.version,
            backup = !no_backup,
            "trashed work"
        );
        Ok(())
    }

    /// Drop local changes and check out the version this work started from.
    pub fn revert(self, policy: ConflictPolicy) -> Result<Work<'p>> {
        let project = self.project;
        let uri = self.record.uri.clone();
        let directory = self.directory.clone();
        let version = match self.record.version.saturating_sub(1) {
            0 => UriVersion::Last,
            v => UriVersion::Number(v),
        };
        self.trash(true)?;
        project.resource(&uri)?.checkout(version, Some(&directory), policy)
    }

    /// Replace a clean work with a checkout of the last version.
    pub fn update(self, policy: ConflictPolicy) -> Result<Work<'p>> {
        let status = self.status()?;
        if !status.is_empty() {
            return Err(PulseError::DirtyWorkingTree {
                uri: self.record.uri.to_string(),
                changes: status.len(),
            });
        }
        let project = self.project;
        let uri = self.record.uri.clone();
        let directory = self.directory.clone();
        self.trash(true)?;
        project
            .resource(&uri)?
            .checkout(UriVersion::Last, Some(&directory), policy)
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Declare a dependency on a product of another resource.
    ///
    /// `alias` defaults to the product type. The product is resolved (and
    /// downloaded if needed) and this work and its products are registered
    /// as its users.
    pub fn add_input(
        &mut self,
        uri: &Uri,
        alias: Option<Alias>,
        options: ResolveOptions,
    ) -> Result<Product<'p>> {
        let product_type = resolve::input_product_type(uri)?;
        if uri.resource_uri() == self.record.uri {
            return Err(PulseError::InvalidUri {
                uri: uri.to_string(),
                reason: "a work cannot depend on its own resource".to_string(),
            });
        }
        let alias = match alias {
            Some(alias) => alias,
            None => Alias::new(product_type.as_str())?,
        };
        if self.record.inputs.contains_key(&alias) {
            return Err(PulseError::DuplicateAlias(alias.to_string()));
        }

        let resolved = resolve::resolve_input(self.project, uri, options.policy, options.prefer_work)?;
        resolved.product.add_user(&self.directory)?;
        for product_type in &self.record.products {
            self.product_site(product_type)
                .attach_input(self.project, &resolved.pinned)?;
        }
        self.record.inputs.insert(
            alias.clone(),
            InputEntry {
                uri: uri.clone(),
                resolved_version: resolved.version,
                from_work: resolved.from_work,
            },
        );
        link_input(&self.directory, &alias, resolved.product.directory());
        self.save()?;
        info!(uri = %self.record.uri, alias = %alias, input = %resolved.pinned, "added input");
        Ok(resolved.product)
    }

    /// Remove a declared dependency.
    pub fn remove_input(&mut self, alias: &Alias) -> Result<()> {
        let entry = self
            .record
            .inputs
            .remove(alias)
            .ok_or_else(|| PulseError::NotFound(format!("input '{alias}'")))?;
        let pinned = resolve::consumed_product(&entry)?;
        // Another alias may still consume the same product.
        if !self.consumed_products()?.contains(&pinned) {
            let site = ProductSite::from_pinned(self.project, &pinned)?;
            site.remove_user(&self.directory)?;
            for product_type in &self.record.products {
                let own = self.product_site(product_type);
                site.remove_user(&own.directory)?;
                own.forget_input(&pinned)?;
            }
        }
        unlink_input(&self.directory, alias);
        self.save()?;
        info!(uri = %self.record.uri, alias = %alias, input = %pinned, "removed input");
        Ok(())
    }

    // =========================================================================
    // Products
    // =========================================================================

    /// Create an empty product directory for the next commit.
    pub fn create_product(&mut self, product_type: &ProductType) -> Result<WorkProduct<'p>> {
        let site = self.product_site(product_type);
        if self.record.products.contains(product_type) || site.exists() {
            return Err(PulseError::AlreadyExists(format!(
                "product {} of {}",
                product_type, self.record.uri
            )));
        }
        fs::create_dir_all(&site.directory).map_err(fsutil::io_err(&site.directory))?;
        for input in self.consumed_products()? {
            site.attach_input(self.project, &input)?;
        }
        self.record.products.insert(product_type.clone());
        self.save()?;
        info!(uri = %self.record.uri, product = %product_type, "created product");
        Ok(WorkProduct::new(self.project, site))
    }

    pub fn get_product(&self, product_type: &ProductType) -> Result<WorkProduct<'p>> {
        if !self.record.products.contains(product_type) {
            return Err(PulseError::NotFound(format!(
                "product {} of work {}",
                product_type, self.record.uri
            )));
        }
        Ok(WorkProduct::new(self.project, self.product_site(product_type)))
    }

    pub fn list_products(&self) -> Vec<WorkProduct<'p>> {
        self.record
            .products
            .iter()
            .map(|t| WorkProduct::new(self.project, self.product_site(t)))
            .collect()
    }

    /// Move an unused product to the trash.
    pub fn trash_product(&mut self, product_type: &ProductType) -> Result<()> {
        let product = self.get_product(product_type)?;
        let site = product.site();
        let users = site.users()?;
        if !users.is_empty() {
            return Err(PulseError::InUse {
                product: site.uri()?.to_string(),
                users: users.into_iter().collect(),
            });
        }
        fsutil::ensure_not_busy(&site.directory)?;
        site.detach_inputs(self.project)?;
        if site.exists() {
            let trash = self
                .project
                .paths()
                .trash_dir(&self.record.uri, &UtcTimestamp::now())
                .join("products")
                .join(product_type.as_str());
            fsutil::move_tree(&site.directory, &trash)?;
        }
        fsutil::prune_empty_parents(
            &self
                .project
                .paths()
                .version_products_dir(&self.record.uri, self.record.version),
            &self.project.paths().project_products(),
        );
        self.record.products.remove(product_type);
        self.save()?;
        info!(uri = %self.record.uri, product = %product_type, "trashed product");
        Ok(())
    }
}

/// Point `<work>/.pulse/inputs/<alias>` at an input product.
///
/// Links are a convenience only; failing to make one is logged.
pub(crate) fn link_input(work_dir: &Path, alias: &Alias, target: &Path) {
    let links = CachePaths::input_links_dir(work_dir);
    let link = links.join(alias.as_str());
    #[cfg(unix)]
    {
        let made = fs::create_dir_all(&links).and_then(|()| {
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(target, &link)
        });
        if let Err(e) = made {
            warn!(link = %link.display(), error = %e, "failed to link input");
        }
    }
    #[cfg(not(unix))]
    {
        debug!(link = %link.display(), target = %target.display(), "input links need unix");
    }
}

fn unlink_input(work_dir: &Path, alias: &Alias) {
    let links = CachePaths::input_links_dir(work_dir);
    match fs::remove_file(links.join(alias.as_str())) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(alias = %alias, error = %e, "failed to remove input link"),
    }
    // Only succeeds once the last link is gone.
    let _ = fs::remove_dir(&links);
}
