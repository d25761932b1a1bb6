//! project::resource
//!
//! Identity and versioning state of a resource.
//!
//! # Locking
//!
//! The lock is a pair of fields on the resource record. `set_lock` reads
//! the record, decides, then writes: it is not a compare-and-swap, and two
//! processes racing to take or steal the lock can both succeed. Commit and
//! repository migration lock under synthetic users for their duration and
//! restore the previous owner afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::commit::Commit;
use super::product::ProductSite;
use super::resolve;
use super::work::Work;
use super::{ConflictOutcome, Project};
use crate::core::fsutil;
use crate::core::metadata::{EntityKind, InputEntry, ResourceRecord, WorkRecord};
use crate::core::paths::CachePaths;
use crate::core::types::{ConflictPolicy, ProductType};
use crate::core::uri::{Uri, UriVersion};
use crate::error::{PulseError, Result};
use crate::transport::ResourceKey;

/// Lock owner while a commit publishes.
pub const COMMIT_USER: &str = "_commit_user_";

/// Lock owner while a resource moves between repositories.
pub const MIGRATION_USER: &str = "_migration_user_";

/// Entity of the per-type template resources.
pub const TEMPLATE_ENTITY: &str = "_template";

/// A versioned asset of a project.
#[derive(Debug, Clone)]
pub struct Resource<'p> {
    project: &'p Project,
    uri: Uri,
    record: ResourceRecord,
}

impl<'p> Resource<'p> {
    pub(crate) fn load(project: &'p Project, uri: &Uri) -> Result<Self> {
        let uri = uri.resource_uri();
        let record = project.read_record(&uri.to_string())?;
        Ok(Self {
            project,
            uri,
            record,
        })
    }

    pub(crate) fn from_record(project: &'p Project, uri: Uri, record: ResourceRecord) -> Self {
        Self {
            project,
            uri,
            record,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn record(&self) -> &ResourceRecord {
        &self.record
    }

    /// Last published version; 0 while unpublished.
    pub fn last_version(&self) -> u32 {
        self.record.last_version
    }

    pub fn lock_state(&self) -> bool {
        self.record.lock_state
    }

    pub fn lock_user(&self) -> Option<&str> {
        self.record.lock_user.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.record.repository
    }

    pub fn resource_template(&self) -> Option<&Uri> {
        self.record.resource_template.as_ref()
    }

    /// Default work directory of this resource.
    pub fn work_directory(&self) -> PathBuf {
        self.project.paths().work_dir(&self.uri)
    }

    /// Re-read the record from the database.
    pub fn reload(&mut self) -> Result<()> {
        self.record = self.project.read_record(&self.uri.to_string())?;
        Ok(())
    }

    // =========================================================================
    // Commits
    // =========================================================================

    /// The commit at `version`; `last` resolves to the last published one.
    pub fn get_commit(&self, version: UriVersion) -> Result<Commit<'p>> {
        let version = match version {
            UriVersion::Number(v) => v,
            UriVersion::Last if self.record.last_version == 0 => {
                return Err(PulseError::NotFound(format!(
                    "published version of {}",
                    self.uri
                )));
            }
            UriVersion::Last => self.record.last_version,
        };
        Commit::load(self.project, &self.uri, version, &self.record.repository)
    }

    pub fn get_last_commit(&self) -> Result<Option<Commit<'p>>> {
        if self.record.last_version == 0 {
            return Ok(None);
        }
        self.get_commit(UriVersion::Last).map(Some)
    }

    /// Every commit, in version order.
    pub fn list_commits(&self) -> Result<Vec<Commit<'p>>> {
        let pattern = format!("{}@*", self.uri);
        let mut commits = Vec::new();
        for found in self.project.find_uris(EntityKind::Commit, &pattern)? {
            let uri = Uri::parse(&found)?;
            if uri.resource_uri() != self.uri {
                continue;
            }
            if let Some(UriVersion::Number(v)) = uri.version() {
                commits.push(Commit::load(self.project, &self.uri, v, &self.record.repository)?);
            }
        }
        commits.sort_by_key(|c| c.version());
        Ok(commits)
    }

    // =========================================================================
    // Lock and repository
    // =========================================================================

    /// Take or release the lock.
    ///
    /// `user` defaults to the connected user. When the lock is held by a
    /// different user nothing happens unless `steal` is set. Returns whether
    /// the lock fields were written.
    pub fn set_lock(&mut self, state: bool, user: Option<&str>, steal: bool) -> Result<bool> {
        self.reload()?;
        let user = user
            .map(str::to_string)
            .unwrap_or_else(|| self.project.user());
        if self.record.lock_state && !steal && self.record.lock_user.as_deref() != Some(user.as_str()) {
            debug!(
                uri = %self.uri,
                owner = self.record.lock_user.as_deref().unwrap_or(""),
                user = %user,
                "lock held by another user, unchanged"
            );
            return Ok(false);
        }
        let lock_user = state.then_some(user);
        self.project.update_record(
            EntityKind::Resource,
            &self.uri.to_string(),
            json!({ "lock_state": state, "lock_user": lock_user }),
        )?;
        info!(uri = %self.uri, locked = state, user = lock_user.as_deref().unwrap_or(""), "lock changed");
        self.record.lock_state = state;
        self.record.lock_user = lock_user;
        Ok(true)
    }

    /// Fail with `Locked` when another user holds the lock.
    pub(crate) fn check_lock(&self) -> Result<()> {
        let user = self.project.user();
        match (&self.record.lock_state, &self.record.lock_user) {
            (true, Some(owner)) if *owner != user => Err(PulseError::Locked {
                uri: self.uri.to_string(),
                user: owner.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Record a newly published version.
    pub(crate) fn set_last_version(&mut self, version: u32) -> Result<()> {
        self.project.update_record(
            EntityKind::Resource,
            &self.uri.to_string(),
            json!({ "last_version": version }),
        )?;
        self.record.last_version = version;
        Ok(())
    }

    /// Restore a lock saved before a synthetic lock was taken.
    pub(crate) fn restore_lock(&mut self, state: bool, user: Option<String>) -> Result<()> {
        self.set_lock(state, user.as_deref(), true).map(|_| ())
    }

    /// Move the full history of the resource to another repository.
    ///
    /// Not atomic: if a step fails, content may exist in both repositories
    /// (or, after the removal, only in the new one while the record still
    /// names the old one). The previous lock is restored either way.
    pub fn set_repository(&mut self, repository: &str) -> Result<()> {
        self.reload()?;
        if self.record.repository == repository {
            return Err(PulseError::Conflict(format!(
                "{} is already stored in repository '{}'",
                self.uri, repository
            )));
        }
        self.check_lock()?;
        let old = self.project.transport(&self.record.repository)?;
        let new = self.project.transport(repository)?;

        let prior = (self.record.lock_state, self.record.lock_user.clone());
        self.set_lock(true, Some(MIGRATION_USER), true)?;

        let scratch = self
            .project
            .paths()
            .migration_dir(&Uuid::new_v4().to_string());
        let key = ResourceKey::from_uri(&self.uri);
        let moved = (|| -> Result<()> {
            old.download_resource(&key, &scratch)?;
            new.upload_resource(&key, &scratch)?;
            old.remove_resource(&key)?;
            self.project.update_record(
                EntityKind::Resource,
                &self.uri.to_string(),
                json!({ "repository": repository }),
            )
        })();
        if let Err(e) = fsutil::remove_tree(&scratch) {
            warn!(path = %scratch.display(), error = %e, "failed to remove migration scratch");
        }
        self.restore_lock(prior.0, prior.1)?;
        moved?;

        info!(uri = %self.uri, from = %self.record.repository, to = repository, "migrated resource");
        self.record.repository = repository.to_string();
        Ok(())
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Materialize a work for the next version.
    ///
    /// If a work is already checked out at `destination` (default: the
    /// resource's work directory) it is returned as is. A work of the same
    /// resource elsewhere fails with `AlreadyExists`. Otherwise the files
    /// of the requested commit are downloaded, or, for an unpublished
    /// resource, those of its template's last commit. Declared product
    /// directories are recreated empty, and every declared input is
    /// resolved with `policy`.
    pub fn checkout(
        &self,
        version: UriVersion,
        destination: Option<&Path>,
        policy: ConflictPolicy,
    ) -> Result<Work<'p>> {
        let directory = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.work_directory());

        if let Some(work) = Work::load(self.project, &directory)? {
            if work.uri() != &self.uri {
                return Err(PulseError::AlreadyExists(format!(
                    "work of {} in {}",
                    work.uri(),
                    directory.display()
                )));
            }
            debug!(uri = %self.uri, directory = %directory.display(), "work already checked out");
            return Ok(work);
        }
        if fs::read_dir(&directory).is_ok_and(|mut entries| entries.next().is_some()) {
            return Err(PulseError::AlreadyExists(format!(
                "directory {} (not empty)",
                directory.display()
            )));
        }
        if let Some(existing) = self.project.find_work(&self.uri)? {
            return Err(PulseError::AlreadyExists(format!(
                "work of {} in {}",
                self.uri,
                existing.directory().display()
            )));
        }

        let source = self.checkout_source(version)?;
        let target = self.record.last_version + 1;
        let mut record = WorkRecord::new(&self.uri, target);
        let mut registered: Vec<(ProductSite, PathBuf)> = Vec::new();

        let result = self.materialize(&directory, source.as_ref(), policy, &mut record, &mut registered);
        if let Err(e) = result {
            warn!(uri = %self.uri, error = %e, "checkout failed, cleaning up");
            self.undo_checkout(&directory, &record, &registered);
            return Err(e);
        }

        info!(
            uri = %self.uri,
            version = target,
            source = source.as_ref().map(|c| c.uri().to_string()).unwrap_or_default(),
            directory = %directory.display(),
            "checked out work"
        );
        Ok(Work::from_record(self.project, directory, record))
    }

    /// The commit a checkout copies from, if any.
    fn checkout_source(&self, version: UriVersion) -> Result<Option<Commit<'p>>> {
        if self.record.last_version > 0 || matches!(version, UriVersion::Number(_)) {
            return self.get_commit(version).map(Some);
        }
        let template = match &self.record.resource_template {
            Some(template) => Some(Resource::load(self.project, template)?),
            None if self.uri.entity() != TEMPLATE_ENTITY => {
                let template = Uri::new(TEMPLATE_ENTITY, self.uri.resource_type())?;
                match Resource::load(self.project, &template) {
                    Ok(resource) => Some(resource),
                    Err(PulseError::NotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };
        match template {
            Some(template) => {
                debug!(uri = %self.uri, template = %template.uri(), "seeding from template");
                template.get_last_commit()
            }
            None => Ok(None),
        }
    }

    fn materialize(
        &self,
        directory: &Path,
        source: Option<&Commit<'p>>,
        policy: ConflictPolicy,
        record: &mut WorkRecord,
        registered: &mut Vec<(ProductSite, PathBuf)>,
    ) -> Result<()> {
        fs::create_dir_all(directory).map_err(fsutil::io_err(directory))?;
        if let Some(commit) = source {
            commit.download_work(directory)?;
            fsutil::set_read_only(directory, false)?;
            for (alias, uri) in commit.products_inputs() {
                let resolved = resolve::resolve_input(self.project, uri, policy, false)?;
                resolved.product.add_user(directory)?;
                registered.push((
                    ProductSite::from_pinned(self.project, &resolved.pinned)?,
                    directory.to_path_buf(),
                ));
                record.inputs.insert(
                    alias.clone(),
                    InputEntry {
                        uri: uri.clone(),
                        resolved_version: resolved.version,
                        from_work: resolved.from_work,
                    },
                );
            }
        }
        record.files = super::work::scan_work_dir(directory)?;

        let inputs = record
            .inputs
            .values()
            .map(resolve::consumed_product)
            .collect::<Result<Vec<Uri>>>()?;
        let product_types: Vec<ProductType> = source
            .map(|c| c.product_types().to_vec())
            .unwrap_or_default();
        for product_type in product_types {
            let site = ProductSite::new(self.project, &self.uri, record.version, &product_type);
            fs::create_dir_all(&site.directory).map_err(fsutil::io_err(&site.directory))?;
            record.products.insert(product_type);
            for input in &inputs {
                site.attach_input(self.project, input)?;
                registered.push((
                    ProductSite::from_pinned(self.project, input)?,
                    site.directory.clone(),
                ));
            }
        }

        for (alias, entry) in &record.inputs {
            let site = ProductSite::from_pinned(self.project, &resolve::consumed_product(entry)?)?;
            super::work::link_input(directory, alias, &site.directory);
        }
        record.save(&CachePaths::work_record_path(directory))?;
        self.project.index_work(&self.uri, directory)
    }

    /// Best-effort removal of a half-made checkout.
    fn undo_checkout(
        &self,
        directory: &Path,
        record: &WorkRecord,
        registered: &[(ProductSite, PathBuf)],
    ) {
        for (site, user) in registered {
            if let Err(e) = site.remove_user(user) {
                warn!(product = %site.directory.display(), error = %e, "failed to unregister user");
            }
        }
        for product_type in &record.products {
            let site = ProductSite::new(self.project, &self.uri, record.version, product_type);
            if let Err(e) = site.detach_inputs(self.project) {
                warn!(product = %site.directory.display(), error = %e, "failed to detach inputs");
            }
            if let Err(e) = fsutil::remove_tree(&site.directory) {
                warn!(product = %site.directory.display(), error = %e, "failed to remove partial product");
            }
        }
        if let Err(e) = fsutil::remove_tree(directory) {
            warn!(directory = %directory.display(), error = %e, "failed to remove partial work");
        }
        if let Err(e) = self.project.unindex_work(&self.uri, directory) {
            warn!(uri = %self.uri, error = %e, "failed to drop work from index");
        }
    }

    /// Apply a conflict policy to a local work of this resource.
    pub fn resolve_conflict(&self, version: u32, policy: ConflictPolicy) -> Result<ConflictOutcome<'p>> {
        self.project.resolve_conflict(&self.uri, version, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::test_support::{publish, TestEnv};

    #[test]
    fn unpublished_resource_has_no_commits() {
        let env = TestEnv::new();
        let project = env.project();
        let resource = project.create_resource("chars:anna", "model", None).unwrap();
        assert_eq!(resource.last_version(), 0);
        assert_eq!(resource.repository(), "default");
        assert!(resource.get_last_commit().unwrap().is_none());
        assert!(resource.list_commits().unwrap().is_empty());
        assert!(matches!(
            resource.get_commit(UriVersion::Last),
            Err(PulseError::NotFound(_))
        ));
        assert!(resource.work_directory().ends_with("film/chars/anna/@model"));
    }

    #[test]
    fn lock_is_a_no_op_for_other_users() {
        let env = TestEnv::new();
        let alice = env.project();
        let bob = env.connection_as("bob").project("film").unwrap();
        alice.create_resource("anna", "model", None).unwrap();

        let mut theirs = bob.get_resource("anna", "model").unwrap();
        assert!(theirs.set_lock(true, None, false).unwrap());
        assert!(theirs.check_lock().is_ok());

        let mut mine = alice.get_resource("anna", "model").unwrap();
        assert!(matches!(mine.check_lock(), Err(PulseError::Locked { .. })));
        assert!(!mine.set_lock(false, None, false).unwrap());
        assert_eq!(mine.lock_user(), Some("bob"));

        // An explicit user name acts on that user's behalf.
        assert!(mine.set_lock(false, Some("bob"), false).unwrap());
        assert!(!mine.lock_state());
    }

    #[test]
    fn commits_are_listed_in_order() {
        let env = TestEnv::new();
        let project = env.project();
        for _ in 0..3 {
            publish(&project, "anna-model", &[]);
        }
        // A similarly named resource does not leak into the listing.
        publish(&project, "anna-modelx", &[]);

        let resource = project.get_resource("anna", "model").unwrap();
        let versions: Vec<u32> = resource.list_commits().unwrap().iter().map(|c| c.version()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn explicit_version_checkout_targets_next_version() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);
        publish(&project, "anna-model", &["geo"]);
        project
            .get_work(&Uri::parse("anna-model").unwrap())
            .unwrap()
            .trash(true)
            .unwrap();

        let resource = project.get_resource("anna", "model").unwrap();
        let work = resource
            .checkout(UriVersion::Number(1), None, ConflictPolicy::Error)
            .unwrap();
        assert_eq!(work.version(), 3);
        assert_eq!(fs::read_to_string(work.directory().join("scene.txt")).unwrap(), "v1");
        assert!(work.status().unwrap().is_empty());
    }

    #[test]
    fn checkout_into_foreign_work_fails() {
        let env = TestEnv::new();
        let project = env.project();
        let model = project.create_resource("anna", "model", None).unwrap();
        let rig = project.create_resource("anna", "rig", None).unwrap();
        let work = model
            .checkout(UriVersion::Last, None, ConflictPolicy::Error)
            .unwrap();
        assert!(matches!(
            rig.checkout(UriVersion::Last, Some(work.directory()), ConflictPolicy::Error),
            Err(PulseError::AlreadyExists(_))
        ));
    }
}
