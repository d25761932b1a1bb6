//! project
//!
//! Resources, commits, products and works of one project.
//!
//! # Architecture
//!
//! - [`Connection`] binds the persistence port, the transport backends and
//!   the cache roots. It opens and creates projects.
//! - [`Project`] owns that binding for one project plus its persisted
//!   configuration, and hands out entities that borrow it.
//! - [`Resource`], [`Commit`], [`Product`] and [`Work`] implement the
//!   versioning lifecycle; [`resolve`] resolves dependencies and
//!   [`purge`] evicts unused products.
//!
//! # Example
//!
//! ```
//! use pulse::core::config::{Config, Settings};
//! use pulse::project::Connection;
//! use pulse::registry::BackendRegistry;
//!
//! let temp = tempfile::tempdir().unwrap();
//! let settings = Settings {
//!     sandbox_root: Some(temp.path().join("sandbox")),
//!     products_root: Some(temp.path().join("products")),
//!     ..Settings::default()
//! };
//! let config = Config::from_settings(settings).unwrap();
//!
//! let connection = Connection::open(&config, &BackendRegistry::with_builtins()).unwrap();
//! let project = connection.create_project("film").unwrap();
//! assert_eq!(project.name(), "film");
//! assert!(connection.create_project("film").is_err());
//! ```

pub mod commit;
pub mod product;
pub mod purge;
pub mod resolve;
pub mod resource;
pub mod work;

#[cfg(test)]
pub(crate) mod test_support;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

pub use commit::Commit;
pub use product::{product_uri, CommitProduct, Product, WorkProduct};
pub use resolve::{ResolveOptions, Resolved};
pub use resource::{Resource, COMMIT_USER, MIGRATION_USER, TEMPLATE_ENTITY};
pub use work::Work;

use crate::core::config::{Config, DEFAULT_REPOSITORY};
use crate::core::fsutil::FsError;
use crate::core::metadata::{EntityKind, ProjectRecord, Record, ResourceRecord, WorkIndexRecord};
use crate::core::paths::{CachePaths, BOOKKEEPING_DIR};
use crate::core::types::{validate_project_name, ConflictPolicy};
use crate::core::uri::{Uri, UriVersion};
use crate::database::{Database, MemoryDatabase};
use crate::error::{PulseError, Result};
use crate::registry::BackendRegistry;
use crate::transport::{MemoryTransport, Transport};

/// Outcome of applying a conflict policy.
#[derive(Debug)]
pub enum ConflictOutcome<'p> {
    /// No local work collides.
    NoConflict,
    /// The local work was kept (`mine`).
    KeepMine(Work<'p>),
    /// The local work was trashed without backup (`theirs`).
    Trashed,
}

// =============================================================================
// Connection
// =============================================================================

/// Ports and cache roots shared by every project.
#[derive(Clone)]
pub struct Connection {
    database: Arc<dyn Database>,
    repositories: BTreeMap<String, Arc<dyn Transport>>,
    default_repository: String,
    sandbox_root: PathBuf,
    products_root: PathBuf,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("user", &self.database.get_user_name())
            .field("repositories", &self.repositories.keys().collect::<Vec<_>>())
            .field("default_repository", &self.default_repository)
            .field("sandbox_root", &self.sandbox_root)
            .field("products_root", &self.products_root)
            .finish()
    }
}

impl Connection {
    pub fn new(
        database: Arc<dyn Database>,
        repositories: BTreeMap<String, Arc<dyn Transport>>,
        default_repository: impl Into<String>,
        sandbox_root: impl Into<PathBuf>,
        products_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            database,
            repositories,
            default_repository: default_repository.into(),
            sandbox_root: sandbox_root.into(),
            products_root: products_root.into(),
        }
    }

    /// Build the backends named in `config` through `registry`.
    pub fn open(config: &Config, registry: &BackendRegistry) -> Result<Self> {
        let database = registry.create_database(&config.database())?;
        let mut repositories = BTreeMap::new();
        for (name, settings) in config.repositories() {
            repositories.insert(name, registry.create_transport(&settings)?);
        }
        Ok(Self::new(
            database,
            repositories,
            config.default_repository(),
            config.sandbox_root()?,
            config.products_root()?,
        ))
    }

    /// A connection to fresh in-memory backends.
    pub fn in_memory(
        user: &str,
        sandbox_root: impl Into<PathBuf>,
        products_root: impl Into<PathBuf>,
    ) -> Self {
        let mut repositories: BTreeMap<String, Arc<dyn Transport>> = BTreeMap::new();
        repositories.insert(DEFAULT_REPOSITORY.to_string(), Arc::new(MemoryTransport::new()));
        Self::new(
            Arc::new(MemoryDatabase::new(user)),
            repositories,
            DEFAULT_REPOSITORY,
            sandbox_root,
            products_root,
        )
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    pub fn user(&self) -> String {
        self.database.get_user_name()
    }

    /// Register a new project and persist its configuration.
    pub fn create_project(&self, name: &str) -> Result<Project> {
        validate_project_name(name)?;
        if !self.repositories.contains_key(&self.default_repository) {
            return Err(PulseError::NotFound(format!(
                "repository '{}'",
                self.default_repository
            )));
        }
        self.database.create_project(name)?;
        let record = ProjectRecord::new(name, &self.default_repository);
        self.database
            .create(name, EntityKind::Config, name, record.to_value()?)?;
        info!(project = name, repository = %self.default_repository, "created project");
        Ok(self.bind(record))
    }

    /// Open an existing project.
    pub fn project(&self, name: &str) -> Result<Project> {
        let value = self.database.read(name, EntityKind::Config, name)?;
        Ok(self.bind(ProjectRecord::from_value(value)?))
    }

    fn bind(&self, record: ProjectRecord) -> Project {
        let paths = CachePaths::new(
            &self.sandbox_root,
            &self.products_root,
            &record.name,
            &record.version_prefix,
            record.version_padding,
        );
        Project {
            record,
            database: Arc::clone(&self.database),
            repositories: self.repositories.clone(),
            paths,
        }
    }
}

// =============================================================================
// Project
// =============================================================================

/// One project bound to its backends and local cache.
pub struct Project {
    record: ProjectRecord,
    database: Arc<dyn Database>,
    repositories: BTreeMap<String, Arc<dyn Transport>>,
    paths: CachePaths,
}

impl fmt::Debug for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.record.name)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Project {
    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn record(&self) -> &ProjectRecord {
        &self.record
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.database
    }

    /// Connected user: lock owner and commit author.
    pub fn user(&self) -> String {
        self.database.get_user_name()
    }

    /// Transport backend of a repository.
    pub fn transport(&self, repository: &str) -> Result<Arc<dyn Transport>> {
        self.repositories
            .get(repository)
            .cloned()
            .ok_or_else(|| PulseError::NotFound(format!("repository '{repository}'")))
    }

    // =========================================================================
    // Record access
    // =========================================================================

    pub(crate) fn read_record<R: Record>(&self, uri: &str) -> Result<R> {
        let value = self.database.read(self.name(), R::ENTITY, uri)?;
        Ok(R::from_value(value)?)
    }

    pub(crate) fn create_record<R: Record>(&self, uri: &str, record: &R) -> Result<()> {
        self.database
            .create(self.name(), R::ENTITY, uri, record.to_value()?)?;
        Ok(())
    }

    pub(crate) fn update_record(
        &self,
        kind: EntityKind,
        uri: &str,
        fields: serde_json::Value,
    ) -> Result<()> {
        self.database.update(self.name(), kind, uri, fields)?;
        Ok(())
    }

    pub(crate) fn record_exists(&self, kind: EntityKind, uri: &str) -> Result<bool> {
        Ok(self.database.exists(self.name(), kind, uri)?)
    }

    pub(crate) fn find_uris(&self, kind: EntityKind, pattern: &str) -> Result<Vec<String>> {
        Ok(self.database.find_uris(self.name(), kind, pattern)?)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Create a resource in the project's default repository.
    ///
    /// `template` names an existing resource whose last commit seeds the
    /// first checkout.
    pub fn create_resource(
        &self,
        entity: &str,
        resource_type: &str,
        template: Option<&Uri>,
    ) -> Result<Resource<'_>> {
        let uri = Uri::new(entity, resource_type)?;
        let template = match template {
            Some(template) => Some(self.resource(template)?.uri().clone()),
            None => None,
        };
        let record = ResourceRecord::new(&uri, &self.record.default_repository, template);
        self.create_record(&uri.to_string(), &record)?;
        info!(uri = %uri, repository = %record.repository, "created resource");
        Ok(Resource::from_record(self, uri, record))
    }

    /// Create the template resource used to seed new resources of a type.
    pub fn create_template(&self, resource_type: &str) -> Result<Resource<'_>> {
        self.create_resource(TEMPLATE_ENTITY, resource_type, None)
    }

    pub fn get_resource(&self, entity: &str, resource_type: &str) -> Result<Resource<'_>> {
        self.resource(&Uri::new(entity, resource_type)?)
    }

    /// The resource a URI points into; version and subpath are ignored.
    pub fn resource(&self, uri: &Uri) -> Result<Resource<'_>> {
        Resource::load(self, uri)
    }

    /// Resource URIs matching a glob.
    pub fn list_resources(&self, pattern: &str) -> Result<Vec<Uri>> {
        self.find_uris(EntityKind::Resource, pattern)?
            .iter()
            .map(|uri| Ok(Uri::parse(uri)?))
            .collect()
    }

    // =========================================================================
    // Works
    // =========================================================================

    /// The local work of a resource.
    pub fn get_work(&self, uri: &Uri) -> Result<Work<'_>> {
        self.find_work(uri)?
            .ok_or_else(|| PulseError::NotFound(format!("local work of {}", uri.resource_uri())))
    }

    /// The local work of a resource, if one is checked out.
    ///
    /// The default work directory is checked first, then the work index.
    pub fn find_work(&self, uri: &Uri) -> Result<Option<Work<'_>>> {
        let resource = uri.resource_uri();
        let default_dir = self.paths.work_dir(&resource);
        if let Some(work) = self.work_in(&resource, &default_dir)? {
            return Ok(Some(work));
        }
        let index = WorkIndexRecord::load(&self.paths.work_index_path())?;
        match index.works.get(&resource) {
            Some(directory) if directory != &default_dir => self.work_in(&resource, directory),
            _ => Ok(None),
        }
    }

    fn work_in(&self, resource: &Uri, directory: &Path) -> Result<Option<Work<'_>>> {
        Ok(Work::load(self, directory)?.filter(|work| work.uri() == resource))
    }

    /// Every work checked out in this project's sandbox, plus indexed
    /// works checked out elsewhere.
    pub fn list_works(&self) -> Result<Vec<Work<'_>>> {
        let root = self.paths.project_sandbox();
        let mut works = Vec::new();
        if root.is_dir() {
            let mut entries = WalkDir::new(&root).min_depth(1).into_iter();
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
                if let Some(work) = Work::load(self, entry.path())? {
                    works.push(work);
                    entries.skip_current_dir();
                }
            }
        }
        let index = WorkIndexRecord::load(&self.paths.work_index_path())?;
        for (resource, directory) in &index.works {
            if works.iter().any(|work| work.directory() == directory) {
                continue;
            }
            if let Some(work) = self.work_in(resource, directory)? {
                works.push(work);
            }
        }
        Ok(works)
    }

    /// Record where the work of `resource` is checked out.
    pub(crate) fn index_work(&self, resource: &Uri, directory: &Path) -> Result<()> {
        let path = self.paths.work_index_path();
        let mut index = WorkIndexRecord::load(&path)?;
        let resource = resource.resource_uri();
        if index.works.get(&resource).map(PathBuf::as_path) != Some(directory) {
            index.works.insert(resource.clone(), directory.to_path_buf());
            index.save(&path)?;
            debug!(uri = %resource, directory = %directory.display(), "indexed work");
        }
        Ok(())
    }

    /// Drop the index entry of `resource` if it points at `directory`.
    pub(crate) fn unindex_work(&self, resource: &Uri, directory: &Path) -> Result<()> {
        let path = self.paths.work_index_path();
        let mut index = WorkIndexRecord::load(&path)?;
        let resource = resource.resource_uri();
        if index.works.get(&resource).map(PathBuf::as_path) == Some(directory) {
            index.works.remove(&resource);
            index.save(&path)?;
        }
        Ok(())
    }

    /// The local work of a resource if it targets `version`.
    pub(crate) fn local_work_at(&self, uri: &Uri, version: u32) -> Result<Option<Work<'_>>> {
        Ok(self.find_work(uri)?.filter(|work| work.version() == version))
    }

    /// Apply a conflict policy before a download of `uri@version`.
    ///
    /// A local work of the same resource targeting the same version would
    /// be overwritten by the download.
    pub fn resolve_conflict(
        &self,
        uri: &Uri,
        version: u32,
        policy: ConflictPolicy,
    ) -> Result<ConflictOutcome<'_>> {
        let Some(work) = self.local_work_at(uri, version)? else {
            return Ok(ConflictOutcome::NoConflict);
        };
        match policy {
            ConflictPolicy::Error => Err(PulseError::WorkConflict {
                uri: uri.resource_uri().to_string(),
                version,
            }),
            ConflictPolicy::Mine => Ok(ConflictOutcome::KeepMine(work)),
            ConflictPolicy::Theirs => {
                info!(uri = %work.uri(), version, "trashing local work in favor of download");
                work.trash(true)?;
                Ok(ConflictOutcome::Trashed)
            }
        }
    }

    // =========================================================================
    // Products
    // =========================================================================

    /// The product of a published commit named by `uri`.
    ///
    /// A mutable URI points at the last commit.
    pub fn get_commit_product(&self, uri: &Uri) -> Result<CommitProduct<'_>> {
        let product_type = resolve::input_product_type(uri)?;
        let version = match uri.version() {
            Some(UriVersion::Number(v)) => UriVersion::Number(v),
            _ => UriVersion::Last,
        };
        self.resource(uri)?
            .get_commit(version)?
            .get_product(&product_type)
    }

    /// The product named by `uri` if it is in the local cache.
    ///
    /// A mutable URI prefers the local work over the last commit.
    pub fn get_local_product(&self, uri: &Uri) -> Result<Option<Product<'_>>> {
        let product_type = resolve::input_product_type(uri)?;
        let version = match uri.version() {
            Some(UriVersion::Number(v)) => v,
            _ => match self.find_work(uri)? {
                Some(work) => work.version(),
                None => self.resource(uri)?.last_version(),
            },
        };
        if let Some(work) = self.local_work_at(uri, version)? {
            return match work.get_product(&product_type) {
                Ok(product) => Ok(Some(Product::Work(product))),
                Err(PulseError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            };
        }
        let site = product::ProductSite::new(self, uri, version, &product_type);
        if !site.exists() {
            return Ok(None);
        }
        let pinned = product_uri(uri, version, &product_type)?;
        Ok(Some(Product::Commit(self.get_commit_product(&pinned)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{publish, TestEnv, PROJECT};
    use super::*;
    use crate::core::types::ProductType;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[test]
    fn in_memory_connection_uses_default_repository() {
        let env = TestEnv::new();
        let connection = Connection::in_memory("carol", env.sandbox.path(), env.products.path());
        assert_eq!(connection.user(), "carol");
        let project = connection.create_project("short").unwrap();
        assert!(project.transport(DEFAULT_REPOSITORY).is_ok());
        assert!(matches!(
            project.transport("offsite"),
            Err(PulseError::NotFound(_))
        ));
    }

    #[test]
    fn works_are_found_outside_default_directory() {
        let env = TestEnv::new();
        let project = env.project();
        let resource = project.create_resource("anna", "model", None).unwrap();
        let elsewhere = project.paths().project_sandbox().join("shots/010/anna");
        resource
            .checkout(UriVersion::Last, Some(&elsewhere), ConflictPolicy::Error)
            .unwrap();

        let found = project.get_work(&uri("anna-model@3/geo")).unwrap();
        assert_eq!(found.directory(), elsewhere);
        assert_eq!(project.list_works().unwrap().len(), 1);
        assert!(matches!(
            project.get_work(&uri("anna-rig")),
            Err(PulseError::NotFound(_))
        ));
    }

    #[test]
    fn work_index_tracks_checkout_and_trash() {
        let env = TestEnv::new();
        let project = env.project();
        let model = project.create_resource("anna", "model", None).unwrap();
        let elsewhere = project.paths().project_sandbox().join("scratch/anna");
        let work = model
            .checkout(UriVersion::Last, Some(&elsewhere), ConflictPolicy::Error)
            .unwrap();

        let index = WorkIndexRecord::load(&project.paths().work_index_path()).unwrap();
        assert_eq!(index.works.get(&uri("anna-model")), Some(&elsewhere));
        assert_eq!(project.get_work(&uri("anna-model")).unwrap().directory(), elsewhere);

        // A stray record inside the work is never loaded.
        let stray = elsewhere.join("refs").join(BOOKKEEPING_DIR);
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("work.json"), "not a record").unwrap();
        assert_eq!(project.list_works().unwrap().len(), 1);

        // One work per resource.
        assert!(matches!(
            model.checkout(UriVersion::Last, None, ConflictPolicy::Error),
            Err(PulseError::AlreadyExists(_))
        ));

        work.trash(true).unwrap();
        let index = WorkIndexRecord::load(&project.paths().work_index_path()).unwrap();
        assert!(index.works.is_empty());
        assert!(project.find_work(&uri("anna-model")).unwrap().is_none());
        assert!(project.list_works().unwrap().is_empty());
    }

    #[test]
    fn resolve_conflict_policies() {
        let env = TestEnv::new();
        let project = env.project();
        let model = uri("anna-model");
        project
            .create_resource("anna", "model", None)
            .unwrap()
            .checkout(UriVersion::Last, None, ConflictPolicy::Error)
            .unwrap();

        assert!(matches!(
            project.resolve_conflict(&model, 2, ConflictPolicy::Error),
            Ok(ConflictOutcome::NoConflict)
        ));
        assert!(matches!(
            project.resolve_conflict(&model, 1, ConflictPolicy::Error),
            Err(PulseError::WorkConflict { version: 1, .. })
        ));
        assert!(matches!(
            project.resolve_conflict(&model, 1, ConflictPolicy::Mine),
            Ok(ConflictOutcome::KeepMine(_))
        ));
        assert!(matches!(
            project.resolve_conflict(&model, 1, ConflictPolicy::Theirs),
            Ok(ConflictOutcome::Trashed)
        ));
        assert!(project.find_work(&model).unwrap().is_none());
    }

    #[test]
    fn local_product_prefers_work_for_mutable_uri() {
        let env = TestEnv::new();
        let project = env.project();
        publish(&project, "anna-model", &["geo"]);

        let latest = project
            .get_local_product(&uri("anna-model/geo"))
            .unwrap()
            .unwrap();
        assert!(latest.is_work_product());
        assert_eq!(latest.version(), 2);

        let pinned = project
            .get_local_product(&uri("anna-model@1/geo"))
            .unwrap()
            .unwrap();
        assert!(!pinned.is_work_product());
        assert_eq!(pinned.product_type(), &ProductType::new("geo").unwrap());

        assert!(project
            .get_local_product(&uri("anna-model@1/cache"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn project_reopens_with_its_record() {
        let env = TestEnv::new();
        let project = env.connection.project(PROJECT).unwrap();
        assert_eq!(project.name(), PROJECT);
        assert_eq!(project.paths().version_dir_name(7), "V007");
        assert_eq!(env.connection_as("bob").project(PROJECT).unwrap().user(), "bob");
    }
}
