//! Shared fixtures for project tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use super::{Connection, Project};
use crate::core::config::DEFAULT_REPOSITORY;
use crate::core::types::{ConflictPolicy, ProductType};
use crate::core::uri::{Uri, UriVersion};
use crate::database::MemoryDatabase;
use crate::transport::{MemoryTransport, Transport};

pub(crate) const PROJECT: &str = "film";

/// In-memory backends plus temporary cache roots, with project "film".
pub(crate) struct TestEnv {
    pub(crate) sandbox: TempDir,
    pub(crate) products: TempDir,
    pub(crate) database: MemoryDatabase,
    pub(crate) transport: MemoryTransport,
    pub(crate) connection: Connection,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let sandbox = TempDir::new().unwrap();
        let products = TempDir::new().unwrap();
        let database = MemoryDatabase::new("alice");
        let transport = MemoryTransport::new();
        let connection = connect(&database, &transport, sandbox.path(), products.path());
        connection.create_project(PROJECT).unwrap();
        Self {
            sandbox,
            products,
            database,
            transport,
            connection,
        }
    }

    pub(crate) fn project(&self) -> Project {
        self.connection.project(PROJECT).unwrap()
    }

    /// Same backends and cache, connected as another user.
    pub(crate) fn connection_as(&self, user: &str) -> Connection {
        connect(
            &self.database.with_user(user),
            &self.transport,
            self.sandbox.path(),
            self.products.path(),
        )
    }
}

fn connect(
    database: &MemoryDatabase,
    transport: &MemoryTransport,
    sandbox: &Path,
    products: &Path,
) -> Connection {
    let mut repositories: BTreeMap<String, Arc<dyn Transport>> = BTreeMap::new();
    repositories.insert(DEFAULT_REPOSITORY.to_string(), Arc::new(transport.clone()));
    Connection::new(
        Arc::new(database.clone()),
        repositories,
        DEFAULT_REPOSITORY,
        sandbox,
        products,
    )
}

/// Check out `uri` (creating the resource if needed), write a file and
/// the given products, and commit. Returns the published version.
///
/// The work stays checked out at the following version.
pub(crate) fn publish(project: &Project, uri: &str, product_types: &[&str]) -> u32 {
    let uri = Uri::parse(uri).unwrap();
    let resource = match project.resource(&uri) {
        Ok(resource) => resource,
        Err(_) => project
            .create_resource(uri.entity(), uri.resource_type(), None)
            .unwrap(),
    };
    let mut work = match project.find_work(&uri).unwrap() {
        Some(work) => work,
        None => resource
            .checkout(UriVersion::Last, None, ConflictPolicy::Error)
            .unwrap(),
    };
    let version = work.version();
    fs::write(work.directory().join("scene.txt"), format!("v{version}")).unwrap();
    for name in product_types {
        let product_type = ProductType::new(*name).unwrap();
        let product = match work.get_product(&product_type) {
            Ok(product) => product,
            Err(_) => work.create_product(&product_type).unwrap(),
        };
        fs::write(product.directory().join("data.bin"), format!("{name} v{version}")).unwrap();
    }
    work.commit(&format!("publish v{version}")).unwrap().version()
}
