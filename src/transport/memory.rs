//! transport::memory
//!
//! In-memory transport backend.
//!
//! Stores every uploaded tree as a map of relative paths to bytes. Clones
//! share the store, so two projects (or two users) can publish to and
//! download from the same repository. Download calls are counted, which
//! lets callers assert that an idempotent operation did not fetch twice.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{CommitKey, ProductKey, ResourceKey, Transport, TransportError};
use crate::core::fsutil::{self, io_err};

const ARCHIVE_WORK_DIR: &str = "work";
const ARCHIVE_PRODUCTS_DIR: &str = "products";

type Tree = BTreeMap<String, Vec<u8>>;

/// Operations that can be armed to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportOp {
    UploadCommit,
    DownloadWork,
    DownloadProduct,
    DownloadResource,
    UploadResource,
    RemoveResource,
}

#[derive(Debug, Clone, Default)]
struct StoredCommit {
    work: Tree,
    products: BTreeMap<String, Tree>,
}

#[derive(Debug, Default)]
struct MemoryTransportInner {
    commits: BTreeMap<CommitKey, StoredCommit>,
    downloads: usize,
    fail_next: Option<(TransportOp, TransportError)>,
}

/// In-memory repository for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryTransportInner>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: TransportOp, error: TransportError) {
        self.lock().fail_next = Some((op, error));
    }

    /// Number of download calls served so far.
    pub fn downloads(&self) -> usize {
        self.lock().downloads
    }

    /// Stored versions of a resource, ascending.
    pub fn versions(&self, resource: &ResourceKey) -> Vec<u32> {
        self.lock()
            .commits
            .keys()
            .filter(|k| &k.resource == resource)
            .map(|k| k.version)
            .collect()
    }

    /// Stored work file paths of a commit.
    pub fn work_files(&self, commit: &CommitKey) -> Vec<String> {
        self.lock()
            .commits
            .get(commit)
            .map(|c| c.work.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTransportInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_fail(inner: &mut MemoryTransportInner, op: TransportOp) -> Result<(), TransportError> {
        match inner.fail_next.take() {
            Some((armed, error)) if armed == op => Err(error),
            other => {
                inner.fail_next = other;
                Ok(())
            }
        }
    }
}

fn read_tree(root: &Path) -> Result<Tree, TransportError> {
    let mut tree = Tree::new();
    for rel in fsutil::list_files(root, &[])? {
        let path = root.join(&rel);
        let data = fs::read(&path).map_err(io_err(&path))?;
        tree.insert(rel, data);
    }
    Ok(tree)
}

fn subdirectories(root: &Path) -> Result<Vec<String>, TransportError> {
    let mut names = Vec::new();
    if !root.is_dir() {
        return Ok(names);
    }
    for entry in fs::read_dir(root).map_err(io_err(root))? {
        let entry = entry.map_err(io_err(root))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn read_products(products_dir: &Path) -> Result<BTreeMap<String, Tree>, TransportError> {
    let mut products = BTreeMap::new();
    for name in subdirectories(products_dir)? {
        if name.starts_with('.') {
            continue;
        }
        products.insert(name.clone(), read_tree(&products_dir.join(&name))?);
    }
    Ok(products)
}

fn write_tree<'a>(
    destination: &Path,
    files: impl Iterator<Item = (&'a String, &'a Vec<u8>)>,
) -> Result<(), TransportError> {
    fs::create_dir_all(destination).map_err(io_err(destination))?;
    for (rel, data) in files {
        let path = destination.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(&path, data).map_err(io_err(&path))?;
    }
    Ok(())
}

fn under_subpath(rel: &str, subpath: &str) -> bool {
    subpath.is_empty()
        || rel == subpath
        || rel
            .strip_prefix(subpath)
            .is_some_and(|rest| rest.starts_with('/'))
}

impl Transport for MemoryTransport {
    fn upload_resource_commit(
        &self,
        commit: &CommitKey,
        work_dir: &Path,
        files: &[String],
        products_dir: Option<&Path>,
    ) -> Result<(), TransportError> {
        let mut work = Tree::new();
        for rel in files {
            let path = work_dir.join(rel);
            let data = fs::read(&path).map_err(io_err(&path))?;
            work.insert(rel.clone(), data);
        }
        let products = match products_dir {
            Some(dir) => read_products(dir)?,
            None => BTreeMap::new(),
        };

        let mut inner = self.lock();
        Self::check_fail(&mut inner, TransportOp::UploadCommit)?;
        // Content left behind by an earlier, unrecorded upload is replaced.
        inner
            .commits
            .insert(commit.clone(), StoredCommit { work, products });
        Ok(())
    }

    fn download_work(&self, commit: &CommitKey, destination: &Path) -> Result<(), TransportError> {
        let stored = {
            let mut inner = self.lock();
            Self::check_fail(&mut inner, TransportOp::DownloadWork)?;
            inner.downloads += 1;
            inner
                .commits
                .get(commit)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(commit.to_string()))?
        };
        write_tree(destination, stored.work.iter())
    }

    fn download_product(
        &self,
        product: &ProductKey,
        subpath: &str,
        destination: &Path,
    ) -> Result<(), TransportError> {
        let tree = {
            let mut inner = self.lock();
            Self::check_fail(&mut inner, TransportOp::DownloadProduct)?;
            inner.downloads += 1;
            inner
                .commits
                .get(&product.commit)
                .and_then(|c| c.products.get(product.product_type.as_str()))
                .cloned()
                .ok_or_else(|| TransportError::NotFound(product.to_string()))?
        };
        let selected: Vec<_> = tree
            .iter()
            .filter(|(rel, _)| under_subpath(rel, subpath))
            .collect();
        if !subpath.is_empty() && selected.is_empty() {
            return Err(TransportError::NotFound(format!("{product}/{subpath}")));
        }
        write_tree(destination, selected.into_iter())
    }

    fn download_resource(
        &self,
        resource: &ResourceKey,
        destination: &Path,
    ) -> Result<(), TransportError> {
        let commits: Vec<(u32, StoredCommit)> = {
            let mut inner = self.lock();
            Self::check_fail(&mut inner, TransportOp::DownloadResource)?;
            inner.downloads += 1;
            inner
                .commits
                .iter()
                .filter(|(k, _)| &k.resource == resource)
                .map(|(k, c)| (k.version, c.clone()))
                .collect()
        };
        fs::create_dir_all(destination).map_err(io_err(destination))?;
        for (version, stored) in commits {
            let version_dir = destination.join(version.to_string());
            write_tree(&version_dir.join(ARCHIVE_WORK_DIR), stored.work.iter())?;
            let products_dir = version_dir.join(ARCHIVE_PRODUCTS_DIR);
            fs::create_dir_all(&products_dir).map_err(io_err(&products_dir))?;
            for (name, tree) in &stored.products {
                write_tree(&products_dir.join(name), tree.iter())?;
            }
        }
        Ok(())
    }

    fn upload_resource(&self, resource: &ResourceKey, source: &Path) -> Result<(), TransportError> {
        let mut commits = Vec::new();
        for name in subdirectories(source)? {
            let Ok(version) = name.parse::<u32>() else {
                continue;
            };
            let version_dir = source.join(&name);
            commits.push((
                version,
                StoredCommit {
                    work: read_tree(&version_dir.join(ARCHIVE_WORK_DIR))?,
                    products: read_products(&version_dir.join(ARCHIVE_PRODUCTS_DIR))?,
                },
            ));
        }

        let mut inner = self.lock();
        Self::check_fail(&mut inner, TransportOp::UploadResource)?;
        for (version, stored) in commits {
            let key = CommitKey {
                resource: resource.clone(),
                version,
            };
            inner.commits.insert(key, stored);
        }
        Ok(())
    }

    fn remove_resource(&self, resource: &ResourceKey) -> Result<(), TransportError> {
        let mut inner = self.lock();
        Self::check_fail(&mut inner, TransportOp::RemoveResource)?;
        inner.commits.retain(|k, _| &k.resource != resource);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ProductType;
    use crate::core::uri::Uri;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn key(version: u32) -> CommitKey {
        CommitKey::new(&Uri::parse("anna-rig").unwrap(), version)
    }

    fn product(version: u32, name: &str) -> ProductKey {
        ProductKey {
            commit: key(version),
            product_type: ProductType::new(name).unwrap(),
        }
    }

    fn publish(transport: &MemoryTransport, temp: &TempDir, version: u32) {
        let work = temp.path().join(format!("work{version}"));
        let products = temp.path().join(format!("products{version}"));
        write(&work, "scene.ma", "scene");
        write(&work, "tex/skin.png", "png");
        write(&products, "skeleton/joints.json", "{}");
        write(&products, "skeleton/lod/low.json", "{}");
        fs::create_dir_all(products.join("cache")).unwrap();

        let files = vec!["scene.ma".to_string(), "tex/skin.png".to_string()];
        transport
            .upload_resource_commit(&key(version), &work, &files, Some(&products))
            .unwrap();
    }

    #[test]
    fn work_round_trip() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        publish(&transport, &temp, 1);

        let dest = temp.path().join("out");
        transport.download_work(&key(1), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("tex/skin.png")).unwrap(), "png");
        assert_eq!(transport.downloads(), 1);
    }

    #[test]
    fn upload_only_sends_listed_files() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        write(&work, "keep.txt", "k");
        write(&work, ".pulse/work.json", "{}");
        let transport = MemoryTransport::new();
        transport
            .upload_resource_commit(&key(1), &work, &["keep.txt".to_string()], None)
            .unwrap();
        assert_eq!(transport.work_files(&key(1)), vec!["keep.txt"]);
    }

    #[test]
    fn empty_products_survive() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        publish(&transport, &temp, 1);

        let dest = temp.path().join("cache");
        transport.download_product(&product(1, "cache"), "", &dest).unwrap();
        assert!(dest.is_dir());
    }

    #[test]
    fn product_subpath_selects_files() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        publish(&transport, &temp, 1);

        let dest = temp.path().join("skeleton");
        transport
            .download_product(&product(1, "skeleton"), "lod", &dest)
            .unwrap();
        assert!(dest.join("lod/low.json").is_file());
        assert!(!dest.join("joints.json").exists());

        let err = transport
            .download_product(&product(1, "skeleton"), "lo", &temp.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[test]
    fn missing_content_is_not_found() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.download_work(&key(7), temp.path()),
            Err(TransportError::NotFound(_))
        ));
        assert!(matches!(
            transport.download_product(&product(7, "geo"), "", temp.path()),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn resource_archive_moves_history() {
        let temp = TempDir::new().unwrap();
        let old = MemoryTransport::new();
        let new = MemoryTransport::new();
        publish(&old, &temp, 1);
        publish(&old, &temp, 2);

        let archive = temp.path().join("archive");
        let resource = key(1).resource;
        old.download_resource(&resource, &archive).unwrap();
        new.upload_resource(&resource, &archive).unwrap();
        old.remove_resource(&resource).unwrap();

        assert_eq!(new.versions(&resource), vec![1, 2]);
        assert!(old.versions(&resource).is_empty());

        let dest = temp.path().join("cache");
        new.download_product(&product(2, "cache"), "", &dest).unwrap();
        assert!(dest.is_dir());
    }

    #[test]
    fn armed_failure_fires_once() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.fail_next(
            TransportOp::UploadCommit,
            TransportError::Backend("offline".into()),
        );
        let work = temp.path().join("w");
        fs::create_dir_all(&work).unwrap();
        assert!(transport
            .upload_resource_commit(&key(1), &work, &[], None)
            .is_err());
        assert!(transport
            .upload_resource_commit(&key(1), &work, &[], None)
            .is_ok());
    }
}
