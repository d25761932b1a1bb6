//! core::fsutil
//!
//! Filesystem helpers for the local cache.
//!
//! All errors carry the path they failed on. Manifests only contain
//! regular files; symlinks (input links) and directories are skipped.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use super::types::{Fingerprint, FileManifest};

/// Errors from local filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("'{path}' is in use by another process")]
    Busy { path: PathBuf },
}

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> FsError + '_ {
    move |source| FsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write data to a file atomically using temp-file-then-rename.
///
/// Parent directories are created as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
        file.write_all(data).map_err(io_err(&tmp))?;
        file.sync_all().map_err(io_err(&tmp))?;
    }
    fs::rename(&tmp, path).map_err(io_err(path))
}

/// Relative, `/`-separated paths of every regular file under `root`.
///
/// Top-level entries named in `exclude` are skipped entirely.
pub fn list_files(root: &Path, exclude: &[&str]) -> Result<Vec<String>, FsError> {
    walk_files(root, exclude, None)
}

fn walk_files(
    root: &Path,
    exclude: &[&str],
    nested_marker: Option<&Path>,
) -> Result<Vec<String>, FsError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        if e.depth() == 1 && exclude.iter().any(|x| e.file_name() == *x) {
            return false;
        }
        match nested_marker {
            Some(marker) if e.file_type().is_dir() => !e.path().join(marker).is_file(),
            _ => true,
        }
    }) {
        let entry = entry.map_err(|e| FsError::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(relative_key(rel));
        }
    }
    files.sort();
    Ok(files)
}

/// Fingerprint every regular file under `root`.
///
/// Subdirectories holding `nested_marker` belong to another tree and are
/// left out.
pub fn scan_manifest(
    root: &Path,
    exclude: &[&str],
    nested_marker: Option<&Path>,
) -> Result<FileManifest, FsError> {
    let mut manifest = FileManifest::new();
    for rel in walk_files(root, exclude, nested_marker)? {
        let path = root.join(&rel);
        let data = fs::read(&path).map_err(io_err(&path))?;
        manifest.insert(rel, Fingerprint::of_bytes(&data));
    }
    Ok(manifest)
}

fn relative_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), FsError> {
    fs::create_dir_all(dst).map_err(io_err(dst))?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| FsError::Io {
            path: e.path().unwrap_or(src).to_path_buf(),
            source: e.into(),
        })?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err(&target))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(io_err(&target))?;
            set_file_writable(&target)?;
        }
    }
    Ok(())
}

fn set_file_writable(path: &Path) -> Result<(), FsError> {
    let mut perms = fs::metadata(path).map_err(io_err(path))?.permissions();
    if perms.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        fs::set_permissions(path, perms).map_err(io_err(path))?;
    }
    Ok(())
}

/// Mark every file under `root` read-only (or writable again).
pub fn set_read_only(root: &Path, read_only: bool) -> Result<(), FsError> {
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| FsError::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let mut perms = fs::metadata(path).map_err(io_err(path))?.permissions();
        if perms.readonly() != read_only {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(read_only);
            fs::set_permissions(path, perms).map_err(io_err(path))?;
        }
    }
    Ok(())
}

/// Delete a directory tree, including read-only files.
pub fn remove_tree(path: &Path) -> Result<(), FsError> {
    if !path.exists() {
        return Ok(());
    }
    set_read_only(path, false)?;
    fs::remove_dir_all(path).map_err(io_err(path))
}

/// Move a directory tree, falling back to copy + delete across devices.
pub fn move_tree(src: &Path, dst: &Path) -> Result<(), FsError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    copy_tree(src, dst)?;
    remove_tree(src)
}

/// Fail with `FsError::Busy` if `path` cannot be renamed in place.
///
/// On platforms that refuse to rename directories holding open handles
/// this detects applications still using the directory.
pub fn ensure_not_busy(path: &Path) -> Result<(), FsError> {
    if !path.exists() {
        return Ok(());
    }
    let mut probe = path.as_os_str().to_owned();
    probe.push(".pulse-probe");
    let probe = PathBuf::from(probe);
    if fs::rename(path, &probe).is_err() {
        return Err(FsError::Busy {
            path: path.to_path_buf(),
        });
    }
    fs::rename(&probe, path).map_err(io_err(path))
}

/// Remove empty directories from `start` upwards, stopping at `stop_at`.
///
/// `stop_at` itself is never removed.
pub fn prune_empty_parents(start: &Path, stop_at: &Path) {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        let is_empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    #[test]
    fn list_files_skips_excluded_top_level() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        write(temp.path(), "sub/b.txt", "b");
        write(temp.path(), ".pulse/work.json", "{}");
        write(temp.path(), "sub/.pulse/kept.txt", "c");

        let files = list_files(temp.path(), &[".pulse"]).unwrap();
        assert_eq!(files, vec!["a.txt", "sub/.pulse/kept.txt", "sub/b.txt"]);
    }

    #[test]
    fn list_files_of_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(list_files(&temp.path().join("nope"), &[]).unwrap().is_empty());
    }

    #[test]
    fn scan_manifest_detects_content_change() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "one");
        let before = scan_manifest(temp.path(), &[], None).unwrap();
        write(temp.path(), "a.txt", "two");
        let after = scan_manifest(temp.path(), &[], None).unwrap();
        assert_ne!(before.get("a.txt"), after.get("a.txt"));
    }

    #[test]
    fn scan_manifest_skips_marked_subtrees() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        write(temp.path(), "deep/inner/.pulse/work.json", "{}");
        write(temp.path(), "deep/inner/rig.ma", "r");
        write(temp.path(), "deep/other.txt", "o");

        let marker = Path::new(".pulse/work.json");
        let manifest = scan_manifest(temp.path(), &[".pulse"], Some(marker)).unwrap();
        let paths: Vec<&str> = manifest.paths().collect();
        assert_eq!(paths, vec!["a.txt", "deep/other.txt"]);

        let all = scan_manifest(temp.path(), &[".pulse"], None).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn copy_and_remove_read_only_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src, "x/y.txt", "y");

        copy_tree(&src, &dst).unwrap();
        set_read_only(&dst, true).unwrap();
        assert!(fs::metadata(dst.join("x/y.txt")).unwrap().permissions().readonly());

        remove_tree(&dst).unwrap();
        assert!(!dst.exists());
    }

    #[test]
    fn prune_stops_at_root_and_non_empty() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        write(root, "a/keep.txt", "k");

        prune_empty_parents(&root.join("a/b/c"), root);
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
    }

    #[test]
    fn idle_directory_is_not_busy() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work");
        fs::create_dir_all(&dir).unwrap();
        ensure_not_busy(&dir).unwrap();
        assert!(dir.exists());
    }

    #[test]
    fn atomic_write_creates_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("deep/dir/file.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "{}");
    }
}
