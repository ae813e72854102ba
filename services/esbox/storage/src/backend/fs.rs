//! Local-directory filesystem backend.
//!
//! Server paths are absolute (`/dir/file`) and are resolved below a fixed
//! root. Any path containing `..` is rejected before touching the disk.

use crate::{Filesystem, StorageError};
use esbox_wire::DirEntry;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Filesystem confined to a root directory
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    root: PathBuf,
}

impl LocalFilesystem {
    /// Create a filesystem rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::PathEscape(path.to_string()))
                }
            }
        }
        Ok(resolved)
    }
}

fn not_found(path: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(path.to_string())
    } else {
        StorageError::Io(err)
    }
}

impl Filesystem for LocalFilesystem {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| not_found(path, e))
    }

    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        debug!("Write {} bytes to {} (append={})", data.len(), path, append);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&full)
            .map_err(|e| not_found(path, e))?;
        file.write_all(data)?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let full = self.resolve(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&full).map_err(|e| not_found(path, e))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: (!meta.is_dir()).then(|| meta.len()),
                is_directory: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn make_dir(&self, path: &str, make_parents: bool) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        debug!("Make dir {} (parents={})", path, make_parents);
        let result = if make_parents {
            fs::create_dir_all(&full)
        } else {
            fs::create_dir(&full)
        };
        result.map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => StorageError::AlreadyExists(path.to_string()),
            _ => not_found(path, e),
        })
    }

    fn remove(&self, path: &str, recursive: bool, force: bool) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(StorageError::Invalid("refusing to remove root".to_string()));
        }
        debug!("Remove {} (recursive={}, force={})", path, recursive, force);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound && force => return Ok(()),
            Err(e) => return Err(not_found(path, e)),
        };
        let result = if !meta.is_dir() {
            fs::remove_file(&full)
        } else if recursive {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_dir(&full)
        };
        Ok(result?)
    }

    fn make_file(&self, path: &str, overwrite: bool, make_parents: bool) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if full.exists() && !overwrite {
            return Err(StorageError::AlreadyExists(path.to_string()));
        }
        if make_parents {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!("Make file {} (overwrite={})", path, overwrite);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| not_found(path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFilesystem) {
        let dir = TempDir::new().unwrap();
        let fs = LocalFilesystem::new(dir.path()).unwrap();
        (dir, fs)
    }

    #[test]
    fn test_write_read_append() {
        let (_dir, fs) = setup();
        fs.write_file("/notes.txt", b"hello", false).unwrap();
        fs.write_file("/notes.txt", b" world", true).unwrap();
        assert_eq!(fs.read_file("/notes.txt").unwrap(), b"hello world");

        fs.write_file("/notes.txt", b"reset", false).unwrap();
        assert_eq!(fs.read_file("notes.txt").unwrap(), b"reset");
    }

    #[test]
    fn test_missing_file() {
        let (_dir, fs) = setup();
        assert!(matches!(fs.read_file("/nope"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rejects_escape() {
        let (_dir, fs) = setup();
        assert!(matches!(
            fs.read_file("/../../etc/passwd"),
            Err(StorageError::PathEscape(_))
        ));
        assert!(matches!(
            fs.make_dir("/a/../../b", true),
            Err(StorageError::PathEscape(_))
        ));
    }

    #[test]
    fn test_dirs_and_listing() {
        let (_dir, fs) = setup();
        assert!(fs.make_dir("/a/b", false).is_err());
        fs.make_dir("/a/b", true).unwrap();
        fs.make_file("/a/data.bin", false, false).unwrap();
        fs.write_file("/a/data.bin", &[0u8; 12], false).unwrap();
        assert!(matches!(
            fs.make_file("/a/data.bin", false, false),
            Err(StorageError::AlreadyExists(_))
        ));
        fs.make_file("/x/y/z.txt", false, true).unwrap();

        let entries = fs.list_dir("/a").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "b".into(),
                    size: None,
                    is_directory: true,
                },
                DirEntry {
                    name: "data.bin".into(),
                    size: Some(12),
                    is_directory: false,
                },
            ]
        );
    }

    #[test]
    fn test_remove() {
        let (_dir, fs) = setup();
        fs.make_file("/d/f", false, true).unwrap();
        assert!(fs.remove("/d", false, false).is_err());
        fs.remove("/d", true, false).unwrap();
        assert!(matches!(fs.remove("/d", false, false), Err(StorageError::NotFound(_))));
        fs.remove("/d", false, true).unwrap();
        assert!(matches!(fs.remove("/", true, true), Err(StorageError::Invalid(_))));
    }
}
