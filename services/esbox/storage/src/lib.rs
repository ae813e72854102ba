//! Stream database and filesystem collaborators for the ESBox API.
//!
//! The protocol engine never touches storage directly; it calls into the
//! [`StreamDatabase`] for telemetry cells and into the [`Filesystem`] for the
//! file pass-through operations. Both are synchronous: every call is a short
//! in-process operation and the session is driven by one logical worker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use esbox_wire::{DirEntry, TelemetryCell};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// FIFO index outside `0..FIFO_COUNT`
    #[error("Invalid FIFO index: {0}")]
    InvalidFifo(u8),
    /// Path does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Path already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    /// Path escapes the filesystem root
    #[error("Path escapes root: {0}")]
    PathEscape(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Result code reported to the server, errno style
    pub fn code(&self) -> i64 {
        match self {
            StorageError::Io(e) => e.raw_os_error().map(i64::from).unwrap_or(-1),
            StorageError::NotFound(_) => 2,
            StorageError::PathEscape(_) => 13,
            StorageError::AlreadyExists(_) => 17,
            StorageError::InvalidFifo(_) | StorageError::Invalid(_) => 22,
            StorageError::Serialization(_) => -1,
        }
    }
}

/// Source of logged telemetry cells
pub trait StreamDatabase: Send + Sync {
    /// Read up to `max_cells` cells from a FIFO in write order, advancing its
    /// read cursor past them
    fn get_telemetry_batch(&self, fifo: u8, max_cells: usize) -> Result<Vec<TelemetryCell>, StorageError>;

    /// Most recent readings, in an unspecified layout passed through to the server
    fn latest_readings(&self) -> Result<Value, StorageError>;
}

/// File access for the filesystem pass-through messages
pub trait Filesystem: Send + Sync {
    /// Read a whole file
    fn read_file(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Write or append bytes to a file, creating it if needed
    fn write_file(&self, path: &str, data: &[u8], append: bool) -> Result<(), StorageError>;

    /// List a directory, sorted by name
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError>;

    /// Create a directory
    fn make_dir(&self, path: &str, make_parents: bool) -> Result<(), StorageError>;

    /// Remove a file or directory
    fn remove(&self, path: &str, recursive: bool, force: bool) -> Result<(), StorageError>;

    /// Create an empty file
    fn make_file(&self, path: &str, overwrite: bool, make_parents: bool) -> Result<(), StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Cells kept by the in-memory stream database before the oldest is evicted
    pub fifo_capacity: usize,
    /// Root directory for the filesystem pass-through
    pub files_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fifo_capacity: backend::mem::DEFAULT_CAPACITY,
            files_root: PathBuf::from("./esbox-files"),
        }
    }
}

// Re-export backend implementations
pub use backend::fs::LocalFilesystem;
pub use backend::mem::MemoryStreamDb;

/// Combined storage handles
#[derive(Clone)]
pub struct Storage {
    /// Telemetry source
    pub streams: Arc<MemoryStreamDb>,
    /// File access
    pub files: Arc<LocalFilesystem>,
}

impl Storage {
    /// Create storage from configuration
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        Ok(Storage {
            streams: Arc::new(MemoryStreamDb::with_capacity(config.fifo_capacity)),
            files: Arc::new(LocalFilesystem::new(&config.files_root)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(StorageError::NotFound("x".into()).code(), 2);
        assert_eq!(StorageError::InvalidFifo(9).code(), 22);
        let io = std::io::Error::from_raw_os_error(28);
        assert_eq!(StorageError::from(io).code(), 28);
    }

    #[test]
    fn test_storage_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            fifo_capacity: 8,
            files_root: dir.path().join("files"),
        };
        let storage = Storage::from_config(&config).unwrap();
        assert_eq!(storage.streams.capacity(), 8);
        assert!(dir.path().join("files").is_dir());
    }
}
