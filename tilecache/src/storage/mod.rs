//! Persistence layer of the cache: named byte files.
//!
//! Everything the cache stores goes through [`Storage`]. [`DiskStorage`]
//! maps names to files inside one directory; [`MemoryStorage`] keeps them
//! in RAM and can simulate a failing device.

pub mod codec;
pub mod page_store;
pub mod record_store;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache_types::{CacheError, CacheResult};

pub use page_store::PageStore;
pub use record_store::{RecordStore, StorageRecordStore};

/// A flat namespace of byte files.
pub trait Storage: Send + Sync {
    /// Whole content of a file, `None` if it does not exist.
    fn read(&self, name: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Fills `buf` from `offset`. Reading past the end is corruption.
    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> CacheResult<()>;

    /// Replaces the content of a file, creating it if needed.
    fn write(&self, name: &str, data: &[u8]) -> CacheResult<()>;

    /// Appends to a file whose current length must be `expected_len`.
    fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> CacheResult<()>;

    /// Length of a file, `None` if it does not exist.
    fn len(&self, name: &str) -> CacheResult<Option<u64>>;

    /// Removes a file; removing a missing file is not an error.
    fn delete(&self, name: &str) -> CacheResult<()>;

    /// Names of all files.
    fn list(&self) -> CacheResult<Vec<String>>;
}

fn length_mismatch(name: &str, expected: u64, actual: u64) -> CacheError {
    CacheError::Io(io::Error::other(format!(
        "{} has {} bytes, expected {}",
        name, actual, expected
    )))
}

// ============================================================================
// Disk
// ============================================================================

/// Files inside a single directory.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    /// Uses `root` as the cache directory, creating it if necessary.
    pub fn open(root: impl AsRef<Path>) -> CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(DiskStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> CacheResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(CacheError::InvalidOperation(format!(
                "invalid file name {:?}",
                name
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Storage for DiskStorage {
    fn read(&self, name: &str) -> CacheResult<Option<Vec<u8>>> {
        match fs::read(self.path(name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> CacheResult<()> {
        let mut file = File::open(self.path(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, name: &str, data: &[u8]) -> CacheResult<()> {
        fs::write(self.path(name)?, data)?;
        Ok(())
    }

    fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> CacheResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name)?)?;
        let actual = file.metadata()?.len();
        if actual != expected_len {
            return Err(length_mismatch(name, expected_len, actual));
        }
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self, name: &str) -> CacheResult<Option<u64>> {
        match fs::metadata(self.path(name)?) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, name: &str) -> CacheResult<()> {
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> CacheResult<Vec<String>> {
        let mut names = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if dir_entry.file_type()?.is_file() {
                if let Some(name) = dir_entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-memory files. Clones share the same files, so a cache can be
/// "reopened" on the same storage from a fresh instance.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<MemoryStorageInner>,
}

#[derive(Default)]
struct MemoryStorageInner {
    files: RwLock<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
    io_count: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of operations attempted so far, failed ones included.
    pub fn io_count(&self) -> u64 {
        self.inner.io_count.load(Ordering::SeqCst)
    }

    pub fn file_names(&self) -> Vec<String> {
        self.inner.files.read().keys().cloned().collect()
    }

    fn begin(&self) -> CacheResult<()> {
        self.inner.io_count.fetch_add(1, Ordering::SeqCst);
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Io(io::Error::other("storage unavailable")));
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn read(&self, name: &str) -> CacheResult<Option<Vec<u8>>> {
        self.begin()?;
        Ok(self.inner.files.read().get(name).cloned())
    }

    fn read_at(&self, name: &str, offset: u64, buf: &mut [u8]) -> CacheResult<()> {
        self.begin()?;
        let files = self.inner.files.read();
        let data = files.get(name).ok_or_else(|| {
            CacheError::Io(io::Error::new(io::ErrorKind::NotFound, name.to_string()))
        })?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start.saturating_add(buf.len());
        if end > data.len() {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("read of {}..{} past end of {}", start, end, name),
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, name: &str, data: &[u8]) -> CacheResult<()> {
        self.begin()?;
        self.inner
            .files
            .write()
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> CacheResult<()> {
        self.begin()?;
        let mut files = self.inner.files.write();
        let file = files.entry(name.to_string()).or_default();
        if file.len() as u64 != expected_len {
            return Err(length_mismatch(name, expected_len, file.len() as u64));
        }
        file.extend_from_slice(data);
        Ok(())
    }

    fn len(&self, name: &str) -> CacheResult<Option<u64>> {
        self.begin()?;
        Ok(self.inner.files.read().get(name).map(|f| f.len() as u64))
    }

    fn delete(&self, name: &str) -> CacheResult<()> {
        self.begin()?;
        self.inner.files.write().remove(name);
        Ok(())
    }

    fn list(&self) -> CacheResult<Vec<String>> {
        self.begin()?;
        Ok(self.file_names())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(storage: &dyn Storage) {
        assert_eq!(storage.read("a").unwrap(), None);
        assert_eq!(storage.len("a").unwrap(), None);

        storage.append("a", 0, b"hello").unwrap();
        storage.append("a", 5, b" world").unwrap();
        assert_eq!(storage.len("a").unwrap(), Some(11));

        let mut buf = [0u8; 5];
        storage.read_at("a", 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let err = storage.append("a", 3, b"x").unwrap_err();
        assert!(err.is_io_failure());

        let mut too_long = [0u8; 4];
        let err = storage.read_at("a", 9, &mut too_long).unwrap_err();
        assert!(err.is_corruption());

        storage.write("a", b"new").unwrap();
        assert_eq!(storage.read("a").unwrap(), Some(b"new".to_vec()));
        storage.write("b", b"").unwrap();

        let mut names = storage.list().unwrap();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        storage.delete("a").unwrap();
        storage.delete("a").unwrap();
        assert_eq!(storage.read("a").unwrap(), None);
    }

    #[test]
    fn test_disk_storage() {
        let dir = tempdir().unwrap();
        let storage = DiskStorage::open(dir.path().join("cache")).unwrap();
        exercise(&storage);
        assert!(storage.write("../escape", b"x").is_err());
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_memory_storage_is_shared_between_clones() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.write("x", b"1").unwrap();
        assert_eq!(other.read("x").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_failure_injection_counts_attempts() {
        let storage = MemoryStorage::new();
        storage.write("x", b"1").unwrap();
        storage.set_failing(true);
        let before = storage.io_count();
        let err = storage.read("x").unwrap_err();
        assert!(err.is_io_failure());
        assert_eq!(storage.io_count(), before + 1);
        storage.set_failing(false);
        assert_eq!(storage.read("x").unwrap(), Some(b"1".to_vec()));
    }
}
