//! Record-store persistence: named blobs of bounded size, for platforms
//! that cannot seek inside files.

use std::sync::Arc;

use crate::cache_types::{CacheError, CacheResult};

use super::Storage;

/// A store of whole records that reports its own size limit.
pub trait RecordStore: Send + Sync {
    /// Largest record the store accepts.
    fn max_page_size(&self) -> u32;

    fn read_record(&self, name: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Replaces a record. Fails with [`CacheError::Capacity`] if `data` is
    /// larger than [`RecordStore::max_page_size`].
    fn write_record(&self, name: &str, data: &[u8]) -> CacheResult<()>;

    fn delete_record(&self, name: &str) -> CacheResult<()>;

    fn record_names(&self) -> CacheResult<Vec<String>>;
}

/// A [`RecordStore`] over any [`Storage`].
#[derive(Clone)]
pub struct StorageRecordStore {
    storage: Arc<dyn Storage>,
    max_page_size: u32,
}

impl StorageRecordStore {
    pub fn new(storage: Arc<dyn Storage>, max_page_size: u32) -> Self {
        StorageRecordStore {
            storage,
            max_page_size,
        }
    }
}

impl RecordStore for StorageRecordStore {
    fn max_page_size(&self) -> u32 {
        self.max_page_size
    }

    fn read_record(&self, name: &str) -> CacheResult<Option<Vec<u8>>> {
        self.storage.read(name)
    }

    fn write_record(&self, name: &str, data: &[u8]) -> CacheResult<()> {
        if data.len() > self.max_page_size as usize {
            return Err(CacheError::Capacity {
                size: data.len(),
                max: self.max_page_size as usize,
            });
        }
        self.storage.write(name, data)
    }

    fn delete_record(&self, name: &str) -> CacheResult<()> {
        self.storage.delete(name)
    }

    fn record_names(&self) -> CacheResult<Vec<String>> {
        self.storage.list()
    }
}
