//! Append-only pages and the small index files of the FileCache layout.

use std::io;
use std::sync::Arc;

use crate::bounding_box::BoundingBox;
use crate::cache_types::{CacheError, CacheResult};
use crate::constants::{
    CACHE_INFO_FILE, FLAT_INDEX_FILE, NODE_FILE_PREFIX, PAGE_FILE_PREFIX, QUAD_TREE_FILE,
    RECORD_HEADER_SIZE,
};
use crate::quad_tree::persistence::{
    decode_boundaries, decode_node_entries, encode_boundaries, encode_node_entries,
};
use crate::quad_tree::IndexEntry;

use super::codec::{decode_flat_index, encode_flat_index, CacheInfo, CacheRecord, RecordHeader};
use super::Storage;

/// Circular set of append-only pages plus the cache metadata files, all
/// kept in one [`Storage`].
#[derive(Clone)]
pub struct PageStore {
    storage: Arc<dyn Storage>,
    number_of_pages: u8,
}

impl PageStore {
    pub fn new(storage: Arc<dyn Storage>, number_of_pages: u8) -> Self {
        PageStore {
            storage,
            number_of_pages,
        }
    }

    pub fn number_of_pages(&self) -> u8 {
        self.number_of_pages
    }

    fn page_name(page: u8) -> String {
        format!("{}{}", PAGE_FILE_PREFIX, page)
    }

    fn node_name(node: &str) -> String {
        format!("{}{}", NODE_FILE_PREFIX, node)
    }

    /// Makes sure page `page` exists and returns its current size, which is
    /// the write offset of the next record.
    pub fn open_page(&self, page: u8) -> CacheResult<u64> {
        let name = Self::page_name(page);
        match self.storage.len(&name)? {
            Some(len) => Ok(len),
            None => {
                self.storage.write(&name, &[])?;
                Ok(0)
            }
        }
    }

    /// Appends record bytes at `expected_offset`; fails if the page has a
    /// different size.
    pub fn append(&self, page: u8, expected_offset: u64, bytes: &[u8]) -> CacheResult<()> {
        self.storage
            .append(&Self::page_name(page), expected_offset, bytes)
    }

    /// Reads and decodes the record at `offset` of `page`.
    pub fn read_record(
        &self,
        page: u8,
        offset: u32,
        spatial: bool,
        max_record_size: u32,
    ) -> CacheResult<CacheRecord> {
        let name = Self::page_name(page);
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.read_page_bytes(&name, offset as u64, &mut header)?;
        let header = RecordHeader::parse(&header, max_record_size)?;
        let mut body = vec![0u8; header.total_size as usize];
        self.read_page_bytes(&name, offset as u64 + RECORD_HEADER_SIZE as u64, &mut body)?;
        CacheRecord::decode(header, &body, spatial)
    }

    fn read_page_bytes(&self, name: &str, offset: u64, buf: &mut [u8]) -> CacheResult<()> {
        match self.storage.read_at(name, offset, buf) {
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Err(
                CacheError::corrupt(format!("record references missing page {}", name)),
            ),
            other => other,
        }
    }

    /// Drops the bytes of a page so it can be reused.
    pub fn clear_page(&self, page: u8) -> CacheResult<()> {
        self.storage.write(&Self::page_name(page), &[])
    }

    pub fn read_info(&self) -> CacheResult<Option<CacheInfo>> {
        self.storage
            .read(CACHE_INFO_FILE)?
            .map(|bytes| CacheInfo::decode(&bytes))
            .transpose()
    }

    pub fn write_info(&self, info: &CacheInfo) -> CacheResult<()> {
        self.storage.write(CACHE_INFO_FILE, &info.encode()?)
    }

    pub fn read_flat_index(&self) -> CacheResult<Option<Vec<IndexEntry>>> {
        self.storage
            .read(FLAT_INDEX_FILE)?
            .map(|bytes| decode_flat_index(&bytes))
            .transpose()
    }

    pub fn write_flat_index<'a, I>(&self, entries: I) -> CacheResult<()>
    where
        I: ExactSizeIterator<Item = &'a IndexEntry>,
    {
        self.storage
            .write(FLAT_INDEX_FILE, &encode_flat_index(entries)?)
    }

    pub fn read_tree(&self) -> CacheResult<Option<Vec<(BoundingBox, String)>>> {
        self.storage
            .read(QUAD_TREE_FILE)?
            .map(|bytes| decode_boundaries(&bytes))
            .transpose()
    }

    pub fn write_tree(&self, boundaries: &[(BoundingBox, String)]) -> CacheResult<()> {
        self.storage
            .write(QUAD_TREE_FILE, &encode_boundaries(boundaries)?)
    }

    /// Entries of a quad-tree leaf. A leaf that was never saved has none.
    pub fn read_node(&self, node: &str) -> CacheResult<Vec<IndexEntry>> {
        match self.storage.read(&Self::node_name(node))? {
            Some(bytes) => decode_node_entries(&bytes),
            None => Ok(Vec::new()),
        }
    }

    pub fn write_node(&self, node: &str, entries: &[IndexEntry]) -> CacheResult<()> {
        self.storage
            .write(&Self::node_name(node), &encode_node_entries(entries)?)
    }

    pub fn delete_node(&self, node: &str) -> CacheResult<()> {
        self.storage.delete(&Self::node_name(node))
    }

    /// Deletes every file of the FileCache layout.
    pub fn wipe(&self) -> CacheResult<()> {
        for name in self.storage.list()? {
            let ours = name == CACHE_INFO_FILE
                || name == FLAT_INDEX_FILE
                || name == QUAD_TREE_FILE
                || name.starts_with(NODE_FILE_PREFIX)
                || name.starts_with(PAGE_FILE_PREFIX);
            if ours {
                self.storage.delete(&name)?;
            }
        }
        log::debug!("Wiped page store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::SubRecord;
    use crate::storage::{DiskStorage, MemoryStorage};
    use crate::tile_key::TileMapType;
    use tempfile::tempdir;

    fn record(byte: u8) -> CacheRecord {
        CacheRecord::Spatial {
            empty_importance_mask: 0,
            parts: vec![SubRecord::new(0, TileMapType::Map, vec![byte; 10])],
        }
    }

    #[test]
    fn test_append_and_read_records() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(DiskStorage::open(dir.path()).unwrap());
        let store = PageStore::new(storage, 10);

        assert_eq!(store.open_page(3).unwrap(), 0);
        let mut bytes = Vec::new();
        record(1).encode_into(&mut bytes).unwrap();
        let second = bytes.len() as u64;
        record(2).encode_into(&mut bytes).unwrap();
        store.append(3, 0, &bytes).unwrap();
        assert_eq!(store.open_page(3).unwrap(), bytes.len() as u64);

        assert_eq!(store.read_record(3, 0, true, 1000).unwrap(), record(1));
        assert_eq!(
            store.read_record(3, second as u32, true, 1000).unwrap(),
            record(2)
        );
        assert!(store.append(3, 0, &bytes).unwrap_err().is_io_failure());

        store.clear_page(3).unwrap();
        assert_eq!(store.open_page(3).unwrap(), 0);
        assert!(store.read_record(3, 0, true, 1000).unwrap_err().is_corruption());
    }

    #[test]
    fn test_missing_page_is_corruption() {
        let store = PageStore::new(Arc::new(MemoryStorage::new()), 10);
        assert!(store.read_record(5, 0, true, 1000).unwrap_err().is_corruption());
    }

    #[test]
    fn test_metadata_files() {
        let storage = MemoryStorage::new();
        let store = PageStore::new(Arc::new(storage.clone()), 10);
        assert_eq!(store.read_info().unwrap(), None);
        assert_eq!(store.read_flat_index().unwrap(), None);
        assert_eq!(store.read_tree().unwrap(), None);
        assert!(store.read_node("r").unwrap().is_empty());

        let info = CacheInfo {
            active_page: 4,
            version: 3,
        };
        store.write_info(&info).unwrap();
        assert_eq!(store.read_info().unwrap(), Some(info));

        let flat = vec![IndexEntry::flat(2, 10, "img")];
        store.write_flat_index(flat.iter()).unwrap();
        assert_eq!(store.read_flat_index().unwrap(), Some(flat));

        let tree = vec![(BoundingBox::world(), "r".to_string())];
        store.write_tree(&tree).unwrap();
        assert_eq!(store.read_tree().unwrap(), Some(tree));

        let entries = vec![IndexEntry::new(1, 0, "T", 5, 5)];
        store.write_node("r", &entries).unwrap();
        assert_eq!(store.read_node("r").unwrap(), entries);
        store.delete_node("r").unwrap();
        assert!(store.read_node("r").unwrap().is_empty());
    }

    #[test]
    fn test_wipe_keeps_foreign_files() {
        let storage = MemoryStorage::new();
        let store = PageStore::new(Arc::new(storage.clone()), 10);
        store.open_page(0).unwrap();
        store.write_node("r0", &[]).unwrap();
        store
            .write_info(&CacheInfo {
                active_page: 0,
                version: 3,
            })
            .unwrap();
        storage.write("favorites", b"keep").unwrap();

        store.wipe().unwrap();
        assert_eq!(storage.file_names(), vec!["favorites".to_string()]);
    }
}
