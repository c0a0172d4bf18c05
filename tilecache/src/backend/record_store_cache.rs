//! Cache backend for platforms that only offer a record store.
//!
//! There is no quad-tree: every entry lives in one map keyed by tile id.
//! Entries are also grouped by page so that an update only rewrites the
//! index record of the pages it touched. The active page is built up in
//! RAM and written to the store when the ring moves on or the cache is
//! saved.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache_types::{CacheError, CacheResult, CacheStatistics, CacheStats, CacheStatus};
use crate::config::CacheConfig;
use crate::constants::{RECORD_HEADER_SIZE, RS_INDEX_PREFIX, RS_INFO_RECORD, RS_PAGE_PREFIX};
use crate::mem_cache::MemCache;
use crate::quad_tree::IndexEntry;
use crate::storage::codec::{
    decode_flat_index, encode_flat_index, flat_index_entry_len, CacheInfo, CacheRecord,
    FLAT_INDEX_HEADER_SIZE,
};
use crate::storage::RecordStore;
use crate::tile_cache::TileCacheProvider;
use crate::tile_key::{TileBuffer, TileKey};

use super::{build_record, record_buffers, Health};

fn page_record(page: u8) -> String {
    format!("{}{}", RS_PAGE_PREFIX, page)
}

fn index_record(page: u8) -> String {
    format!("{}{}", RS_INDEX_PREFIX, page)
}

/// The secondary cache backend.
pub struct RecordStoreCache {
    inner: Arc<RecordStoreCacheInner>,
}

struct RecordStoreCacheInner {
    config: CacheConfig,
    store: Arc<dyn RecordStore>,
    state: Mutex<RecordStoreState>,
    stats: CacheStatistics,
}

struct RecordStoreState {
    health: Health,
    active_page: u8,
    entries: HashMap<String, IndexEntry>,
    entries_per_page: Vec<u32>,
    /// Encoded size of each page's index record
    index_sizes: Vec<usize>,
    /// Pages whose index record must be rewritten
    dirty_indexes: Vec<bool>,
    /// Bytes of the active page, ahead of the store
    active_buffer: Vec<u8>,
    active_dirty: bool,
    /// Last non-active page read from the store
    read_cache: Option<(u8, Vec<u8>)>,
    mem_cache: MemCache,
}

impl RecordStoreState {
    fn reset(&mut self, number_of_pages: u8) {
        self.active_page = 0;
        self.entries.clear();
        self.entries_per_page = vec![0; number_of_pages as usize];
        self.index_sizes = vec![FLAT_INDEX_HEADER_SIZE; number_of_pages as usize];
        self.dirty_indexes = vec![false; number_of_pages as usize];
        self.active_buffer.clear();
        self.active_dirty = false;
        self.read_cache = None;
        self.mem_cache.clear();
    }

    fn insert_entry(&mut self, entry: IndexEntry) {
        let page = entry.page as u8 as usize;
        let entry_len = flat_index_entry_len(&entry.tile_id);
        if let Some(old) = self.entries.insert(entry.tile_id.clone(), entry) {
            self.forget(&old);
        }
        self.entries_per_page[page] += 1;
        self.index_sizes[page] += entry_len;
        self.dirty_indexes[page] = true;
    }

    fn remove_entry(&mut self, tile_id: &str) -> bool {
        match self.entries.remove(tile_id) {
            Some(old) => {
                self.forget(&old);
                true
            }
            None => false,
        }
    }

    fn forget(&mut self, old: &IndexEntry) {
        let page = old.page as u8 as usize;
        self.entries_per_page[page] = self.entries_per_page[page].saturating_sub(1);
        self.index_sizes[page] = self.index_sizes[page]
            .saturating_sub(flat_index_entry_len(&old.tile_id))
            .max(FLAT_INDEX_HEADER_SIZE);
        self.dirty_indexes[page] = true;
    }

    /// Size of the active page's index once `tile_id` points into it.
    fn active_index_size_with(&self, tile_id: &str) -> usize {
        let active = self.active_page;
        let current = self.index_sizes[active as usize];
        match self.entries.get(tile_id) {
            Some(e) if e.page as u8 == active => current,
            _ => current + flat_index_entry_len(tile_id),
        }
    }
}

impl RecordStoreCache {
    pub fn new(store: Arc<dyn RecordStore>, config: CacheConfig) -> Self {
        let pages = config.get_number_of_pages() as usize;
        let state = RecordStoreState {
            health: Health::new(),
            active_page: 0,
            entries: HashMap::new(),
            entries_per_page: vec![0; pages],
            index_sizes: vec![FLAT_INDEX_HEADER_SIZE; pages],
            dirty_indexes: vec![false; pages],
            active_buffer: Vec::new(),
            active_dirty: false,
            read_cache: None,
            mem_cache: MemCache::new(
                config.get_mem_cache_generations(),
                config.get_mem_cache_generation_size(),
            ),
        };
        RecordStoreCache {
            inner: Arc::new(RecordStoreCacheInner {
                config,
                store,
                state: Mutex::new(state),
                stats: CacheStatistics::new(),
            }),
        }
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.state.lock().health.status
    }

    /// Largest record this cache can hold: the smaller of the configured
    /// page size and the store's own limit.
    pub fn page_capacity(&self) -> u32 {
        self.inner.page_capacity()
    }

    /// Number of entries stored in each page.
    pub fn entries_per_page(&self) -> Vec<u32> {
        self.inner.state.lock().entries_per_page.clone()
    }
}

impl RecordStoreCacheInner {
    fn number_of_pages(&self) -> u8 {
        self.config.get_number_of_pages()
    }

    fn page_capacity(&self) -> u32 {
        self.config
            .get_max_page_size()
            .min(self.store.max_page_size())
    }

    fn register_error(&self, state: &mut RecordStoreState, error: &CacheError) {
        state.health.record(
            "Record store cache",
            self.config.get_max_errors(),
            &self.stats,
            error,
        );
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn load(&self, state: &mut RecordStoreState) -> CacheResult<()> {
        self.config.validate()?;
        if self.page_capacity() as usize <= RECORD_HEADER_SIZE {
            return Err(CacheError::InvalidOperation(format!(
                "record store pages of {} bytes cannot hold a record",
                self.page_capacity()
            )));
        }
        match self.load_persisted(state) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("No record store cache found, creating a new one");
                self.reboot(state)
            }
            Err(e) if e.is_corruption() || matches!(e, CacheError::VersionMismatch { .. }) => {
                log::warn!("Rebooting record store cache: {}", e);
                self.reboot(state)
            }
            Err(e) => Err(e),
        }
    }

    fn load_persisted(&self, state: &mut RecordStoreState) -> CacheResult<bool> {
        let Some(bytes) = self.store.read_record(RS_INFO_RECORD)? else {
            return Ok(false);
        };
        let info = CacheInfo::decode(&bytes)?;
        if info.version != self.config.get_version() {
            return Err(CacheError::VersionMismatch {
                found: info.version,
                expected: self.config.get_version(),
            });
        }
        let n = self.number_of_pages();
        if info.active_page >= n {
            return Err(CacheError::corrupt(format!(
                "active page {} of {} pages",
                info.active_page, n
            )));
        }

        state.reset(n);
        state.active_page = info.active_page;

        // oldest page first, so the newest copy of a tile wins
        for step in 1..=n {
            let page = (info.active_page + step) % n;
            let entries = match self.store.read_record(&index_record(page))? {
                Some(bytes) => match decode_flat_index(&bytes) {
                    Ok(entries) => entries,
                    Err(e) if e.is_corruption() => {
                        log::warn!("Dropping page {} with corrupt index: {}", page, e);
                        CacheStatistics::incr(&self.stats.corrupt_evictions);
                        self.store.delete_record(&index_record(page))?;
                        self.store.delete_record(&page_record(page))?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                None => continue,
            };
            for entry in entries {
                if entry.page as u8 == page {
                    state.insert_entry(entry);
                }
            }
        }
        // indexes as loaded are already on disk
        state.dirty_indexes.iter_mut().for_each(|d| *d = false);

        state.active_buffer = self
            .store
            .read_record(&page_record(state.active_page))?
            .unwrap_or_default();
        log::debug!(
            "Opened record store cache at page {} ({} entries)",
            state.active_page,
            state.entries.len()
        );
        Ok(true)
    }

    fn reboot(&self, state: &mut RecordStoreState) -> CacheResult<()> {
        for name in self.store.record_names()? {
            let ours = name == RS_INFO_RECORD
                || name.starts_with(RS_PAGE_PREFIX)
                || name.starts_with(RS_INDEX_PREFIX);
            if ours {
                self.store.delete_record(&name)?;
            }
        }
        state.reset(self.number_of_pages());
        self.write_info(state)?;
        log::debug!("Record store cache rebooted");
        Ok(())
    }

    fn write_info(&self, state: &RecordStoreState) -> CacheResult<()> {
        let info = CacheInfo {
            active_page: state.active_page,
            version: self.config.get_version(),
        };
        self.store.write_record(RS_INFO_RECORD, &info.encode()?)
    }

    fn write_index(&self, state: &mut RecordStoreState, page: u8) -> CacheResult<()> {
        let entries: Vec<&IndexEntry> = state
            .entries
            .values()
            .filter(|e| e.page as u8 == page)
            .collect();
        self.store
            .write_record(&index_record(page), &encode_flat_index(entries.into_iter())?)?;
        state.dirty_indexes[page as usize] = false;
        Ok(())
    }

    fn flush_active(&self, state: &mut RecordStoreState) -> CacheResult<()> {
        if state.active_dirty {
            self.store
                .write_record(&page_record(state.active_page), &state.active_buffer)?;
            state.active_dirty = false;
        }
        Ok(())
    }

    fn save(&self, state: &mut RecordStoreState) -> CacheResult<()> {
        self.flush_active(state)?;
        for page in 0..self.number_of_pages() {
            if state.dirty_indexes[page as usize] {
                self.write_index(state, page)?;
            }
        }
        self.write_info(state)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    fn read_record(
        &self,
        state: &mut RecordStoreState,
        entry: &IndexEntry,
        spatial: bool,
    ) -> CacheResult<CacheRecord> {
        let page = entry.page as u8;
        let max = self.config.get_max_record_size();
        if page == state.active_page {
            return CacheRecord::decode_at(&state.active_buffer, entry.offset as usize, spatial, max);
        }
        let cached = matches!(&state.read_cache, Some((p, _)) if *p == page);
        if !cached {
            let bytes = self
                .store
                .read_record(&page_record(page))?
                .ok_or_else(|| CacheError::corrupt(format!("page {} is missing", page)))?;
            state.read_cache = Some((page, bytes));
        }
        match &state.read_cache {
            Some((_, bytes)) => CacheRecord::decode_at(bytes, entry.offset as usize, spatial, max),
            None => Err(CacheError::corrupt(format!("page {} is missing", page))),
        }
    }

    fn rotate(&self, state: &mut RecordStoreState) -> CacheResult<()> {
        self.flush_active(state)?;
        let active = state.active_page;
        if state.dirty_indexes[active as usize] {
            self.write_index(state, active)?;
        }

        let next = (active + 1) % self.number_of_pages();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.page as u8 != next);
        let purged = before - state.entries.len();
        state.entries_per_page[next as usize] = 0;
        state.index_sizes[next as usize] = FLAT_INDEX_HEADER_SIZE;
        state.dirty_indexes[next as usize] = false;
        self.store.delete_record(&index_record(next))?;
        self.store.delete_record(&page_record(next))?;
        if matches!(&state.read_cache, Some((p, _)) if *p == next) {
            state.read_cache = None;
        }

        state.active_page = next;
        state.active_buffer.clear();
        self.write_info(state)?;

        CacheStatistics::incr(&self.stats.page_rotations);
        self.stats
            .stale_evictions
            .fetch_add(purged as u64, std::sync::atomic::Ordering::Relaxed);
        log::debug!("Rotated record store to page {}, purged {} entries", next, purged);
        Ok(())
    }

    fn write_tile(
        &self,
        state: &mut RecordStoreState,
        tile: &TileKey,
        buffers: &[TileBuffer],
        empty_importance_mask: u16,
    ) -> CacheResult<()> {
        let tile_id = tile.tile_id();
        let mut record = build_record(tile, buffers, empty_importance_mask)?;

        if let Some(existing) = state.entries.get(&tile_id).cloned() {
            match self.read_record(state, &existing, tile.is_spatial()) {
                Ok(older) => record = record.merged_with_older(older),
                Err(e) if e.is_corruption() => {
                    log::warn!("Evicting corrupt record of {}: {}", tile_id, e);
                    state.remove_entry(&tile_id);
                    CacheStatistics::incr(&self.stats.corrupt_evictions);
                }
                Err(e) => return Err(e),
            }
        }

        record.check_encodable()?;
        let body = record.body_len();
        if body > self.config.get_max_record_size() as usize {
            return Err(CacheError::Capacity {
                size: body,
                max: self.config.get_max_record_size() as usize,
            });
        }
        let size = RECORD_HEADER_SIZE + body;
        let capacity = self.page_capacity() as usize;
        if size > capacity {
            return Err(CacheError::Capacity {
                size,
                max: capacity,
            });
        }
        // the page's index record is bound by the same limit as the page
        let index_size = FLAT_INDEX_HEADER_SIZE + flat_index_entry_len(&tile_id);
        if index_size > capacity {
            return Err(CacheError::Capacity {
                size: index_size,
                max: capacity,
            });
        }
        if state.active_buffer.len() + size > capacity
            || state.active_index_size_with(&tile_id) > capacity
        {
            self.rotate(state)?;
        }

        let offset = state.active_buffer.len() as u32;
        record.encode_into(&mut state.active_buffer)?;
        state.active_dirty = true;
        let page = state.active_page as i8;
        state.insert_entry(IndexEntry::flat(page, offset, tile_id));

        for buffer in buffers {
            state
                .mem_cache
                .write_to_cache(buffer.key.param_string(), buffer.data.clone());
        }
        Ok(())
    }

    fn read_tile(
        &self,
        state: &mut RecordStoreState,
        key: &TileKey,
    ) -> CacheResult<Option<Vec<u8>>> {
        let tile_id = key.tile_id();
        let Some(entry) = state.entries.get(&tile_id).cloned() else {
            return Ok(None);
        };
        let record = match self.read_record(state, &entry, key.is_spatial()) {
            Ok(record) => record,
            Err(e) if e.is_corruption() => {
                log::warn!("Evicting corrupt record of {}: {}", tile_id, e);
                state.remove_entry(&tile_id);
                CacheStatistics::incr(&self.stats.corrupt_evictions);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let wanted = key.param_string();
        let mut found = None;
        for (param, data) in record_buffers(key, record) {
            if param == wanted {
                found = Some(data.clone());
            }
            state.mem_cache.write_to_cache(param, data);
        }
        Ok(found)
    }
}

impl TileCacheProvider for RecordStoreCache {
    fn open(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.health.is_open() {
            return true;
        }
        match inner.load(&mut state) {
            Ok(()) => {
                state.health.opened();
                true
            }
            Err(e) => {
                log::error!("Failed to open record store cache: {}", e);
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn close(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.health.is_open() {
            if let Err(e) = inner.save(&mut state) {
                log::warn!("Failed to save record store cache on close: {}", e);
            }
        }
        state.health.status = CacheStatus::Closed;
        state.reset(inner.number_of_pages());
        log::debug!("Record store cache closed");
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().health.is_open()
    }

    fn write_data_to_cache(
        &self,
        tile: &TileKey,
        buffers: &[TileBuffer],
        empty_importance_mask: u16,
    ) -> bool {
        if buffers.is_empty() {
            return false;
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        match inner.write_tile(&mut state, tile, buffers, empty_importance_mask) {
            Ok(()) => {
                CacheStatistics::incr(&inner.stats.writes);
                true
            }
            Err(CacheError::Capacity { size, max }) => {
                log::debug!("Not caching {}: {} bytes exceed {}", tile, size, max);
                CacheStatistics::incr(&inner.stats.rejected_writes);
                false
            }
            Err(e) => {
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn get_data_from_cache(&self, key: &TileKey) -> Option<Vec<u8>> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return None;
        }
        match inner.read_tile(&mut state, key) {
            Ok(Some(data)) => {
                CacheStatistics::incr(&inner.stats.hits);
                Some(data)
            }
            Ok(None) => {
                CacheStatistics::incr(&inner.stats.misses);
                None
            }
            Err(e) => {
                CacheStatistics::incr(&inner.stats.misses);
                inner.register_error(&mut state, &e);
                None
            }
        }
    }

    fn get_buffered_data(&self, key: &TileKey) -> Option<Vec<u8>> {
        let state = self.inner.state.lock();
        if !state.health.is_usable() {
            return None;
        }
        state
            .mem_cache
            .get_data_from_cache(&key.param_string())
            .map(|data| data.to_vec())
    }

    fn remove_from_cache(&self, key: &TileKey) -> bool {
        let mut state = self.inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        let tile_id = key.tile_id();
        state.mem_cache.remove_tile(key);
        state.remove_entry(&tile_id)
    }

    /// There is no spatial index to release.
    fn update_loaded_nodes(&self, _on_screen: &[TileKey]) {}

    fn set_visible(&self, _visible: bool) {}

    fn save_cache(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        match inner.save(&mut state) {
            Ok(()) => true,
            Err(e) => {
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn purge_data(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        state.mem_cache.clear();
        state.read_cache = None;
        match inner.save(&mut state) {
            Ok(()) => true,
            Err(e) => {
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn clear_cache(&self) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        match inner.reboot(&mut state) {
            Ok(()) => true,
            Err(e) => {
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        self.inner.stats.snapshot(0, state.entries.len() as u64)
    }
}

impl Drop for RecordStoreCache {
    fn drop(&mut self) {
        // Best effort save on drop
        let mut state = self.inner.state.lock();
        if state.health.is_open() {
            let _ = self.inner.save(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage, StorageRecordStore};
    use crate::tile_key::{TileMapType, TileParams};

    fn tile(i: i32) -> TileKey {
        TileKey::spatial(TileParams::new(0, 0, i, i))
    }

    fn buffer(key: &TileKey, importance: u8, data: Vec<u8>) -> TileBuffer {
        TileBuffer::new(key.with_importance(importance, TileMapType::Map), data)
    }

    fn open_cache(storage: &MemoryStorage, store_page: u32, config: CacheConfig) -> RecordStoreCache {
        let store = StorageRecordStore::new(Arc::new(storage.clone()), store_page);
        let cache = RecordStoreCache::new(Arc::new(store), config);
        assert!(cache.open());
        cache
    }

    /// One 20 byte record per call.
    fn write_small(cache: &RecordStoreCache, key: &TileKey) {
        assert!(cache.write_data_to_cache(key, &[buffer(key, 0, vec![3; 10])], 0));
    }

    #[test]
    fn test_active_page_reads_before_flush() {
        let storage = MemoryStorage::new();
        let cache = open_cache(&storage, 4096, CacheConfig::default());
        let key = tile(1);
        write_small(&cache, &key);
        assert_eq!(storage.read("rs_page_0").unwrap(), None);
        assert_eq!(cache.get_data_from_cache(&key), Some(vec![3; 10]));

        assert!(cache.save_cache());
        assert_eq!(storage.read("rs_page_0").unwrap().map(|p| p.len()), Some(20));
    }

    #[test]
    fn test_tiny_records_rotate_before_index_outgrows_page() {
        let storage = MemoryStorage::new();
        let cache = open_cache(&storage, 64, CacheConfig::default());
        let keys: Vec<TileKey> = (0..12).map(tile).collect();
        for key in &keys {
            assert!(cache.write_data_to_cache(key, &[buffer(key, 0, vec![9])], 0));
        }
        let stats = cache.stats();
        assert_eq!(stats.rejected_writes, 0);
        assert!(stats.page_rotations >= 2);
        assert!(cache.save_cache());
        for page in 0..10u8 {
            if let Some(index) = storage.read(&format!("rs_index_{}", page)).unwrap() {
                assert!(index.len() <= 64);
            }
        }
        drop(cache);

        let cache = open_cache(&storage, 64, CacheConfig::default());
        for key in &keys {
            assert_eq!(cache.get_data_from_cache(key), Some(vec![9]));
        }
    }

    #[test]
    fn test_tile_id_too_long_for_index_is_rejected() {
        // a 32 byte record, but a 33 byte index
        let cache = open_cache(&MemoryStorage::new(), 32, CacheConfig::default());
        let key = TileKey::named("overview-image-021.png");
        assert!(!cache.write_data_to_cache(&key, &[TileBuffer::new(key.clone(), vec![1])], 0));
        assert_eq!(cache.stats().rejected_writes, 1);
        assert_eq!(cache.stats().page_rotations, 0);
        assert!(cache.is_open());
    }

    #[test]
    fn test_capacity_is_store_page_size() {
        let cache = open_cache(&MemoryStorage::new(), 50, CacheConfig::default());
        assert_eq!(cache.page_capacity(), 50);
        let key = tile(1);
        assert!(!cache.write_data_to_cache(&key, &[buffer(&key, 0, vec![0; 45])], 0));
        assert!(cache.write_data_to_cache(&key, &[buffer(&key, 0, vec![0; 40])], 0));
        assert_eq!(cache.stats().rejected_writes, 1);
        assert!(cache.is_open());
    }

    #[test]
    fn test_merge_across_pages() {
        let storage = MemoryStorage::new();
        let cache = open_cache(&storage, 64, CacheConfig::default());
        let key = tile(1);
        assert!(cache.write_data_to_cache(&key, &[buffer(&key, 0, vec![1; 10])], 0));
        write_small(&cache, &tile(2));
        write_small(&cache, &tile(3));
        // rotates: the merged record lands on page 1
        assert!(cache.write_data_to_cache(&key, &[buffer(&key, 1, vec![2; 10])], 0));
        assert_eq!(cache.stats().page_rotations, 1);
        assert_eq!(cache.entries_per_page()[..2], [2, 1]);

        let first = key.with_importance(0, TileMapType::Map);
        let second = key.with_importance(1, TileMapType::Map);
        assert_eq!(cache.get_data_from_cache(&first), Some(vec![1; 10]));
        assert_eq!(cache.get_data_from_cache(&second), Some(vec![2; 10]));
        assert_eq!(cache.get_data_from_cache(&tile(2)), Some(vec![3; 10]));
    }

    #[test]
    fn test_rotation_purges_reused_page() {
        let config = CacheConfig::default().number_of_pages(3);
        let cache = open_cache(&MemoryStorage::new(), 64, config);
        let first = tile(0);
        write_small(&cache, &first);
        let mut i = 1;
        while cache.stats().page_rotations < 3 {
            write_small(&cache, &tile(i));
            i += 1;
        }
        assert_eq!(cache.get_data_from_cache(&first), None);
        assert!(cache.stats().stale_evictions >= 3);
        assert_eq!(cache.get_data_from_cache(&tile(i - 1)), Some(vec![3; 10]));
    }

    #[test]
    fn test_reopen_restores_index() {
        let storage = MemoryStorage::new();
        let keys: Vec<TileKey> = (0..7).map(tile).collect();
        {
            let cache = open_cache(&storage, 64, CacheConfig::default());
            for key in &keys {
                write_small(&cache, key);
            }
            let named = TileKey::named("legend");
            assert!(cache.write_data_to_cache(&named, &[TileBuffer::new(named.clone(), vec![9])], 0));
            assert!(cache.save_cache());
        }
        let cache = open_cache(&storage, 64, CacheConfig::default());
        for key in &keys {
            assert_eq!(cache.get_data_from_cache(key), Some(vec![3; 10]));
        }
        assert_eq!(cache.get_data_from_cache(&TileKey::named("legend")), Some(vec![9]));
        assert_eq!(cache.stats().index_entries, 8);
    }

    #[test]
    fn test_corrupt_page_index_drops_only_that_page() {
        let storage = MemoryStorage::new();
        {
            let cache = open_cache(&storage, 64, CacheConfig::default());
            for i in 0..6 {
                write_small(&cache, &tile(i));
            }
            assert!(cache.save_cache());
        }
        // tiles 0..3 on page 0, 3..6 on page 1
        storage.write("rs_index_0", &[0, 0, 0, 9, 1]).unwrap();

        let cache = open_cache(&storage, 64, CacheConfig::default());
        assert_eq!(cache.stats().corrupt_evictions, 1);
        assert_eq!(cache.get_data_from_cache(&tile(0)), None);
        assert_eq!(cache.get_data_from_cache(&tile(4)), Some(vec![3; 10]));
        assert_eq!(storage.read("rs_page_0").unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_is_evicted() {
        let storage = MemoryStorage::new();
        {
            let cache = open_cache(&storage, 4096, CacheConfig::default());
            write_small(&cache, &tile(1));
            write_small(&cache, &tile(2));
            assert!(cache.save_cache());
        }
        let mut page = storage.read("rs_page_0").unwrap().unwrap();
        page[0..4].copy_from_slice(&[0x7F, 0, 0, 0]);
        storage.write("rs_page_0", &page).unwrap();

        let cache = open_cache(&storage, 4096, CacheConfig::default());
        assert_eq!(cache.get_data_from_cache(&tile(1)), None);
        assert_eq!(cache.stats().corrupt_evictions, 1);
        assert_eq!(cache.get_data_from_cache(&tile(2)), Some(vec![3; 10]));
    }

    #[test]
    fn test_circuit_breaker() {
        let storage = MemoryStorage::new();
        let cache = open_cache(&storage, 64, CacheConfig::default());
        storage.set_failing(true);
        for _ in 0..3 {
            assert!(!cache.save_cache());
        }
        assert_eq!(cache.status(), CacheStatus::Disabled);

        let attempts = storage.io_count();
        let key = tile(1);
        assert!(!cache.write_data_to_cache(&key, &[buffer(&key, 0, vec![3; 10])], 0));
        assert_eq!(cache.get_data_from_cache(&key), None);
        assert_eq!(storage.io_count(), attempts);

        storage.set_failing(false);
        assert!(cache.open());
        write_small(&cache, &key);
        assert_eq!(cache.stats().io_errors, 3);
    }

    #[test]
    fn test_version_mismatch_reboots() {
        let storage = MemoryStorage::new();
        {
            let cache = open_cache(&storage, 64, CacheConfig::default());
            write_small(&cache, &tile(1));
        }
        let cache = open_cache(&storage, 64, CacheConfig::default().version(7));
        assert_eq!(cache.get_data_from_cache(&tile(1)), None);
        assert_eq!(cache.stats().index_entries, 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = open_cache(&MemoryStorage::new(), 64, CacheConfig::default());
        write_small(&cache, &tile(1));
        write_small(&cache, &tile(2));
        assert!(cache.remove_from_cache(&tile(1)));
        assert_eq!(cache.get_data_from_cache(&tile(1)), None);
        assert!(cache.clear_cache());
        assert_eq!(cache.get_data_from_cache(&tile(2)), None);
        assert_eq!(cache.entries_per_page().iter().sum::<u32>(), 0);
    }
}
