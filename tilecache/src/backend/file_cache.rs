//! Page-file cache backend with a disk-backed quad-tree index.
//!
//! Records are appended to the active page. Spatial tiles are indexed in a
//! [`QuadTree`] whose leaves are loaded from per-node files on demand;
//! overview tiles and named blobs live in a flat map. When the active page
//! is full the next page in the ring is cleared and becomes active, which
//! implicitly evicts everything that was stored in it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache_types::{CacheError, CacheResult, CacheStatistics, CacheStats, CacheStatus};
use crate::config::CacheConfig;
use crate::constants::RECORD_HEADER_SIZE;
use crate::mem_cache::MemCache;
use crate::quad_tree::{is_stale, IndexEntry, NodeId, QuadTree};
use crate::storage::codec::CacheInfo;
use crate::storage::{DiskStorage, PageStore, Storage};
use crate::tile_cache::TileCacheProvider;
use crate::tile_key::{LayerFormat, TileBuffer, TileKey};

use super::{build_record, record_buffers, Health};

/// Where the index entry of a tile lives.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Tree { lat: i32, lon: i32 },
    Flat,
}

/// The primary cache backend.
///
/// All state sits behind one mutex, so operations never interleave. Only
/// the visibility flag is written without it.
pub struct FileCache {
    inner: Arc<FileCacheInner>,
}

struct FileCacheInner {
    config: CacheConfig,
    layer_format: Arc<dyn LayerFormat>,
    store: PageStore,
    state: Mutex<FileCacheState>,
    visible: AtomicBool,
    stats: CacheStatistics,
}

struct FileCacheState {
    health: Health,
    /// Absolute page counter, `0..generation_limit`
    generation: i32,
    current_offset: u64,
    tree: QuadTree,
    flat_index: HashMap<String, IndexEntry>,
    flat_dirty: bool,
    mem_cache: MemCache,
    /// Leaves no on-screen tile needed on the last pass
    recently_used: HashSet<NodeId>,
    /// Reused encoding buffer
    scratch: Vec<u8>,
}

impl FileCache {
    /// Creates a closed cache over `storage`. Call [`TileCacheProvider::open`]
    /// before use.
    pub fn new(
        storage: Arc<dyn Storage>,
        layer_format: Arc<dyn LayerFormat>,
        config: CacheConfig,
    ) -> Self {
        let state = FileCacheState {
            health: Health::new(),
            generation: 0,
            current_offset: 0,
            tree: QuadTree::new(config.get_max_items_per_node()),
            flat_index: HashMap::new(),
            flat_dirty: false,
            mem_cache: MemCache::new(
                config.get_mem_cache_generations(),
                config.get_mem_cache_generation_size(),
            ),
            recently_used: HashSet::new(),
            scratch: Vec::new(),
        };
        FileCache {
            inner: Arc::new(FileCacheInner {
                store: PageStore::new(storage, config.get_number_of_pages()),
                config,
                layer_format,
                state: Mutex::new(state),
                visible: AtomicBool::new(true),
                stats: CacheStatistics::new(),
            }),
        }
    }

    /// Creates a closed cache whose files live in `dir`.
    pub fn on_disk(
        dir: impl AsRef<Path>,
        layer_format: Arc<dyn LayerFormat>,
        config: CacheConfig,
    ) -> CacheResult<Self> {
        let storage = DiskStorage::open(dir)?;
        Ok(Self::new(Arc::new(storage), layer_format, config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.state.lock().health.status
    }
}

impl FileCacheInner {
    fn number_of_pages(&self) -> u8 {
        self.config.get_number_of_pages()
    }

    fn page_of(&self, generation: i32) -> u8 {
        generation.rem_euclid(self.number_of_pages() as i32) as u8
    }

    fn slot(&self, key: &TileKey) -> Option<Slot> {
        match key.params() {
            Some(params) if key.is_quad_tree_indexed() => {
                let (lat, lon) = params.coordinates(self.layer_format.as_ref())?;
                Some(Slot::Tree { lat, lon })
            }
            _ => Some(Slot::Flat),
        }
    }

    fn require_slot(&self, key: &TileKey) -> CacheResult<Slot> {
        self.slot(key).ok_or_else(|| {
            CacheError::InvalidOperation(format!("tile {} has no map position", key))
        })
    }

    // ------------------------------------------------------------------
    // Error accounting
    // ------------------------------------------------------------------

    fn register_error(&self, state: &mut FileCacheState, error: &CacheError) {
        state
            .health
            .record("File cache", self.config.get_max_errors(), &self.stats, error);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn load(&self, state: &mut FileCacheState) -> CacheResult<()> {
        self.config.validate()?;
        match self.load_persisted(state) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("No file cache found, creating a new one");
                self.reboot(state)
            }
            Err(e) if e.is_corruption() || matches!(e, CacheError::VersionMismatch { .. }) => {
                log::warn!("Rebooting file cache: {}", e);
                self.reboot(state)
            }
            Err(e) => Err(e),
        }
    }

    /// Loads persisted state; `false` when there is none.
    fn load_persisted(&self, state: &mut FileCacheState) -> CacheResult<bool> {
        let Some(info) = self.store.read_info()? else {
            return Ok(false);
        };
        if info.version != self.config.get_version() {
            return Err(CacheError::VersionMismatch {
                found: info.version,
                expected: self.config.get_version(),
            });
        }
        let generation = info.active_page as i32;
        if generation >= self.config.generation_limit() {
            return Err(CacheError::corrupt(format!(
                "active page {} beyond generation limit",
                generation
            )));
        }

        let boundaries = self
            .store
            .read_tree()?
            .ok_or_else(|| CacheError::corrupt("quad-tree structure missing"))?;
        let tree = QuadTree::from_boundaries(boundaries, self.config.get_max_items_per_node())?;
        let flat_index = self
            .store
            .read_flat_index()?
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.tile_id.clone(), e))
            .collect();
        let current_offset = self.store.open_page(self.page_of(generation))?;

        state.generation = generation;
        state.current_offset = current_offset;
        state.tree = tree;
        state.flat_index = flat_index;
        state.flat_dirty = false;
        state.mem_cache.clear();
        state.recently_used.clear();
        log::debug!(
            "Opened file cache at generation {} offset {} ({} quad-tree nodes)",
            generation,
            current_offset,
            state.tree.node_count()
        );
        Ok(true)
    }

    /// Deletes every persisted file and starts over at page 0.
    fn reboot(&self, state: &mut FileCacheState) -> CacheResult<()> {
        self.store.wipe()?;
        state.generation = 0;
        state.tree = QuadTree::new(self.config.get_max_items_per_node());
        state.flat_index.clear();
        state.flat_dirty = true;
        state.mem_cache.clear();
        state.recently_used.clear();
        state.current_offset = self.store.open_page(0)?;
        self.save(state)?;
        log::debug!("File cache rebooted");
        Ok(())
    }

    fn save(&self, state: &mut FileCacheState) -> CacheResult<()> {
        self.write_dirty_nodes(state)?;
        self.save_structure(state)?;
        self.write_info(state)
    }

    fn write_dirty_nodes(&self, state: &mut FileCacheState) -> CacheResult<()> {
        for id in state.tree.dirty_nodes() {
            let node = state.tree.node(id);
            self.store.write_node(&node.name, node.entries())?;
            state.tree.mark_clean(id);
        }
        Ok(())
    }

    /// Writes the tree boundaries (if changed) and the flat index (if
    /// changed), then deletes the entry files of split nodes.
    fn save_structure(&self, state: &mut FileCacheState) -> CacheResult<()> {
        if state.tree.is_structure_dirty() {
            self.store.write_tree(&state.tree.boundaries())?;
            state.tree.mark_structure_clean();
        }
        for name in state.tree.take_retired() {
            self.store.delete_node(&name)?;
        }
        if state.flat_dirty {
            self.store.write_flat_index(state.flat_index.values())?;
            state.flat_dirty = false;
        }
        Ok(())
    }

    fn write_info(&self, state: &FileCacheState) -> CacheResult<()> {
        self.store.write_info(&CacheInfo {
            active_page: state.generation as u8,
            version: self.config.get_version(),
        })
    }

    // ------------------------------------------------------------------
    // Index access
    // ------------------------------------------------------------------

    fn ensure_loaded(&self, state: &mut FileCacheState, id: NodeId) -> CacheResult<()> {
        if state.tree.node(id).is_loaded() {
            return Ok(());
        }
        let name = state.tree.node(id).name.clone();
        let entries = match self.store.read_node(&name) {
            Ok(entries) => entries,
            Err(e) if e.is_corruption() => {
                log::warn!("Dropping corrupt quad-tree node {}: {}", name, e);
                CacheStatistics::incr(&self.stats.corrupt_evictions);
                self.store.delete_node(&name)?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        log::debug!("Loading quad-tree node {} ({} entries)", name, entries.len());
        state.tree.load_node(id, entries)
    }

    fn unload(&self, state: &mut FileCacheState, id: NodeId) -> CacheResult<()> {
        let node = state.tree.node(id);
        if node.is_dirty() {
            self.store.write_node(&node.name, node.entries())?;
        }
        log::debug!("Unloading quad-tree node {}", node.name);
        state.tree.unload_node(id);
        Ok(())
    }

    /// Resolves a slot to its entry, loading the quad-tree leaf if needed.
    fn lookup(
        &self,
        state: &mut FileCacheState,
        slot: Slot,
        tile_id: &str,
    ) -> CacheResult<Option<IndexEntry>> {
        match slot {
            Slot::Tree { lat, lon } => {
                let id = state.tree.get_node(lat, lon);
                self.ensure_loaded(state, id)?;
                Ok(state.tree.get_entry(lat, lon, tile_id)?.cloned())
            }
            Slot::Flat => Ok(state.flat_index.get(tile_id).cloned()),
        }
    }

    fn evict(&self, state: &mut FileCacheState, slot: Slot, tile_id: &str) -> CacheResult<bool> {
        match slot {
            Slot::Tree { lat, lon } => {
                let id = state.tree.get_node(lat, lon);
                self.ensure_loaded(state, id)?;
                Ok(state.tree.remove_entry(lat, lon, tile_id)?.is_some())
            }
            Slot::Flat => {
                let removed = state.flat_index.remove(tile_id).is_some();
                state.flat_dirty |= removed;
                Ok(removed)
            }
        }
    }

    fn is_stale(&self, state: &FileCacheState, entry: &IndexEntry) -> bool {
        is_stale(entry.page, state.generation, self.number_of_pages())
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    fn write_tile(
        &self,
        state: &mut FileCacheState,
        tile: &TileKey,
        buffers: &[TileBuffer],
        empty_importance_mask: u16,
    ) -> CacheResult<()> {
        let tile_id = tile.tile_id();
        let slot = self.require_slot(tile)?;
        let mut record = build_record(tile, buffers, empty_importance_mask)?;

        if let Some(existing) = self.lookup(state, slot, &tile_id)? {
            if self.is_stale(state, &existing) {
                self.evict(state, slot, &tile_id)?;
                CacheStatistics::incr(&self.stats.stale_evictions);
            } else {
                match self.store.read_record(
                    existing.page_number(self.number_of_pages()),
                    existing.offset,
                    tile.is_spatial(),
                    self.config.get_max_record_size(),
                ) {
                    Ok(older) => record = record.merged_with_older(older),
                    Err(e) if e.is_corruption() => {
                        log::warn!("Evicting corrupt record of {}: {}", tile_id, e);
                        self.evict(state, slot, &tile_id)?;
                        CacheStatistics::incr(&self.stats.corrupt_evictions);
                    }
                    Err(e) => return Err(e),
                }
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
        let size = (RECORD_HEADER_SIZE + body) as u64;
        let max_page_size = self.config.get_max_page_size() as u64;
        if size > max_page_size {
            return Err(CacheError::Capacity {
                size: size as usize,
                max: max_page_size as usize,
            });
        }
        if state.current_offset + size > max_page_size {
            self.rotate(state)?;
        }

        state.scratch.clear();
        record.encode_into(&mut state.scratch)?;
        let page = self.page_of(state.generation);
        self.store
            .append(page, state.current_offset, &state.scratch)?;
        let offset = state.current_offset as u32;
        let generation = state.generation as i8;
        state.current_offset += size;

        match slot {
            Slot::Tree { lat, lon } => {
                let id = state.tree.get_node(lat, lon);
                self.ensure_loaded(state, id)?;
                if let Some(entry) = state.tree.get_entry_mut(lat, lon, &tile_id)? {
                    entry.page = generation;
                    entry.offset = offset;
                } else {
                    let entry = IndexEntry::new(generation, offset, tile_id, lat, lon);
                    if state.tree.add_entry(entry)? {
                        self.persist_split(state)?;
                    }
                }
            }
            Slot::Flat => {
                state
                    .flat_index
                    .insert(tile_id.clone(), IndexEntry::flat(generation, offset, tile_id));
                state.flat_dirty = true;
            }
        }

        for buffer in buffers {
            state
                .mem_cache
                .write_to_cache(buffer.key.param_string(), buffer.data.clone());
        }
        Ok(())
    }

    /// Node boundaries changed: the new leaves and the structure go to disk
    /// right away.
    fn persist_split(&self, state: &mut FileCacheState) -> CacheResult<()> {
        self.write_dirty_nodes(state)?;
        self.save_structure(state)
    }

    /// Moves to the next page of the ring and clears it. The index of the
    /// page just filled is written out before the info file moves on.
    fn rotate(&self, state: &mut FileCacheState) -> CacheResult<()> {
        let limit = self.config.generation_limit();
        let mut next = state.generation + 1;
        if next >= limit {
            self.sweep(state, next)?;
            next -= limit;
        }
        state.generation = next;
        state.current_offset = 0;

        self.write_dirty_nodes(state)?;
        self.save_structure(state)?;
        self.write_info(state)?;
        self.store.clear_page(self.page_of(next))?;
        CacheStatistics::incr(&self.stats.page_rotations);
        log::debug!(
            "Rotated to page {} (generation {})",
            self.page_of(next),
            next
        );
        Ok(())
    }

    /// Removes every entry that is stale at `new_generation` and rebases
    /// the rest so the counter can restart at zero.
    fn sweep(&self, state: &mut FileCacheState, new_generation: i32) -> CacheResult<()> {
        let n = self.number_of_pages();
        let limit = self.config.generation_limit();
        let mut removed = 0;
        let mut keep = |e: &mut IndexEntry| {
            if is_stale(e.page, new_generation, n) {
                false
            } else {
                e.page = (e.page as i32 - limit) as i8;
                true
            }
        };

        for id in state.tree.all_nodes() {
            let was_loaded = state.tree.node(id).is_loaded();
            self.ensure_loaded(state, id)?;
            removed += state.tree.retain_entries(id, &mut keep);
            let node = state.tree.node(id);
            self.store.write_node(&node.name, node.entries())?;
            if was_loaded {
                state.tree.mark_clean(id);
            } else {
                state.tree.unload_node(id);
            }
        }

        let before = state.flat_index.len();
        state.flat_index.retain(|_, e| keep(e));
        removed += before - state.flat_index.len();
        state.flat_dirty = true;

        self.stats
            .stale_evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        log::debug!(
            "Generation limit {} reached, swept {} stale entries",
            limit,
            removed
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    fn read_tile(&self, state: &mut FileCacheState, key: &TileKey) -> CacheResult<Option<Vec<u8>>> {
        let Some(slot) = self.slot(key) else {
            return Ok(None);
        };
        let tile_id = key.tile_id();
        let Some(entry) = self.lookup(state, slot, &tile_id)? else {
            return Ok(None);
        };

        if self.is_stale(state, &entry) {
            log::debug!("Evicting stale entry {} (page {})", tile_id, entry.page);
            self.evict(state, slot, &tile_id)?;
            CacheStatistics::incr(&self.stats.stale_evictions);
            return Ok(None);
        }

        let record = match self.store.read_record(
            entry.page_number(self.number_of_pages()),
            entry.offset,
            key.is_spatial(),
            self.config.get_max_record_size(),
        ) {
            Ok(record) => record,
            Err(e) if e.is_corruption() => {
                log::warn!("Evicting corrupt record of {}: {}", tile_id, e);
                self.evict(state, slot, &tile_id)?;
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

    fn remove_tile(&self, state: &mut FileCacheState, key: &TileKey) -> CacheResult<bool> {
        let tile_id = key.tile_id();
        state.mem_cache.remove_tile(key);
        match self.slot(key) {
            Some(slot) => self.evict(state, slot, &tile_id),
            None => Ok(false),
        }
    }

    fn update_nodes(&self, state: &mut FileCacheState, on_screen: &[TileKey]) -> CacheResult<()> {
        let visible = self.visible.load(Ordering::Relaxed);
        let needed: HashSet<NodeId> = on_screen
            .iter()
            .filter_map(|key| match self.slot(key) {
                Some(Slot::Tree { lat, lon }) => Some(state.tree.get_node(lat, lon)),
                _ => None,
            })
            .collect();

        for id in state.tree.all_loaded_nodes() {
            if needed.contains(&id) {
                state.recently_used.remove(&id);
                continue;
            }
            // a visible cache keeps an unneeded node for one more pass
            if visible && state.recently_used.insert(id) {
                continue;
            }
            state.recently_used.remove(&id);
            self.unload(state, id)?;
        }
        state.recently_used.retain(|id| {
            let node = state.tree.node(*id);
            node.is_leaf() && node.is_loaded()
        });
        Ok(())
    }

    fn unload_all(&self, state: &mut FileCacheState) -> CacheResult<()> {
        for id in state.tree.all_loaded_nodes() {
            self.unload(state, id)?;
        }
        state.recently_used.clear();
        Ok(())
    }
}

impl TileCacheProvider for FileCache {
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
                log::error!("Failed to open file cache: {}", e);
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
                log::warn!("Failed to save file cache on close: {}", e);
            }
        }
        state.health.status = CacheStatus::Closed;
        state.tree = QuadTree::new(inner.config.get_max_items_per_node());
        state.flat_index.clear();
        state.flat_dirty = false;
        state.mem_cache.clear();
        state.recently_used.clear();
        log::debug!("File cache closed");
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
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return false;
        }
        match inner.remove_tile(&mut state, key) {
            Ok(removed) => removed,
            Err(e) => {
                inner.register_error(&mut state, &e);
                false
            }
        }
    }

    fn update_loaded_nodes(&self, on_screen: &[TileKey]) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.health.is_usable() {
            return;
        }
        if let Err(e) = inner.update_nodes(&mut state, on_screen) {
            inner.register_error(&mut state, &e);
        }
    }

    fn set_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::Relaxed);
    }

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
        let result = inner.save(&mut state).and_then(|_| inner.unload_all(&mut state));
        state.mem_cache.clear();
        match result {
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
        let loaded_nodes = state.tree.all_loaded_nodes().len() as u64;
        let entries = (state.tree.loaded_entry_count() + state.flat_index.len()) as u64;
        self.inner.stats.snapshot(loaded_nodes, entries)
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        // Best effort save on drop
        let mut state = self.inner.state.lock();
        if state.health.is_open() {
            let _ = self.inner.save(&mut state);
        }
    }
}
