//! The backend contract the tile controller talks to.

use crate::backend::{FileCache, RecordStoreCache};
use crate::cache_types::CacheStats;
use crate::tile_key::{TileBuffer, TileKey};

/// Operations every cache backend offers.
///
/// Nothing here reports an error: a failed lookup is a miss, a failed
/// mutation returns `false`. Backends count I/O failures internally and
/// disable themselves once too many have happened.
pub trait TileCacheProvider: Send + Sync {
    /// Opens (or reopens) the cache. A successful open re-arms a disabled
    /// cache.
    fn open(&self) -> bool;

    /// Saves and closes the cache.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Stores every buffer of `tile` in one record. Importances cached
    /// earlier for the same tile are kept.
    fn write_data_to_cache(
        &self,
        tile: &TileKey,
        buffers: &[TileBuffer],
        empty_importance_mask: u16,
    ) -> bool;

    /// Looks the buffer up on disk. Sibling buffers found in the same
    /// record are put into the hot buffer.
    fn get_data_from_cache(&self, key: &TileKey) -> Option<Vec<u8>>;

    /// Looks the buffer up in the hot buffer only.
    fn get_buffered_data(&self, key: &TileKey) -> Option<Vec<u8>>;

    /// Forgets the tile `key` belongs to.
    fn remove_from_cache(&self, key: &TileKey) -> bool;

    /// Tells the cache which tiles are on screen so index nodes nobody
    /// needs can be released.
    fn update_loaded_nodes(&self, on_screen: &[TileKey]);

    fn set_visible(&self, visible: bool);

    fn save_cache(&self) -> bool;

    /// Saves and releases index memory.
    fn purge_data(&self) -> bool;

    /// Deletes everything and starts over on an empty cache.
    fn clear_cache(&self) -> bool;

    fn stats(&self) -> CacheStats;
}

/// The configured backend of a device.
pub enum TileCache {
    File(FileCache),
    RecordStore(RecordStoreCache),
    /// Caches nothing
    Dummy,
}

impl TileCache {
    fn provider(&self) -> Option<&dyn TileCacheProvider> {
        match self {
            TileCache::File(cache) => Some(cache),
            TileCache::RecordStore(cache) => Some(cache),
            TileCache::Dummy => None,
        }
    }
}

impl TileCacheProvider for TileCache {
    fn open(&self) -> bool {
        self.provider().is_some_and(|c| c.open())
    }

    fn close(&self) {
        if let Some(cache) = self.provider() {
            cache.close();
        }
    }

    fn is_open(&self) -> bool {
        self.provider().is_some_and(|c| c.is_open())
    }

    fn write_data_to_cache(
        &self,
        tile: &TileKey,
        buffers: &[TileBuffer],
        empty_importance_mask: u16,
    ) -> bool {
        self.provider()
            .is_some_and(|c| c.write_data_to_cache(tile, buffers, empty_importance_mask))
    }

    fn get_data_from_cache(&self, key: &TileKey) -> Option<Vec<u8>> {
        self.provider()?.get_data_from_cache(key)
    }

    fn get_buffered_data(&self, key: &TileKey) -> Option<Vec<u8>> {
        self.provider()?.get_buffered_data(key)
    }

    fn remove_from_cache(&self, key: &TileKey) -> bool {
        self.provider().is_some_and(|c| c.remove_from_cache(key))
    }

    fn update_loaded_nodes(&self, on_screen: &[TileKey]) {
        if let Some(cache) = self.provider() {
            cache.update_loaded_nodes(on_screen);
        }
    }

    fn set_visible(&self, visible: bool) {
        if let Some(cache) = self.provider() {
            cache.set_visible(visible);
        }
    }

    fn save_cache(&self) -> bool {
        self.provider().is_some_and(|c| c.save_cache())
    }

    fn purge_data(&self) -> bool {
        self.provider().is_some_and(|c| c.purge_data())
    }

    fn clear_cache(&self) -> bool {
        self.provider().is_some_and(|c| c.clear_cache())
    }

    fn stats(&self) -> CacheStats {
        self.provider().map(|c| c.stats()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::MemoryStorage;
    use crate::tile_key::{TileParams, UniformLayerFormat};
    use std::sync::Arc;

    #[test]
    fn test_dummy_caches_nothing() {
        let cache = TileCache::Dummy;
        let key = TileKey::named("img");
        assert!(!cache.open());
        assert!(!cache.is_open());
        assert!(!cache.write_data_to_cache(&key, &[TileBuffer::new(key.clone(), vec![1])], 0));
        assert_eq!(cache.get_data_from_cache(&key), None);
        assert_eq!(cache.get_buffered_data(&key), None);
        assert!(!cache.save_cache());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_enum_dispatches_to_backend() {
        let file = FileCache::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(UniformLayerFormat::default()),
            CacheConfig::default(),
        );
        let cache = TileCache::File(file);
        assert!(cache.open());

        let key = TileKey::spatial(TileParams::new(0, 1, 2, 3));
        assert!(cache.write_data_to_cache(&key, &[TileBuffer::new(key.clone(), vec![4; 5])], 0));
        assert_eq!(cache.get_data_from_cache(&key), Some(vec![4; 5]));
        assert_eq!(cache.stats().hits, 1);
        cache.close();
        assert!(!cache.is_open());
    }
}
