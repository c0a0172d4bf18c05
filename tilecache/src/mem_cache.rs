//! In-memory hot buffer for recently decoded sub-records.
//!
//! The buffer is a ring of generations. Writes go to the current
//! generation until its payload exceeds the generation size; then the
//! oldest generation is wiped and becomes the write target. Eviction is
//! generation-granular, so a lookup checks every generation.

use std::collections::HashMap;

use crate::tile_key::TileKey;

#[derive(Default)]
struct Generation {
    entries: HashMap<String, Vec<u8>>,
    size: usize,
}

impl Generation {
    fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let data = self.entries.remove(key)?;
        self.size -= data.len();
        Some(data)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }
}

/// Ring of key to blob maps.
pub struct MemCache {
    generations: Vec<Generation>,
    current: usize,
    generation_size: usize,
}

impl MemCache {
    pub fn new(generations: usize, generation_size: usize) -> Self {
        MemCache {
            generations: (0..generations.max(1)).map(|_| Generation::default()).collect(),
            current: 0,
            generation_size,
        }
    }

    pub fn write_to_cache(&mut self, key: impl Into<String>, data: Vec<u8>) {
        let key = key.into();
        for generation in &mut self.generations {
            generation.remove(&key);
        }

        let current = &mut self.generations[self.current];
        current.size += data.len();
        current.entries.insert(key, data);

        if current.size > self.generation_size {
            self.current = (self.current + 1) % self.generations.len();
            let target = &mut self.generations[self.current];
            if !target.entries.is_empty() {
                log::debug!(
                    "MemCache dropping generation of {} buffers",
                    target.entries.len()
                );
            }
            target.clear();
        }
    }

    pub fn get_data_from_cache(&self, key: &str) -> Option<&[u8]> {
        self.generations
            .iter()
            .find_map(|g| g.entries.get(key))
            .map(|data| data.as_slice())
    }

    pub fn remove_from_cache(&mut self, key: &str) -> bool {
        let mut removed = false;
        for generation in &mut self.generations {
            removed |= generation.remove(key).is_some();
        }
        removed
    }

    /// Removes every blob whose key matches; returns how many went.
    pub fn remove_where<F>(&mut self, matches: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = 0;
        for generation in &mut self.generations {
            let keys: Vec<String> = generation
                .entries
                .keys()
                .filter(|k| matches(k))
                .cloned()
                .collect();
            for key in keys {
                generation.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Drops every buffer of `tile`: all importances and map types of a
    /// spatial tile, the single blob of a named one.
    pub fn remove_tile(&mut self, tile: &TileKey) -> usize {
        if tile.is_spatial() {
            let prefix = format!("{}_", tile.tile_id());
            self.remove_where(|k| k.starts_with(&prefix))
        } else {
            usize::from(self.remove_from_cache(&tile.param_string()))
        }
    }

    pub fn clear(&mut self) {
        for generation in &mut self.generations {
            generation.clear();
        }
        self.current = 0;
    }

    /// Number of buffered blobs.
    pub fn len(&self) -> usize {
        self.generations.iter().map(|g| g.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes held.
    pub fn payload_size(&self) -> usize {
        self.generations.iter().map(|g| g.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read() {
        let mut cache = MemCache::new(2, 100);
        cache.write_to_cache("a", vec![1, 2, 3]);
        assert_eq!(cache.get_data_from_cache("a"), Some(&[1u8, 2, 3][..]));
        assert_eq!(cache.get_data_from_cache("b"), None);
        assert_eq!(cache.payload_size(), 3);
    }

    #[test]
    fn test_overwrite_replaces_across_generations() {
        let mut cache = MemCache::new(2, 10);
        cache.write_to_cache("a", vec![0; 11]); // fills generation 0, rotates
        cache.write_to_cache("a", vec![1; 2]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.payload_size(), 2);
        assert_eq!(cache.get_data_from_cache("a"), Some(&[1u8, 1][..]));
    }

    #[test]
    fn test_oldest_generation_is_evicted() {
        let mut cache = MemCache::new(2, 10);
        cache.write_to_cache("old", vec![0; 6]);
        cache.write_to_cache("old2", vec![0; 6]); // generation 0 full
        cache.write_to_cache("mid", vec![0; 11]); // generation 1 full
        assert!(cache.get_data_from_cache("old").is_none());
        assert!(cache.get_data_from_cache("old2").is_none());
        assert!(cache.get_data_from_cache("mid").is_some());

        cache.write_to_cache("new", vec![0; 1]);
        assert!(cache.get_data_from_cache("mid").is_some());
        assert!(cache.get_data_from_cache("new").is_some());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = MemCache::new(2, 100);
        cache.write_to_cache("a", vec![1]);
        cache.write_to_cache("b", vec![2]);
        assert!(cache.remove_from_cache("a"));
        assert!(!cache.remove_from_cache("a"));
        assert_eq!(cache.len(), 1);
        cache.write_to_cache("T1_0G", vec![3]);
        cache.write_to_cache("T1_1S", vec![4]);
        assert_eq!(cache.remove_where(|k| k.starts_with("T1_")), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.payload_size(), 0);
    }

    #[test]
    fn test_remove_tile() {
        use crate::tile_key::{TileMapType, TileParams};

        let mut cache = MemCache::new(2, 100);
        let key = TileKey::spatial(TileParams::new(0, 0, 1, 1));
        let neighbour = TileKey::spatial(TileParams::new(0, 0, 1, 10));
        for k in [&key, &neighbour] {
            cache.write_to_cache(k.with_importance(0, TileMapType::Map).param_string(), vec![1]);
            cache.write_to_cache(k.with_importance(1, TileMapType::Map).param_string(), vec![2]);
        }
        let named = TileKey::named("legend");
        cache.write_to_cache(named.param_string(), vec![3]);

        assert_eq!(cache.remove_tile(&key), 2);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.remove_tile(&named), 1);
        assert_eq!(cache.remove_tile(&named), 0);
        assert_eq!(cache.len(), 2);
    }
}
