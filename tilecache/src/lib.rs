//! # tilecache - Persistent Map Tile Cache
//!
//! This crate stores downloaded vector-map tiles on the device so they can
//! be shown again without a network round trip, within a fixed storage
//! budget.
//!
//! ## Features
//!
//! - **Paged Storage**: Records are appended to a ring of fixed-size pages;
//!   reusing a page evicts everything it held
//! - **Lazy Spatial Index**: A quad-tree whose leaves are loaded from disk on
//!   demand and released when no visible tile needs them
//! - **Importance Merging**: All importance levels of a tile share one record
//!   and a later write never loses an earlier level
//! - **Hot Buffer**: Sibling buffers read from disk are kept in memory
//! - **Fault Tolerant**: Corrupt records are evicted one by one; repeated I/O
//!   failures disable the cache instead of failing the caller
//! - **Two Backends**: Page files with a quad-tree, or a record store with
//!   per-page index records
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tilecache::{
//!     CacheConfig, FileCache, TileBuffer, TileCacheProvider, TileKey, TileParams,
//!     UniformLayerFormat,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = FileCache::on_disk(
//!     "/tmp/tiles",
//!     Arc::new(UniformLayerFormat::default()),
//!     CacheConfig::default(),
//! )?;
//! cache.open();
//!
//! let key = TileKey::spatial(TileParams::new(0, 4, 120, -33).importance(1));
//! cache.write_data_to_cache(&key, &[TileBuffer::new(key.clone(), vec![0u8; 64])], 0);
//! assert_eq!(cache.get_data_from_cache(&key), Some(vec![0u8; 64]));
//!
//! cache.close();
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod bounding_box;
pub mod cache_types;
pub mod config;
pub mod constants;
pub mod tile_key;

// Storage and indexing
pub mod mem_cache;
pub mod quad_tree;
pub mod storage;

// Backends
pub mod backend;
pub mod tile_cache;

pub use backend::{FileCache, RecordStoreCache};
pub use bounding_box::BoundingBox;
pub use cache_types::{CacheError, CacheResult, CacheStats, CacheStatus};
pub use config::CacheConfig;
pub use mem_cache::MemCache;
pub use quad_tree::{IndexEntry, QuadTree};
pub use storage::{DiskStorage, MemoryStorage, PageStore, RecordStore, Storage, StorageRecordStore};
pub use tile_cache::{TileCache, TileCacheProvider};
pub use tile_key::{LayerFormat, TileBuffer, TileKey, TileMapType, TileParams, UniformLayerFormat};
