use crate::cache_types::{CacheError, CacheResult};
use crate::constants::{
    generation_limit, CACHE_FORMAT_VERSION, MAX_NBR_ITEM_PER_NODE, MAX_NUMBER_OF_ERRORS,
    MAX_PAGE_SIZE, MAX_RECORD_SIZE, MEM_CACHE_GENERATIONS, MEM_CACHE_GENERATION_SIZE,
    NUMBER_OF_PAGES, RECORD_HEADER_SIZE,
};
use serde::{Deserialize, Serialize};

/// Tuning parameters of a cache backend.
///
/// `Default` yields the values the cache was designed around (ten 1 MB pages,
/// 500 entries per quad-tree leaf, three tolerated I/O failures). Every
/// setter consumes and returns the config so it can be chained:
///
/// ```rust
/// use tilecache::CacheConfig;
///
/// let config = CacheConfig::default()
///     .number_of_pages(4)
///     .max_page_size(64 * 1024);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.generation_limit(), 124);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    number_of_pages: u8,
    max_page_size: u32,
    max_items_per_node: usize,
    max_errors: u32,
    max_record_size: u32,
    mem_cache_generations: usize,
    mem_cache_generation_size: usize,
    version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            number_of_pages: NUMBER_OF_PAGES,
            max_page_size: MAX_PAGE_SIZE,
            max_items_per_node: MAX_NBR_ITEM_PER_NODE,
            max_errors: MAX_NUMBER_OF_ERRORS,
            max_record_size: MAX_RECORD_SIZE,
            mem_cache_generations: MEM_CACHE_GENERATIONS,
            mem_cache_generation_size: MEM_CACHE_GENERATION_SIZE,
            version: CACHE_FORMAT_VERSION,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of circular pages.
    pub fn number_of_pages(mut self, pages: u8) -> Self {
        self.number_of_pages = pages;
        self
    }

    /// Sets the byte capacity of one page.
    pub fn max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size;
        self
    }

    /// Sets the leaf capacity that triggers a quad-tree split.
    pub fn max_items_per_node(mut self, items: usize) -> Self {
        self.max_items_per_node = items;
        self
    }

    /// Sets how many I/O failures disable the cache.
    pub fn max_errors(mut self, errors: u32) -> Self {
        self.max_errors = errors;
        self
    }

    /// Sets the largest record `totalSize` accepted as sane.
    pub fn max_record_size(mut self, size: u32) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets the number of MemCache generations.
    pub fn mem_cache_generations(mut self, generations: usize) -> Self {
        self.mem_cache_generations = generations;
        self
    }

    /// Sets the payload size at which a MemCache generation rotates.
    pub fn mem_cache_generation_size(mut self, size: usize) -> Self {
        self.mem_cache_generation_size = size;
        self
    }

    /// Sets the persisted format version.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn get_number_of_pages(&self) -> u8 {
        self.number_of_pages
    }

    pub fn get_max_page_size(&self) -> u32 {
        self.max_page_size
    }

    pub fn get_max_items_per_node(&self) -> usize {
        self.max_items_per_node
    }

    pub fn get_max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn get_max_record_size(&self) -> u32 {
        self.max_record_size
    }

    pub fn get_mem_cache_generations(&self) -> usize {
        self.mem_cache_generations
    }

    pub fn get_mem_cache_generation_size(&self) -> usize {
        self.mem_cache_generation_size
    }

    pub fn get_version(&self) -> u32 {
        self.version
    }

    /// Absolute page counter value at which the full stale-entry sweep runs
    /// and the counter wraps to zero.
    pub fn generation_limit(&self) -> i32 {
        generation_limit(self.number_of_pages)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.number_of_pages < 2 || self.number_of_pages > 127 {
            return Err(CacheError::InvalidOperation(format!(
                "number_of_pages must be within 2..=127, got {}",
                self.number_of_pages
            )));
        }
        if (self.max_page_size as usize) <= RECORD_HEADER_SIZE {
            return Err(CacheError::InvalidOperation(format!(
                "max_page_size {} cannot hold a record header",
                self.max_page_size
            )));
        }
        if self.max_items_per_node == 0 {
            return Err(CacheError::InvalidOperation(
                "max_items_per_node must be positive".into(),
            ));
        }
        if self.max_errors == 0 {
            return Err(CacheError::InvalidOperation(
                "max_errors must be positive".into(),
            ));
        }
        if self.max_record_size > i32::MAX as u32 {
            return Err(CacheError::InvalidOperation(
                "max_record_size must fit a signed 32-bit length".into(),
            ));
        }
        if self.mem_cache_generations < 2 {
            return Err(CacheError::InvalidOperation(
                "mem_cache_generations must be at least 2".into(),
            ));
        }
        Ok(())
    }
}
