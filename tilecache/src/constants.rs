//! Constants for the tile cache engine.

/// Number of circularly reused pages
pub const NUMBER_OF_PAGES: u8 = 10;

/// Capacity of one FileCache page in bytes
pub const MAX_PAGE_SIZE: u32 = 1_024_000;

/// Entries a quad-tree leaf holds before it is split
pub const MAX_NBR_ITEM_PER_NODE: usize = 500;

/// I/O failures tolerated before a backend disables itself
pub const MAX_NUMBER_OF_ERRORS: u32 = 3;

/// Largest sane `totalSize` of a record; anything above is corruption
pub const MAX_RECORD_SIZE: u32 = 400_000;

/// Generations kept by the in-memory hot buffer
pub const MEM_CACHE_GENERATIONS: usize = 2;

/// Payload bytes one MemCache generation accumulates before rotating
pub const MEM_CACHE_GENERATION_SIZE: usize = 32_000;

/// Persisted format version; a mismatch reboots the cache
pub const CACHE_FORMAT_VERSION: u32 = 3;

/// `totalSize:u32` + `emptyImportanceMask:u16`
pub const RECORD_HEADER_SIZE: usize = 6;

/// Generations are kept in a signed byte
pub const MAX_GENERATION: i32 = i8::MAX as i32;

// File names used by the FileCache layout
pub const CACHE_INFO_FILE: &str = "cache_info";
pub const FLAT_INDEX_FILE: &str = "flat_index";
pub const QUAD_TREE_FILE: &str = "qt_struct";
pub const NODE_FILE_PREFIX: &str = "qt_node_";
pub const PAGE_FILE_PREFIX: &str = "page_";

// Record names used by the RecordStoreCache layout
pub const RS_INFO_RECORD: &str = "rs_info";
pub const RS_PAGE_PREFIX: &str = "rs_page_";
pub const RS_INDEX_PREFIX: &str = "rs_index_";

/// Largest multiple of `number_of_pages` that still fits the signed
/// generation byte. The absolute page counter resets when it reaches it.
pub const fn generation_limit(number_of_pages: u8) -> i32 {
    let n = number_of_pages as i32;
    (MAX_GENERATION / n) * n
}
