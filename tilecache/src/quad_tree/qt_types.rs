//! Node and entry types of the quad-tree index.

use crate::bounding_box::BoundingBox;

/// Handle of a node inside the tree's node arena
pub type NodeId = usize;

/// Location of one cached tile record.
///
/// `page` is the generation of the page the record was written to: the
/// absolute page counter at write time, possibly rebased to a small negative
/// value by the wrap-around sweep. The page file holding the record is
/// `page.rem_euclid(number_of_pages)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub page: i8,
    pub offset: u32,
    pub tile_id: String,
    pub lat: i32,
    pub lon: i32,
}

impl IndexEntry {
    pub fn new(page: i8, offset: u32, tile_id: impl Into<String>, lat: i32, lon: i32) -> Self {
        IndexEntry {
            page,
            offset,
            tile_id: tile_id.into(),
            lat,
            lon,
        }
    }

    /// Entry of a tile without a spatial index position.
    pub fn flat(page: i8, offset: u32, tile_id: impl Into<String>) -> Self {
        IndexEntry::new(page, offset, tile_id, 0, 0)
    }

    pub fn matches(&self, lat: i32, lon: i32, tile_id: &str) -> bool {
        self.lat == lat && self.lon == lon && self.tile_id == tile_id
    }

    /// Page file number holding the record.
    pub fn page_number(&self, number_of_pages: u8) -> u8 {
        (self.page as i32).rem_euclid(number_of_pages as i32) as u8
    }
}

/// Whether an entry written in generation `page` is unreachable from the
/// current generation: its page has been cleared and reused since, or it
/// claims a generation that has not happened yet.
pub fn is_stale(page: i8, current_generation: i32, number_of_pages: u8) -> bool {
    let page = page as i32;
    page > current_generation || current_generation - page >= number_of_pages as i32
}

/// A node of the quad-tree.
///
/// Leaves own their entries; an internal node has exactly four children and
/// no entries. A leaf with `loaded == false` has its entries on disk only.
#[derive(Debug, Clone)]
pub struct QuadNode {
    pub bbox: BoundingBox,
    pub name: String,
    pub(crate) entries: Vec<IndexEntry>,
    pub(crate) children: Option<[NodeId; 4]>,
    pub(crate) dirty: bool,
    pub(crate) loaded: bool,
}

impl QuadNode {
    pub(crate) fn new(bbox: BoundingBox, name: String, loaded: bool) -> Self {
        QuadNode {
            bbox,
            name,
            entries: Vec::new(),
            children: None,
            dirty: false,
            loaded,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of live entries; only meaningful while loaded.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn children(&self) -> Option<[NodeId; 4]> {
        self.children
    }
}
