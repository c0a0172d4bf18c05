//! Tile identifiers as seen by the cache.
//!
//! The tile controller owns the real key objects; the cache only needs a
//! handful of their properties: the importance-independent tile id, the
//! canonical per-importance parameter string, and, for spatial tiles, the
//! grid position that becomes a quad-tree coordinate.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Which half of a tile a buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileMapType {
    /// Geometry features
    Map,
    /// The string table belonging to the features
    Strings,
}

impl TileMapType {
    pub fn to_u8(self) -> u8 {
        match self {
            TileMapType::Map => 0,
            TileMapType::Strings => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TileMapType::Map),
            1 => Some(TileMapType::Strings),
            _ => None,
        }
    }

    fn suffix(self) -> char {
        match self {
            TileMapType::Map => 'G',
            TileMapType::Strings => 'S',
        }
    }
}

/// Parameters of a spatial tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileParams {
    pub layer_id: u8,
    pub detail: u8,
    pub lat_index: i32,
    pub lon_index: i32,
    pub importance: u8,
    pub map_type: TileMapType,
    /// Overview tiles are looked up by id only and bypass the quad-tree.
    pub overview: bool,
}

impl TileParams {
    pub fn new(layer_id: u8, detail: u8, lat_index: i32, lon_index: i32) -> Self {
        TileParams {
            layer_id,
            detail,
            lat_index,
            lon_index,
            importance: 0,
            map_type: TileMapType::Map,
            overview: false,
        }
    }

    pub fn importance(mut self, importance: u8) -> Self {
        self.importance = importance;
        self
    }

    pub fn map_type(mut self, map_type: TileMapType) -> Self {
        self.map_type = map_type;
        self
    }

    pub fn overview(mut self, overview: bool) -> Self {
        self.overview = overview;
        self
    }

    /// Absolute `(lat, lon)` of the tile's lower-left corner in map units.
    ///
    /// Returns `None` when the layer is unknown or the position overflows.
    pub fn coordinates(&self, format: &dyn LayerFormat) -> Option<(i32, i32)> {
        let size = format.tile_size(self.layer_id, self.detail)?;
        let lat = self.lat_index.checked_mul(size)?;
        let lon = self.lon_index.checked_mul(size)?;
        Some((lat, lon))
    }

    fn tile_id(&self) -> String {
        format!(
            "{}{:x}_{:x}_{}_{}",
            if self.overview { 'O' } else { 'T' },
            self.layer_id,
            self.detail,
            self.lat_index,
            self.lon_index
        )
    }
}

/// Key of one cacheable buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TileKey {
    /// A map tile positioned on the tile grid
    Spatial(TileParams),
    /// A blob without a spatial component (images, format descriptors)
    Named(String),
}

impl TileKey {
    pub fn spatial(params: TileParams) -> Self {
        TileKey::Spatial(params)
    }

    pub fn named(id: impl Into<String>) -> Self {
        TileKey::Named(id.into())
    }

    pub fn params(&self) -> Option<&TileParams> {
        match self {
            TileKey::Spatial(params) => Some(params),
            TileKey::Named(_) => None,
        }
    }

    /// Identifier shared by every importance and map type of one tile.
    pub fn tile_id(&self) -> String {
        match self {
            TileKey::Spatial(params) => params.tile_id(),
            TileKey::Named(id) => id.clone(),
        }
    }

    /// Canonical string of exactly this buffer.
    pub fn param_string(&self) -> String {
        match self {
            TileKey::Spatial(params) => format!(
                "{}_{}{}",
                params.tile_id(),
                params.importance,
                params.map_type.suffix()
            ),
            TileKey::Named(id) => id.clone(),
        }
    }

    /// Whether the key is stored with a spatial record layout.
    pub fn is_spatial(&self) -> bool {
        matches!(self, TileKey::Spatial(_))
    }

    /// Whether the key is indexed by the quad-tree rather than a flat map.
    pub fn is_quad_tree_indexed(&self) -> bool {
        matches!(self, TileKey::Spatial(params) if !params.overview)
    }

    /// Sibling key of the same tile with another importance and map type.
    pub fn with_importance(&self, importance: u8, map_type: TileMapType) -> TileKey {
        match self {
            TileKey::Spatial(params) => TileKey::Spatial(TileParams {
                importance,
                map_type,
                ..params.clone()
            }),
            TileKey::Named(id) => TileKey::Named(id.clone()),
        }
    }
}

impl Display for TileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.param_string())
    }
}

/// One buffer handed to `write_data_to_cache`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBuffer {
    pub key: TileKey,
    pub data: Vec<u8>,
}

impl TileBuffer {
    pub fn new(key: TileKey, data: impl Into<Vec<u8>>) -> Self {
        TileBuffer {
            key,
            data: data.into(),
        }
    }
}

/// Layer description provided by the map format: the size of one tile in
/// map units for a layer at a detail level.
pub trait LayerFormat: Send + Sync {
    fn tile_size(&self, layer_id: u8, detail: u8) -> Option<i32>;
}

/// A layer format where every detail level doubles the tile size of the
/// level below.
#[derive(Debug, Clone)]
pub struct UniformLayerFormat {
    base_sizes: HashMap<u8, i32>,
    default_base: Option<i32>,
}

impl UniformLayerFormat {
    /// Every layer uses `base_size` at detail zero.
    pub fn new(base_size: i32) -> Self {
        UniformLayerFormat {
            base_sizes: HashMap::new(),
            default_base: Some(base_size),
        }
    }

    /// Only explicitly registered layers are known.
    pub fn strict() -> Self {
        UniformLayerFormat {
            base_sizes: HashMap::new(),
            default_base: None,
        }
    }

    pub fn with_layer(mut self, layer_id: u8, base_size: i32) -> Self {
        self.base_sizes.insert(layer_id, base_size);
        self
    }
}

impl LayerFormat for UniformLayerFormat {
    fn tile_size(&self, layer_id: u8, detail: u8) -> Option<i32> {
        let base = self
            .base_sizes
            .get(&layer_id)
            .copied()
            .or(self.default_base)?;
        if detail >= 31 {
            return None;
        }
        base.checked_mul(1i32 << detail)
    }
}

impl Default for UniformLayerFormat {
    fn default() -> Self {
        UniformLayerFormat::new(1 << 12)
    }
}
