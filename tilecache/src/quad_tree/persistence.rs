//! Binary layouts of the quad-tree files.
//!
//! Per-node entry file:
//! ```text
//! entryCount:u32
//! repeat entryCount: tileId:utf lat:i32 lon:i32 offset:u32 page:u32
//! ```
//! Boundary file:
//! ```text
//! nodeCount:u32
//! repeat nodeCount: minLat:i32 minLon:i32 maxLat:i32 maxLon:i32 name:utf
//! ```
//! The generation of an entry is written sign-extended into the `page`
//! field and must fit a signed byte when read back.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::bounding_box::BoundingBox;
use crate::cache_types::{CacheError, CacheResult};
use crate::storage::codec::{capacity_hint, read_utf, write_utf};

use super::qt_types::IndexEntry;

pub fn encode_node_entries(entries: &[IndexEntry]) -> CacheResult<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + entries.len() * 24);
    out.write_u32::<BigEndian>(entries.len() as u32)?;
    for entry in entries {
        write_utf(&mut out, &entry.tile_id)?;
        out.write_i32::<BigEndian>(entry.lat)?;
        out.write_i32::<BigEndian>(entry.lon)?;
        out.write_u32::<BigEndian>(entry.offset)?;
        out.write_i32::<BigEndian>(entry.page as i32)?;
    }
    Ok(out)
}

pub fn decode_node_entries(bytes: &[u8]) -> CacheResult<Vec<IndexEntry>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(capacity_hint(count));
    for _ in 0..count {
        let tile_id = read_utf(&mut cursor)?;
        let lat = cursor.read_i32::<BigEndian>()?;
        let lon = cursor.read_i32::<BigEndian>()?;
        let offset = cursor.read_u32::<BigEndian>()?;
        let raw_page = cursor.read_i32::<BigEndian>()?;
        let page = i8::try_from(raw_page).map_err(|_| {
            CacheError::corrupt(format!("generation {} of {} out of range", raw_page, tile_id))
        })?;
        entries.push(IndexEntry::new(page, offset, tile_id, lat, lon));
    }
    Ok(entries)
}

pub fn encode_boundaries(boundaries: &[(BoundingBox, String)]) -> CacheResult<Vec<u8>> {
    let mut out = Vec::with_capacity(4 + boundaries.len() * 24);
    out.write_u32::<BigEndian>(boundaries.len() as u32)?;
    for (bbox, name) in boundaries {
        out.write_i32::<BigEndian>(bbox.min_lat)?;
        out.write_i32::<BigEndian>(bbox.min_lon)?;
        out.write_i32::<BigEndian>(bbox.max_lat)?;
        out.write_i32::<BigEndian>(bbox.max_lon)?;
        write_utf(&mut out, name)?;
    }
    Ok(out)
}

pub fn decode_boundaries(bytes: &[u8]) -> CacheResult<Vec<(BoundingBox, String)>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut boundaries = Vec::with_capacity(capacity_hint(count));
    for _ in 0..count {
        let min_lat = cursor.read_i32::<BigEndian>()?;
        let min_lon = cursor.read_i32::<BigEndian>()?;
        let max_lat = cursor.read_i32::<BigEndian>()?;
        let max_lon = cursor.read_i32::<BigEndian>()?;
        let name = read_utf(&mut cursor)?;
        let bbox = BoundingBox::new(min_lat, min_lon, max_lat, max_lon);
        if !bbox.is_valid() {
            return Err(CacheError::corrupt(format!("invalid boundary {} of {}", bbox, name)));
        }
        boundaries.push((bbox, name));
    }
    Ok(boundaries)
}
