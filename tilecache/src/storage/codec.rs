//! Binary layouts of everything the cache persists. All integers are
//! big-endian; strings are a `u16` byte length followed by UTF-8 bytes.
//!
//! Spatial record:
//! ```text
//! totalSize:u32 emptyImportanceMask:u16
//! repeat until totalSize bytes consumed:
//!   importanceNumber:u8 tileMapType:u8 dataLen:u16 data:bytes[dataLen]
//! ```
//! Named record:
//! ```text
//! totalSize:u32 emptyImportanceMask:u16
//! paramStrLen:u8 paramStr:bytes[paramStrLen] dataLen:u16 data:bytes[dataLen]
//! ```
//! Flat index: `entryCount:u32`, then `page:u8 offset:u32 tileId:utf` each.
//! Cache info: `activePage:u8 version:u32`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::cache_types::{CacheError, CacheResult};
use crate::constants::RECORD_HEADER_SIZE;
use crate::quad_tree::IndexEntry;
use crate::tile_key::TileMapType;

/// Upper bound for capacity reservations driven by on-disk counts
const MAX_PREALLOCATED: usize = 4096;

pub fn read_utf<R: Read>(reader: &mut R) -> CacheResult<String> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| CacheError::corrupt(format!("invalid string: {}", e)))
}

pub fn write_utf<W: Write>(writer: &mut W, value: &str) -> CacheResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| {
        CacheError::InvalidOperation(format!("string of {} bytes is too long", value.len()))
    })?;
    writer.write_u16::<BigEndian>(len)?;
    writer.write_all(value.as_bytes())?;
    Ok(())
}

/// Capacity hint for a collection whose length was read from disk.
pub(crate) fn capacity_hint(count: u32) -> usize {
    (count as usize).min(MAX_PREALLOCATED)
}

// ============================================================================
// Records
// ============================================================================

/// The fixed-size header in front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub total_size: u32,
    pub empty_importance_mask: u16,
}

impl RecordHeader {
    /// Parses and sanity-checks a header. A negative or oversized
    /// `totalSize` is corruption.
    pub fn parse(bytes: &[u8], max_record_size: u32) -> CacheResult<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(CacheError::corrupt("truncated record header"));
        }
        let mut cursor = Cursor::new(bytes);
        let total_size = cursor.read_i32::<BigEndian>()?;
        let empty_importance_mask = cursor.read_u16::<BigEndian>()?;
        if total_size < 0 || total_size as u32 > max_record_size {
            return Err(CacheError::corrupt(format!(
                "record size {} outside 0..={}",
                total_size, max_record_size
            )));
        }
        Ok(RecordHeader {
            total_size: total_size as u32,
            empty_importance_mask,
        })
    }
}

/// One importance level (or string table) of a spatial tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubRecord {
    pub importance: u8,
    pub map_type: TileMapType,
    pub data: Vec<u8>,
}

impl SubRecord {
    pub fn new(importance: u8, map_type: TileMapType, data: impl Into<Vec<u8>>) -> Self {
        SubRecord {
            importance,
            map_type,
            data: data.into(),
        }
    }

    fn same_slot(&self, other: &SubRecord) -> bool {
        self.importance == other.importance && self.map_type == other.map_type
    }
}

/// Decoded content of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRecord {
    /// Every cached importance of a spatial tile
    Spatial {
        empty_importance_mask: u16,
        parts: Vec<SubRecord>,
    },
    /// A single parameter-string/blob pair
    Named {
        empty_importance_mask: u16,
        param: String,
        data: Vec<u8>,
    },
}

impl CacheRecord {
    pub fn empty_importance_mask(&self) -> u16 {
        match self {
            CacheRecord::Spatial {
                empty_importance_mask,
                ..
            }
            | CacheRecord::Named {
                empty_importance_mask,
                ..
            } => *empty_importance_mask,
        }
    }

    /// Bytes following the header.
    pub fn body_len(&self) -> usize {
        match self {
            CacheRecord::Spatial { parts, .. } => parts.iter().map(|p| 4 + p.data.len()).sum(),
            CacheRecord::Named { param, data, .. } => 1 + param.len() + 2 + data.len(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body_len()
    }

    /// Checks that every length fits its on-disk field.
    pub fn check_encodable(&self) -> CacheResult<()> {
        let too_long = |size: usize, max: usize| CacheError::Capacity { size, max };
        match self {
            CacheRecord::Spatial { parts, .. } => {
                for part in parts {
                    if part.data.len() > u16::MAX as usize {
                        return Err(too_long(part.data.len(), u16::MAX as usize));
                    }
                }
            }
            CacheRecord::Named { param, data, .. } => {
                if param.len() > u8::MAX as usize {
                    return Err(too_long(param.len(), u8::MAX as usize));
                }
                if data.len() > u16::MAX as usize {
                    return Err(too_long(data.len(), u16::MAX as usize));
                }
            }
        }
        if self.body_len() > i32::MAX as usize {
            return Err(too_long(self.body_len(), i32::MAX as usize));
        }
        Ok(())
    }

    /// Appends the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> CacheResult<()> {
        self.check_encodable()?;
        out.reserve(self.encoded_len());
        out.write_u32::<BigEndian>(self.body_len() as u32)?;
        out.write_u16::<BigEndian>(self.empty_importance_mask())?;
        match self {
            CacheRecord::Spatial { parts, .. } => {
                for part in parts {
                    out.write_u8(part.importance)?;
                    out.write_u8(part.map_type.to_u8())?;
                    out.write_u16::<BigEndian>(part.data.len() as u16)?;
                    out.write_all(&part.data)?;
                }
            }
            CacheRecord::Named { param, data, .. } => {
                out.write_u8(param.len() as u8)?;
                out.write_all(param.as_bytes())?;
                out.write_u16::<BigEndian>(data.len() as u16)?;
                out.write_all(data)?;
            }
        }
        Ok(())
    }

    /// Decodes a record body of exactly `header.total_size` bytes.
    pub fn decode(header: RecordHeader, body: &[u8], spatial: bool) -> CacheResult<Self> {
        if body.len() != header.total_size as usize {
            return Err(CacheError::corrupt(format!(
                "record body is {} bytes, header says {}",
                body.len(),
                header.total_size
            )));
        }
        let mut cursor = Cursor::new(body);
        if spatial {
            let mut parts = Vec::new();
            while (cursor.position() as usize) < body.len() {
                let importance = cursor.read_u8()?;
                let map_type = TileMapType::from_u8(cursor.read_u8()?)
                    .ok_or_else(|| CacheError::corrupt("unknown tile map type"))?;
                let len = cursor.read_u16::<BigEndian>()? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                parts.push(SubRecord {
                    importance,
                    map_type,
                    data,
                });
            }
            Ok(CacheRecord::Spatial {
                empty_importance_mask: header.empty_importance_mask,
                parts,
            })
        } else {
            let param_len = cursor.read_u8()? as usize;
            let mut param = vec![0u8; param_len];
            cursor.read_exact(&mut param)?;
            let param = String::from_utf8(param)
                .map_err(|e| CacheError::corrupt(format!("invalid parameter string: {}", e)))?;
            let len = cursor.read_u16::<BigEndian>()? as usize;
            let mut data = vec![0u8; len];
            cursor.read_exact(&mut data)?;
            if (cursor.position() as usize) != body.len() {
                return Err(CacheError::corrupt("trailing bytes after named record"));
            }
            Ok(CacheRecord::Named {
                empty_importance_mask: header.empty_importance_mask,
                param,
                data,
            })
        }
    }

    /// Decodes the record starting at `offset` of a fully buffered page.
    pub fn decode_at(
        page: &[u8],
        offset: usize,
        spatial: bool,
        max_record_size: u32,
    ) -> CacheResult<Self> {
        let header_end = offset
            .checked_add(RECORD_HEADER_SIZE)
            .filter(|&end| end <= page.len())
            .ok_or_else(|| CacheError::corrupt(format!("record offset {} beyond page", offset)))?;
        let header = RecordHeader::parse(&page[offset..header_end], max_record_size)?;
        let body_end = header_end + header.total_size as usize;
        if body_end > page.len() {
            return Err(CacheError::corrupt(format!(
                "record at {} runs past the page end",
                offset
            )));
        }
        Self::decode(header, &page[header_end..body_end], spatial)
    }

    /// Combines an already cached record with a newer one for the same tile.
    ///
    /// Older sub-records come first; a sub-record of the newer record
    /// replaces an older one with the same importance and map type. A named
    /// record is simply replaced.
    pub fn merged_with_older(self, older: CacheRecord) -> CacheRecord {
        match (self, older) {
            (
                CacheRecord::Spatial {
                    empty_importance_mask,
                    parts,
                },
                CacheRecord::Spatial {
                    empty_importance_mask: older_mask,
                    parts: older_parts,
                },
            ) => {
                let mut merged: Vec<SubRecord> = older_parts
                    .into_iter()
                    .filter(|old| !parts.iter().any(|new| new.same_slot(old)))
                    .collect();
                merged.extend(parts);
                CacheRecord::Spatial {
                    empty_importance_mask: empty_importance_mask | older_mask,
                    parts: merged,
                }
            }
            (newer, _) => newer,
        }
    }
}

// ============================================================================
// Index and info files
// ============================================================================

/// Persisted cache state: active page (generation) and format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheInfo {
    pub active_page: u8,
    pub version: u32,
}

impl CacheInfo {
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        let mut out = Vec::with_capacity(5);
        out.write_u8(self.active_page)?;
        out.write_u32::<BigEndian>(self.version)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let active_page = cursor.read_u8()?;
        let version = cursor.read_u32::<BigEndian>()?;
        Ok(CacheInfo {
            active_page,
            version,
        })
    }
}

/// Bytes a flat index takes before its first entry.
pub const FLAT_INDEX_HEADER_SIZE: usize = 4;

/// Encoded size of one flat index entry.
pub fn flat_index_entry_len(tile_id: &str) -> usize {
    1 + 4 + 2 + tile_id.len()
}

pub fn encode_flat_index<'a, I>(entries: I) -> CacheResult<Vec<u8>>
where
    I: ExactSizeIterator<Item = &'a IndexEntry>,
{
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(entries.len() as u32)?;
    for entry in entries {
        out.write_u8(entry.page as u8)?;
        out.write_u32::<BigEndian>(entry.offset)?;
        write_utf(&mut out, &entry.tile_id)?;
    }
    Ok(out)
}

pub fn decode_flat_index(bytes: &[u8]) -> CacheResult<Vec<IndexEntry>> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut entries = Vec::with_capacity(capacity_hint(count));
    for _ in 0..count {
        let page = cursor.read_u8()? as i8;
        let offset = cursor.read_u32::<BigEndian>()?;
        let tile_id = read_utf(&mut cursor)?;
        entries.push(IndexEntry::flat(page, offset, tile_id));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spatial(mask: u16, parts: Vec<SubRecord>) -> CacheRecord {
        CacheRecord::Spatial {
            empty_importance_mask: mask,
            parts,
        }
    }

    #[test]
    fn test_spatial_layout() {
        let record = spatial(
            0x0004,
            vec![
                SubRecord::new(0, TileMapType::Map, vec![1, 2, 3]),
                SubRecord::new(1, TileMapType::Strings, vec![9]),
            ],
        );
        let mut out = Vec::new();
        record.encode_into(&mut out).unwrap();
        assert_eq!(
            out,
            vec![0, 0, 0, 12, 0, 4, 0, 0, 0, 3, 1, 2, 3, 1, 1, 0, 1, 9]
        );
        assert_eq!(out.len(), record.encoded_len());

        let decoded = CacheRecord::decode_at(&out, 0, true, 1000).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_named_layout() {
        let record = CacheRecord::Named {
            empty_importance_mask: 0,
            param: "img".into(),
            data: vec![7, 7],
        };
        let mut out = vec![0xAA];
        record.encode_into(&mut out).unwrap();
        assert_eq!(
            out,
            vec![0xAA, 0, 0, 0, 8, 0, 0, 3, b'i', b'm', b'g', 0, 2, 7, 7]
        );
        assert_eq!(CacheRecord::decode_at(&out, 1, false, 1000).unwrap(), record);
    }

    #[test]
    fn test_header_sanity() {
        let negative = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0];
        assert!(RecordHeader::parse(&negative, 400_000).unwrap_err().is_corruption());
        let huge = [0x00, 0x06, 0x1A, 0x81, 0, 0]; // 400_001
        assert!(RecordHeader::parse(&huge, 400_000).is_err());
        let fine = [0x00, 0x06, 0x1A, 0x80, 0, 3];
        let header = RecordHeader::parse(&fine, 400_000).unwrap();
        assert_eq!(header.total_size, 400_000);
        assert_eq!(header.empty_importance_mask, 3);
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let record = spatial(0, vec![SubRecord::new(0, TileMapType::Map, vec![1; 10])]);
        let mut out = Vec::new();
        record.encode_into(&mut out).unwrap();
        out.truncate(out.len() - 1);
        let err = CacheRecord::decode_at(&out, 0, true, 1000).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_sub_record_overrun_is_corruption() {
        // totalSize 5 but the sub-record claims 4 data bytes
        let bytes = [0, 0, 0, 5, 0, 0, 0, 0, 0, 4, 1];
        let err = CacheRecord::decode_at(&bytes, 0, true, 1000).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_capacity_limits() {
        let record = spatial(0, vec![SubRecord::new(0, TileMapType::Map, vec![0; 70_000])]);
        assert!(matches!(
            record.encode_into(&mut Vec::new()),
            Err(CacheError::Capacity { .. })
        ));
        let named = CacheRecord::Named {
            empty_importance_mask: 0,
            param: "x".repeat(256),
            data: vec![],
        };
        assert!(matches!(named.check_encodable(), Err(CacheError::Capacity { .. })));
    }

    #[test]
    fn test_merge_keeps_older_importances() {
        let older = spatial(0b01, vec![SubRecord::new(1, TileMapType::Map, vec![1])]);
        let newer = spatial(0b10, vec![SubRecord::new(2, TileMapType::Map, vec![2])]);
        let merged = newer.merged_with_older(older);
        assert_eq!(
            merged,
            spatial(
                0b11,
                vec![
                    SubRecord::new(1, TileMapType::Map, vec![1]),
                    SubRecord::new(2, TileMapType::Map, vec![2]),
                ]
            )
        );
    }

    #[test]
    fn test_merge_replaces_same_slot() {
        let older = spatial(
            0,
            vec![
                SubRecord::new(1, TileMapType::Map, vec![1]),
                SubRecord::new(1, TileMapType::Strings, vec![5]),
            ],
        );
        let newer = spatial(0, vec![SubRecord::new(1, TileMapType::Map, vec![9, 9])]);
        match newer.merged_with_older(older) {
            CacheRecord::Spatial { parts, .. } => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0], SubRecord::new(1, TileMapType::Strings, vec![5]));
                assert_eq!(parts[1], SubRecord::new(1, TileMapType::Map, vec![9, 9]));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_flat_index_layout() {
        let entries = vec![IndexEntry::flat(-3, 70_000, "img"), IndexEntry::flat(4, 0, "")];
        let bytes = encode_flat_index(entries.iter()).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        assert_eq!(bytes[4], 0xFD);
        assert_eq!(decode_flat_index(&bytes).unwrap(), entries);
        assert!(decode_flat_index(&bytes[..bytes.len() - 1]).unwrap_err().is_corruption());
        assert_eq!(
            bytes.len(),
            FLAT_INDEX_HEADER_SIZE + flat_index_entry_len("img") + flat_index_entry_len("")
        );
    }

    #[test]
    fn test_cache_info_layout() {
        let info = CacheInfo {
            active_page: 7,
            version: 3,
        };
        let bytes = info.encode().unwrap();
        assert_eq!(bytes, vec![7, 0, 0, 0, 3]);
        assert_eq!(CacheInfo::decode(&bytes).unwrap(), info);
        assert!(CacheInfo::decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_utf_roundtrip_and_limits() {
        let mut out = Vec::new();
        write_utf(&mut out, "Göteborg").unwrap();
        assert_eq!(read_utf(&mut Cursor::new(&out)).unwrap(), "Göteborg");
        assert!(write_utf(&mut Vec::new(), &"a".repeat(70_000)).is_err());
        let invalid = [0, 1, 0xFF];
        assert!(read_utf(&mut Cursor::new(&invalid[..])).unwrap_err().is_corruption());
    }
}
