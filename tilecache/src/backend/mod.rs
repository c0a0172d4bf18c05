//! Cache backends implementing [`TileCacheProvider`](crate::TileCacheProvider).

pub mod file_cache;
pub mod record_store_cache;

pub use file_cache::FileCache;
pub use record_store_cache::RecordStoreCache;

use crate::cache_types::{CacheError, CacheResult, CacheStatistics, CacheStatus};
use crate::storage::codec::{CacheRecord, SubRecord};
use crate::tile_key::{TileBuffer, TileKey};

/// Lifecycle state and I/O failure counter of a backend.
///
/// The counter only goes back to zero on a successful open. Once it
/// reaches the limit the backend is disabled and performs no more I/O.
#[derive(Debug)]
pub(crate) struct Health {
    pub status: CacheStatus,
    pub error_count: u32,
}

impl Health {
    pub fn new() -> Self {
        Health {
            status: CacheStatus::Closed,
            error_count: 0,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status.is_usable()
    }

    pub fn is_open(&self) -> bool {
        self.status == CacheStatus::Open
    }

    pub fn opened(&mut self) {
        self.status = CacheStatus::Open;
        self.error_count = 0;
    }

    /// Accounts for a failed operation. Only I/O failures count towards
    /// `max_errors`.
    pub fn record(
        &mut self,
        backend: &str,
        max_errors: u32,
        stats: &CacheStatistics,
        error: &CacheError,
    ) {
        if !error.is_io_failure() {
            log::warn!("{} operation failed: {}", backend, error);
            return;
        }
        self.error_count += 1;
        CacheStatistics::incr(&stats.io_errors);
        log::warn!(
            "{} I/O failure {}/{}: {}",
            backend,
            self.error_count,
            max_errors,
            error
        );
        if self.error_count >= max_errors && self.status == CacheStatus::Open {
            self.status = CacheStatus::Disabled;
            log::error!("{} disabled after {} I/O failures", backend, self.error_count);
        }
    }
}

/// Builds the record stored for `tile` from the buffers handed to a write.
///
/// A spatial tile stores one sub-record per buffer; a named tile stores
/// exactly one buffer.
pub(crate) fn build_record(
    tile: &TileKey,
    buffers: &[TileBuffer],
    empty_importance_mask: u16,
) -> CacheResult<CacheRecord> {
    let tile_id = tile.tile_id();
    if let Some(stranger) = buffers.iter().find(|b| b.key.tile_id() != tile_id) {
        return Err(CacheError::InvalidOperation(format!(
            "buffer {} does not belong to tile {}",
            stranger.key, tile_id
        )));
    }

    if tile.is_spatial() {
        let parts = buffers
            .iter()
            .filter_map(|b| {
                b.key
                    .params()
                    .map(|p| SubRecord::new(p.importance, p.map_type, b.data.clone()))
            })
            .collect();
        Ok(CacheRecord::Spatial {
            empty_importance_mask,
            parts,
        })
    } else {
        match buffers {
            [buffer] => Ok(CacheRecord::Named {
                empty_importance_mask,
                param: buffer.key.param_string(),
                data: buffer.data.clone(),
            }),
            _ => Err(CacheError::InvalidOperation(format!(
                "named tile {} takes exactly one buffer, got {}",
                tile_id,
                buffers.len()
            ))),
        }
    }
}

/// Splits a decoded record into `(param string, data)` pairs, resolving
/// each sub-record to the parameter string of its sibling key.
pub(crate) fn record_buffers(key: &TileKey, record: CacheRecord) -> Vec<(String, Vec<u8>)> {
    match record {
        CacheRecord::Spatial { parts, .. } => parts
            .into_iter()
            .map(|part| {
                let param = key
                    .with_importance(part.importance, part.map_type)
                    .param_string();
                (param, part.data)
            })
            .collect(),
        CacheRecord::Named { param, data, .. } => vec![(param, data)],
    }
}
