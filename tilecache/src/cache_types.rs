//! Core types shared by every layer of the tile cache:
//! - Error type and result alias
//! - Statistics snapshot and the atomic counters behind it

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur inside the cache engine.
///
/// These never cross the public backend surface: `FileCache` and
/// `RecordStoreCache` turn them into a miss, a `false`, or an increment of
/// their error counter.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt cache data: {0}")]
    Corrupt(String),

    #[error("Cache format version mismatch (found {found}, expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Record too large: {size} bytes (max {max})")]
    Capacity { size: usize, max: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CacheError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        CacheError::Corrupt(msg.into())
    }

    /// Corruption is local to one record or one index file; everything
    /// else that reaches the storage layer counts as an I/O failure.
    pub fn is_corruption(&self) -> bool {
        match self {
            CacheError::Corrupt(_) => true,
            CacheError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }

    pub fn is_io_failure(&self) -> bool {
        matches!(self, CacheError::Io(_)) && !self.is_corruption()
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time statistics of a cache backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub io_errors: u64,
    pub page_rotations: u64,
    pub stale_evictions: u64,
    pub corrupt_evictions: u64,
    pub loaded_nodes: u64,
    pub index_entries: u64,
}

/// Lock-free counters updated while a backend works.
#[derive(Debug, Default)]
pub(crate) struct CacheStatistics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub rejected_writes: AtomicU64,
    pub io_errors: AtomicU64,
    pub page_rotations: AtomicU64,
    pub stale_evictions: AtomicU64,
    pub corrupt_evictions: AtomicU64,
}

impl CacheStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Builds a snapshot; the gauges come from the backend state.
    pub fn snapshot(&self, loaded_nodes: u64, index_entries: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            page_rotations: self.page_rotations.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            corrupt_evictions: self.corrupt_evictions.load(Ordering::Relaxed),
            loaded_nodes,
            index_entries,
        }
    }
}

/// Lifecycle of a backend. `Disabled` is the logically-closed state the
/// circuit breaker forces after too many I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Closed,
    Open,
    Disabled,
}

impl CacheStatus {
    pub fn is_usable(self) -> bool {
        self == CacheStatus::Open
    }
}
