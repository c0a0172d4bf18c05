//! Disk-backed quad-tree indexing spatial tile records.
//!
//! The tree partitions the coordinate space into leaves holding at most
//! `max_items_per_node` index entries. Leaf contents live in one file per
//! node and are loaded lazily on first access; the node boundaries are
//! persisted separately so a tree can be reopened without touching any
//! entry file.

pub mod persistence;
mod qt_impl;
pub mod qt_types;

pub use qt_impl::QuadTree;
pub use qt_types::{is_stale, IndexEntry, NodeId, QuadNode};
