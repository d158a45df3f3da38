//! # Bonsai - Sub-Page B+-Tree Storage Engine
//!
//! Bonsai is a durable, disk-backed ordered-map engine that packs many
//! independent B+-trees into a single paginated file. Tree nodes are 16KB
//! *bucket regions* inside 64KB pages, so thousands of small collections
//! (per-record link sets, adjacency maps, secondary dictionaries) coexist
//! cheaply, each addressed by a `(page, offset)` root pointer instead of
//! occupying a whole file.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bonsai::{BonsaiTree, Int64Serializer, PaginatedStorage, Utf8Serializer};
//!
//! let storage = PaginatedStorage::create("./data".as_ref())?;
//! let tree = BonsaiTree::create("links", -1, Int64Serializer, Utf8Serializer, storage)?;
//!
//! tree.put(42, "to:#8:17".to_string())?;
//! assert_eq!(tree.get(&42)?, Some("to:#8:17".to_string()));
//!
//! for value in tree.get_values_between(&0, true, &100, true, -1)? {
//!     println!("{value}");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Tree API (BonsaiTree)        │
//! ├─────────────────────────────────────┤
//! │  Buckets (sub-page node layout)     │
//! ├──────────────────┬──────────────────┤
//! │   Disk Cache     │  Atomic Units    │
//! │  (SIEVE, pins)   │  (per thread)    │
//! ├──────────────────┴──────────────────┤
//! │  Pages (delta tracking) + WAL       │
//! └─────────────────────────────────────┘
//! ```
//!
//! Every mutation runs as an atomic operation unit: page changes are logged
//! to the write-ahead log before pages leave their exclusive locks, and
//! opening a storage replays completed units (and reverts torn ones) before
//! anything else runs.
//!
//! ## Module Overview
//!
//! - [`tree`]: the B+-tree — buckets, pointers, keys, codecs, the map API
//! - [`storage`]: pages, disk cache, write-ahead log, atomic operations
//! - [`records`]: record-payload codecs of the surrounding storage layer
//! - [`encoding`]: shared byte-level encoding utilities
//! - [`config`]: geometry and sizing constants

pub mod config;
pub mod encoding;
pub mod records;
pub mod storage;
pub mod tree;

pub use storage::{PaginatedStorage, RollbackError};
pub use tree::{
    BinarySerializer, BonsaiTree, BucketPointer, CompositeKey, CompositeKeySerializer,
    Int64Serializer, KeyPart, TreeConfig, TreeEntry, Utf8Serializer,
};
