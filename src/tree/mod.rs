//! # Bonsai Tree Module
//!
//! A durable B+-tree whose nodes are 16KB sub-regions of 64KB pages, so that
//! thousands of small collections (per-record link sets, secondary maps) can
//! share one container file instead of each occupying its own. Every tree is
//! identified by a `(page, offset)` root pointer that stays stable for the
//! tree's lifetime.
//!
//! ## Component Map
//!
//! - [`pointer`]: `BucketPointer`, the `(page, offset)` node address
//! - [`key`]: key ordering, composite keys, partial-search sentinels
//! - [`serializer`]: byte codecs for keys and values with stable ids
//! - [`bucket`]: the binary node layout and per-node operations
//! - [`tree`]: the ordered-map structure tying buckets to the cache and WAL
//!
//! ## Durability Contract
//!
//! Mutations run inside atomic operation units: each touched page's deltas
//! are logged before the page lock is released, and recovery replays whole
//! units. Lookups and scans never touch the log.

mod bucket;
mod key;
mod pointer;
mod serializer;
mod tree;

pub use bucket::{BonsaiBucket, BonsaiBucketMut, SearchResult, TreeEntry, MAX_ENTRY_SIZE};
pub use key::{CompositeKey, KeyPart, PartialSearchMode, SentinelBound, TreeKey};
pub use pointer::BucketPointer;
pub use serializer::{BinarySerializer, CompositeKeySerializer, Int64Serializer, Utf8Serializer};
pub use tree::{BonsaiTree, TreeConfig};
