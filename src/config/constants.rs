//! # Configuration Constants
//!
//! This module centralizes the geometry and sizing constants of the engine.
//! Constants that depend on each other are co-located and tied together with
//! compile-time assertions to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (65536 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, stores the page LSN)
//!       │
//!       ├─> MAX_BUCKET_SIZE_BYTES (16384)
//!       │     Sub-page node regions are this large; a page hosts regions at
//!       │     offsets that are multiples of the region size.
//!       │
//!       └─> ROOT_BUCKET_OFFSET (derived: one region size into the page)
//!             The conventional offset where the root region of every tree
//!             lives, and where splits place freshly allocated regions. The
//!             first region slot is skipped because the page header occupies
//!             the start of the page.
//!
//! CACHE_SHARD_COUNT (64)
//!       │
//!       └─> Page cache lock sharding; pages hash to shards by (file, page).
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `ROOT_BUCKET_OFFSET >= PAGE_HEADER_SIZE` (regions never overlap the header)
//! 2. `ROOT_BUCKET_OFFSET + MAX_BUCKET_SIZE_BYTES <= PAGE_SIZE`
//! 3. `MAX_BUCKET_SIZE_BYTES <= u16::MAX` (region-relative offsets fit in u16)

/// Size of each page in bytes (64KB). The fundamental unit of I/O and caching.
pub const PAGE_SIZE: usize = 65536;

/// Size of the page header in bytes. Holds the page LSN used by recovery.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Size of one bucket region inside a page. Every tree node occupies exactly
/// one region.
pub const MAX_BUCKET_SIZE_BYTES: usize = 16384;

/// Conventional offset of the root bucket region within its page, and of
/// every region handed out for a freshly allocated page. Derived from the
/// region size; readers never assume it and always follow the pointer stored
/// in root metadata.
pub const ROOT_BUCKET_OFFSET: u32 = MAX_BUCKET_SIZE_BYTES as u32;

const _: () = assert!(
    ROOT_BUCKET_OFFSET as usize >= PAGE_HEADER_SIZE,
    "bucket regions must not overlap the page header"
);

const _: () = assert!(
    ROOT_BUCKET_OFFSET as usize + MAX_BUCKET_SIZE_BYTES <= PAGE_SIZE,
    "root bucket region must fit inside a page"
);

const _: () = assert!(
    MAX_BUCKET_SIZE_BYTES <= u16::MAX as usize,
    "region-relative offsets are stored as u16"
);

// ============================================================================
// PAGE CACHE CONFIGURATION
// ============================================================================

/// Number of shards for the page cache.
/// Higher values reduce contention but increase memory overhead.
pub const CACHE_SHARD_COUNT: usize = 64;

/// Default number of cached pages per storage (16MB at 64KB pages).
pub const DEFAULT_CACHE_PAGES: usize = 256;

// ============================================================================
// WAL CONFIGURATION
// ============================================================================

/// File name of the write-ahead log inside a storage directory.
pub const WAL_FILE_NAME: &str = "bonsai.wal";

/// Size of the fixed WAL record header (length, type, checksum).
pub const WAL_RECORD_HEADER_SIZE: usize = 16;

/// Extension of tree container files.
pub const DATA_FILE_EXTENSION: &str = ".bns";
