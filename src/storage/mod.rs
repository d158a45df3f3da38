//! # Storage Module
//!
//! The paginated storage layer: fixed-size pages in per-tree container
//! files, a sharded page cache in front of them, a write-ahead log that makes
//! every mutation crash-recoverable, and the atomic-operation protocol that
//! groups page changes into all-or-nothing units.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │           PaginatedStorage            │
//! │  directory · transactions · recovery  │
//! ├───────────┬───────────┬───────────────┤
//! │ DiskCache │    Wal    │ AtomicOpMgr   │
//! │ pages +   │ records + │ per-thread    │
//! │ eviction  │ LSNs      │ units         │
//! ├───────────┴───────────┴───────────────┤
//! │    DurablePage (delta tracking)       │
//! └───────────────────────────────────────┘
//! ```
//!
//! Durable structures implement [`DurableComponent`] and speak to all three
//! collaborators through its provided methods: wrap the mutation in an
//! atomic unit, mutate pages through [`DurablePage`] views, and hand each
//! page's deltas to [`DurableComponent::log_page_changes`] before the page
//! leaves its exclusive lock.
//!
//! ## Module Organization
//!
//! - `page`: page header (LSN) and delta-tracked page views
//! - `cache`: SIEVE page cache with lock sharding and pin counts
//! - `wal`: record format, append-only log, tail-tolerant scans
//! - `atomic`: atomic operation units and the durable-component mixin
//! - `local`: the storage facade owning a directory, with crash recovery

mod atomic;
mod cache;
mod local;
mod page;
mod wal;

pub use atomic::{AtomicOperationManager, DurableComponent, RollbackError};
pub use cache::{CacheEntry, CachePointer, DiskCache, PageKey};
pub use local::PaginatedStorage;
pub use page::{DurablePage, PageChanges, PageDelta, PageHeader, TrackMode};
pub use wal::{Lsn, OperationUnitId, Wal, WalRecord};
