//! # Atomic Operation Units
//!
//! An atomic operation unit is a WAL-bracketed span: every page change logged
//! between its `AtomicUnitStart` and `AtomicUnitEnd` commits or rolls back
//! together during recovery.
//!
//! ## Per-Thread Units
//!
//! A thread has at most one active unit. Re-entrant starts on the same thread
//! join the existing unit through a counter, so a tree operation invoked from
//! inside a larger storage operation shares the outer unit. The `AtomicUnitEnd`
//! record is written when the counter returns to zero. Different threads'
//! units interleave freely in the log; per-page locking serializes conflicting
//! page writes.
//!
//! ## Nested Rollback
//!
//! When a nested frame ends with rollback, the unit is marked and the mark
//! sticks. If the outermost frame then ends *without* requesting rollback,
//! `end_atomic_operation` still logs a rolled-back end record and surfaces a
//! [`RollbackError`] so the outer caller knows its work is gone.
//!
//! ## DurableComponent
//!
//! [`DurableComponent`] is the WAL-client mixin implemented by every durable
//! structure. Its provided methods wrap mutations in atomic units and emit
//! `UpdatePage` records, honoring the non-transactional durability gate:
//! with `durable_in_non_tx_mode == false` and no storage transaction active,
//! WAL interaction and page-change tracking are disabled entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use eyre::{eyre, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use super::local::PaginatedStorage;
use super::page::{DurablePage, TrackMode};
use super::wal::{Lsn, OperationUnitId, WalRecord};

/// Raised when a nested atomic frame rolled back and the outermost end did
/// not request rollback itself; the outer caller must abort.
#[derive(Debug, Clone)]
pub struct RollbackError;

impl std::fmt::Display for RollbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "operation was rolled back because one or several nested operations rolled back"
        )
    }
}

impl std::error::Error for RollbackError {}

/// One in-flight atomic unit.
#[derive(Debug)]
struct AtomicOperation {
    unit_id: OperationUnitId,
    start_lsn: Lsn,
    start_counter: u32,
    rollback: bool,
}

/// Issues unit ids and brackets per-thread atomic units with start/end
/// records.
pub struct AtomicOperationManager {
    wal: Option<std::sync::Arc<super::wal::Wal>>,
    next_unit_id: AtomicU64,
    current: Mutex<HashMap<ThreadId, AtomicOperation>>,
}

impl AtomicOperationManager {
    /// `first_unit_id` seeds the generator; callers pass one past the highest
    /// id found in an existing log so ids stay unique across restarts.
    pub fn new(wal: Option<std::sync::Arc<super::wal::Wal>>, first_unit_id: u64) -> Self {
        Self {
            wal,
            next_unit_id: AtomicU64::new(first_unit_id),
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Opens (or re-enters) the current thread's unit.
    pub fn start_atomic_operation(&self) -> Result<()> {
        let thread_id = thread::current().id();
        let mut current = self.current.lock();

        if !current.contains_key(&thread_id) {
            let Some(wal) = &self.wal else {
                return Ok(());
            };

            let unit_id = OperationUnitId(self.next_unit_id.fetch_add(1, Ordering::Relaxed));
            let start_lsn = wal.log(&WalRecord::AtomicUnitStart {
                rollback_supported: true,
                unit_id,
            })?;

            current.insert(
                thread_id,
                AtomicOperation {
                    unit_id,
                    start_lsn,
                    start_counter: 0,
                    rollback: false,
                },
            );
        }

        if let Some(operation) = current.get_mut(&thread_id) {
            operation.start_counter += 1;
        }

        Ok(())
    }

    /// Leaves the current thread's unit. Returns `true` when this call closed
    /// the outermost frame and logged the end record.
    pub fn end_atomic_operation(&self, rollback: bool) -> Result<bool> {
        let thread_id = thread::current().id();
        let mut current = self.current.lock();

        let Some(operation) = current.get_mut(&thread_id) else {
            return Ok(false);
        };

        if rollback {
            operation.rollback = true;
        }

        debug_assert!(operation.start_counter > 0, "unbalanced atomic operation end");
        operation.start_counter -= 1;
        if operation.start_counter > 0 {
            return Ok(false);
        }

        let operation = current.remove(&thread_id).unwrap();
        drop(current);

        if let Some(wal) = &self.wal {
            wal.log(&WalRecord::AtomicUnitEnd {
                unit_id: operation.unit_id,
                rollback: operation.rollback,
            })?;
        }

        if operation.rollback && !rollback {
            return Err(eyre::Report::new(RollbackError));
        }

        Ok(true)
    }

    /// The current thread's unit, if one is open.
    pub fn current_operation(&self) -> Option<(OperationUnitId, Lsn)> {
        let current = self.current.lock();
        current
            .get(&thread::current().id())
            .map(|op| (op.unit_id, op.start_lsn))
    }
}

/// WAL-client mixin for durable structures.
///
/// Implementors supply their storage handle and durability flag; the provided
/// methods implement the atomic-unit protocol and page-change logging.
pub trait DurableComponent {
    fn storage(&self) -> &PaginatedStorage;

    /// Whether mutations outside a storage transaction still go through the
    /// WAL.
    fn durable_in_non_tx_mode(&self) -> bool;

    fn durability_enabled(&self) -> bool {
        self.storage().wal().is_some()
            && (self.durable_in_non_tx_mode() || self.storage().transaction_active())
    }

    fn start_durable_operation(&self) -> Result<()> {
        if !self.durability_enabled() {
            return Ok(());
        }
        self.storage().atomic_operations().start_atomic_operation()
    }

    fn end_durable_operation(&self, rollback: bool) -> Result<()> {
        if !self.durability_enabled() {
            return Ok(());
        }
        self.storage()
            .atomic_operations()
            .end_atomic_operation(rollback)?;
        Ok(())
    }

    /// Ends the current unit with rollback, suppressing (but logging)
    /// secondary failures so the original error stays visible to the caller.
    fn rollback_durable_operation(&self) {
        if let Err(secondary) = self.end_durable_operation(true) {
            log::error!("error during atomic operation rollback: {secondary:#}");
        }
    }

    fn track_mode(&self) -> TrackMode {
        if self.durability_enabled() {
            TrackMode::Full
        } else {
            TrackMode::None
        }
    }

    /// Drains `page`'s buffered deltas into an `UpdatePage` record and stores
    /// the assigned LSN back on the page, linking the page's record chain.
    ///
    /// Pages freshly allocated inside the current operation link back to the
    /// unit's start LSN instead of their (meaningless) stored LSN.
    fn log_page_changes(
        &self,
        page: &mut DurablePage<'_>,
        file_id: u32,
        page_index: u64,
        is_new_page: bool,
    ) -> Result<()> {
        if !self.durability_enabled() {
            return Ok(());
        }
        let Some(wal) = self.storage().wal() else {
            return Ok(());
        };

        let changes = page.take_changes();
        if changes.is_empty() {
            return Ok(());
        }

        let (unit_id, start_lsn) = self
            .storage()
            .atomic_operations()
            .current_operation()
            .ok_or_else(|| eyre!("page changes logged outside an atomic operation"))?;

        let prev_lsn = if is_new_page {
            start_lsn
        } else {
            Lsn(page.lsn())
        };

        let lsn = wal.log(&WalRecord::UpdatePage {
            file_id,
            page_index,
            unit_id,
            prev_lsn,
            changes,
        })?;
        page.set_lsn(lsn.0);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::Wal;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn manager_with_wal(dir: &std::path::Path) -> (AtomicOperationManager, Arc<Wal>) {
        let wal = Arc::new(Wal::create(&dir.join("test.wal")).unwrap());
        (AtomicOperationManager::new(Some(wal.clone()), 1), wal)
    }

    #[test]
    fn outermost_end_logs_start_and_end_records() {
        let dir = tempdir().unwrap();
        let (manager, wal) = manager_with_wal(dir.path());

        manager.start_atomic_operation().unwrap();
        let (unit_id, start_lsn) = manager.current_operation().unwrap();
        assert_eq!(start_lsn, Lsn(1));

        let closed = manager.end_atomic_operation(false).unwrap();
        assert!(closed);
        assert!(manager.current_operation().is_none());

        let records: Vec<_> = wal.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].1,
            WalRecord::AtomicUnitEnd {
                unit_id,
                rollback: false
            }
        );
    }

    #[test]
    fn nested_starts_share_one_unit() {
        let dir = tempdir().unwrap();
        let (manager, wal) = manager_with_wal(dir.path());

        manager.start_atomic_operation().unwrap();
        let outer = manager.current_operation().unwrap();

        manager.start_atomic_operation().unwrap();
        assert_eq!(manager.current_operation().unwrap(), outer);

        assert!(!manager.end_atomic_operation(false).unwrap());
        assert!(manager.current_operation().is_some());

        assert!(manager.end_atomic_operation(false).unwrap());
        assert_eq!(wal.read_records().unwrap().len(), 2);
    }

    #[test]
    fn nested_rollback_surfaces_at_outermost_end() {
        let dir = tempdir().unwrap();
        let (manager, wal) = manager_with_wal(dir.path());

        manager.start_atomic_operation().unwrap();
        manager.start_atomic_operation().unwrap();

        assert!(!manager.end_atomic_operation(true).unwrap());

        let err = manager.end_atomic_operation(false).unwrap_err();
        assert!(err.downcast_ref::<RollbackError>().is_some());

        // The end record still went out, marked rolled back.
        let records = wal.read_records().unwrap();
        match &records[1].1 {
            WalRecord::AtomicUnitEnd { rollback, .. } => assert!(rollback),
            other => panic!("expected AtomicUnitEnd, got {:?}", other),
        }
    }

    #[test]
    fn explicit_rollback_does_not_error() {
        let dir = tempdir().unwrap();
        let (manager, _wal) = manager_with_wal(dir.path());

        manager.start_atomic_operation().unwrap();
        assert!(manager.end_atomic_operation(true).unwrap());
    }

    #[test]
    fn without_wal_units_are_noops() {
        let manager = AtomicOperationManager::new(None, 1);

        manager.start_atomic_operation().unwrap();
        assert!(manager.current_operation().is_none());
        assert!(!manager.end_atomic_operation(false).unwrap());
    }

    #[test]
    fn unit_ids_are_unique_and_ascending() {
        let dir = tempdir().unwrap();
        let (manager, _wal) = manager_with_wal(dir.path());

        manager.start_atomic_operation().unwrap();
        let (first, _) = manager.current_operation().unwrap();
        manager.end_atomic_operation(false).unwrap();

        manager.start_atomic_operation().unwrap();
        let (second, _) = manager.current_operation().unwrap();
        manager.end_atomic_operation(false).unwrap();

        assert!(second.0 > first.0);
    }
}
