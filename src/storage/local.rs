//! # Paginated Storage
//!
//! One storage instance owns a directory: the tree container files inside it,
//! the page cache over them, the write-ahead log, and the atomic-operation
//! manager that brackets mutations. Trees are handed an `Arc` of the storage
//! and reach every collaborator through it.
//!
//! ## Crash Recovery
//!
//! Opening an existing directory replays the log before anything else runs:
//!
//! 1. Scan records (the torn tail was already trimmed by the WAL open).
//! 2. Units with a non-rollback `AtomicUnitEnd` are committed; everything
//!    else (rolled back or missing its end record) is not.
//! 3. **Redo pass**, forward in log order: apply the post-image deltas of
//!    committed units to pages whose stored LSN predates the record.
//! 4. **Undo pass**, backward: revert deltas of non-committed units that did
//!    reach the page (stored LSN at or past the record), walking each page's
//!    LSN back along the record's `prev_lsn` chain.
//! 5. Flush, leaving the data files consistent with the last complete unit.
//!
//! The LSN comparisons make both passes idempotent, so a crash during
//! recovery is handled by simply recovering again.
//!
//! ## Storage Transactions
//!
//! The surrounding database layer marks the threads that run inside one of
//! its transactions. Durable components consult that marker: a component
//! configured as non-durable outside transactions skips the WAL entirely for
//! unmarked threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use super::atomic::AtomicOperationManager;
use super::cache::DiskCache;
use super::page::PageHeader;
use super::wal::{Wal, WalRecord};
use crate::config::{DATA_FILE_EXTENSION, DEFAULT_CACHE_PAGES, WAL_FILE_NAME};

pub struct PaginatedStorage {
    dir: PathBuf,
    cache: DiskCache,
    wal: Option<Arc<Wal>>,
    atomic_operations: AtomicOperationManager,
    tx_threads: Mutex<HashMap<ThreadId, u32>>,
}

impl PaginatedStorage {
    /// Creates a fresh storage directory with a write-ahead log.
    pub fn create(dir: &Path) -> Result<Arc<Self>> {
        Self::create_with_cache(dir, DEFAULT_CACHE_PAGES)
    }

    pub fn create_with_cache(dir: &Path, cache_pages: usize) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create storage directory {:?}", dir))?;

        let wal = Arc::new(Wal::create(&dir.join(WAL_FILE_NAME))?);

        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            cache: DiskCache::new(dir.to_path_buf(), cache_pages),
            wal: Some(wal.clone()),
            atomic_operations: AtomicOperationManager::new(Some(wal), 1),
            tx_threads: Mutex::new(HashMap::new()),
        }))
    }

    /// Creates a storage without a log. Mutations are not crash-recoverable.
    pub fn create_without_wal(dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create storage directory {:?}", dir))?;

        Ok(Arc::new(Self {
            dir: dir.to_path_buf(),
            cache: DiskCache::new(dir.to_path_buf(), DEFAULT_CACHE_PAGES),
            wal: None,
            atomic_operations: AtomicOperationManager::new(None, 1),
            tx_threads: Mutex::new(HashMap::new()),
        }))
    }

    /// Opens an existing storage directory, replaying the log over the data
    /// files before returning.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        ensure!(dir.is_dir(), "storage directory {:?} does not exist", dir);

        let wal = Arc::new(Wal::open(&dir.join(WAL_FILE_NAME))?);
        let first_unit_id = wal.max_unit_id()?.map_or(1, |max| max + 1);

        let storage = Arc::new(Self {
            dir: dir.to_path_buf(),
            cache: DiskCache::new(dir.to_path_buf(), DEFAULT_CACHE_PAGES),
            wal: Some(wal.clone()),
            atomic_operations: AtomicOperationManager::new(Some(wal), first_unit_id),
            tx_threads: Mutex::new(HashMap::new()),
        });

        // Recovery addresses pages by (file id, page); ids derive from names,
        // so opening every data file up front resolves them all.
        for entry in std::fs::read_dir(dir).wrap_err("failed to list storage directory")? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(DATA_FILE_EXTENSION) {
                storage.cache.open_file(&name)?;
            }
        }

        storage.recover()?;

        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }

    pub fn atomic_operations(&self) -> &AtomicOperationManager {
        &self.atomic_operations
    }

    /// Marks the current thread as running inside a storage transaction.
    /// Nestable; each `begin` pairs with one `end`.
    pub fn begin_transaction(&self) {
        let mut threads = self.tx_threads.lock();
        *threads.entry(thread::current().id()).or_insert(0) += 1;
    }

    pub fn end_transaction(&self) {
        let mut threads = self.tx_threads.lock();
        let id = thread::current().id();
        if let Some(depth) = threads.get_mut(&id) {
            *depth -= 1;
            if *depth == 0 {
                threads.remove(&id);
            }
        }
    }

    pub fn transaction_active(&self) -> bool {
        self.tx_threads.lock().contains_key(&thread::current().id())
    }

    /// Writes all dirty pages back and truncates the log: the data files
    /// become the sole authority.
    pub fn checkpoint(&self) -> Result<()> {
        self.cache.flush_buffer()?;
        if let Some(wal) = &self.wal {
            wal.truncate()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.checkpoint()
    }

    /// Replays the log over the data files. Returns the number of page-delta
    /// records applied (redo) or reverted (undo).
    fn recover(&self) -> Result<usize> {
        let Some(wal) = &self.wal else { return Ok(0) };

        let records = wal.read_records()?;
        if records.is_empty() {
            return Ok(0);
        }

        let committed: HashSet<u64> = records
            .iter()
            .filter_map(|(_, record)| match record {
                WalRecord::AtomicUnitEnd {
                    unit_id,
                    rollback: false,
                } => Some(unit_id.0),
                _ => None,
            })
            .collect();

        let known_files: HashSet<u32> =
            self.cache.open_files().into_iter().map(|(id, _)| id).collect();

        let mut applied = 0usize;

        for (lsn, record) in &records {
            let WalRecord::UpdatePage {
                file_id,
                page_index,
                unit_id,
                changes,
                ..
            } = record
            else {
                continue;
            };
            if !committed.contains(&unit_id.0) {
                continue;
            }
            if !known_files.contains(file_id) {
                log::warn!("skipping log record for unknown file id {}", file_id);
                continue;
            }

            self.cache.grow(*file_id, page_index + 1)?;
            let entry = self.cache.load(*file_id, *page_index, false)?;
            {
                let mut data = entry.pointer().acquire_exclusive();
                if PageHeader::from_bytes(&data)?.lsn() < lsn.0 {
                    changes.apply_redo(&mut data)?;
                    PageHeader::from_bytes_mut(&mut data)?.set_lsn(lsn.0);
                    applied += 1;
                }
            }
            entry.mark_dirty();
            self.cache.release(&entry);
        }

        for (lsn, record) in records.iter().rev() {
            let WalRecord::UpdatePage {
                file_id,
                page_index,
                unit_id,
                prev_lsn,
                changes,
            } = record
            else {
                continue;
            };
            if committed.contains(&unit_id.0) || !known_files.contains(file_id) {
                continue;
            }

            self.cache.grow(*file_id, page_index + 1)?;
            let entry = self.cache.load(*file_id, *page_index, false)?;
            {
                let mut data = entry.pointer().acquire_exclusive();
                // The page carries this record's effect only if its stored
                // LSN reached the record; walking back along prev_lsn keeps
                // the chain consistent for the next undo step.
                if PageHeader::from_bytes(&data)?.lsn() >= lsn.0 {
                    changes.apply_undo(&mut data)?;
                    PageHeader::from_bytes_mut(&mut data)?.set_lsn(prev_lsn.0);
                    applied += 1;
                }
            }
            entry.mark_dirty();
            self.cache.release(&entry);
        }

        self.cache.flush_buffer()?;

        Ok(applied)
    }
}
