//! # Disk Cache with SIEVE Eviction and Lock Sharding
//!
//! The disk cache is the only path between tree code and file bytes. It hands
//! out pinned page entries whose buffers sit behind per-page reader/writer
//! locks, tracks dirty pages, and writes them back on eviction and on
//! explicit flush.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! A sequential scan through a large tree would evict the whole cache under
//! LRU ordering. SIEVE keeps a `visited` flag per entry and an eviction hand:
//!
//! - On access: set `visited`
//! - On eviction: entries with `visited` get a second chance (flag cleared,
//!   hand advances); unvisited, unpinned entries are evicted
//!
//! ## Lock Sharding
//!
//! Pages hash to one of 64 shards, each guarding its own entry table, so
//! concurrent loads on unrelated pages rarely contend:
//!
//! ```text
//! DiskCache
//! ├── Shard 0:  RwLock<CacheShard>
//! ├── ...
//! └── Shard 63: RwLock<CacheShard>
//! ```
//!
//! ## Pin Protocol
//!
//! `load`/`allocate_new_page` return pinned entries; pinned pages are never
//! evicted. Callers `release` the entry once the page guard is dropped.
//! Page content is reached through the entry's [`CachePointer`]: shared
//! guards for reads, an exclusive guard for writes. The exclusive guard is
//! held until the mutation's WAL record has been logged and the page marked
//! dirty, which is what keeps invariant "log before unlock" enforceable by
//! construction.
//!
//! ## File Identity
//!
//! File ids are the CRC-32 of the file name, making them stable across
//! restarts without a catalog file; `open_file` fails loudly on the
//! (unlikely) collision. WAL records reference pages by `(file_id, page)` and
//! recovery re-derives the same ids from the directory listing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{CACHE_SHARD_COUNT, PAGE_SIZE};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: u32,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: u32, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

struct FileState {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    page_count: AtomicU64,
}

impl FileState {
    fn read_page(&self, page_index: u64) -> Result<Box<[u8]>> {
        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let offset = page_index * PAGE_SIZE as u64;

        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if offset < len {
            let available = ((len - offset) as usize).min(PAGE_SIZE);
            file.seek(SeekFrom::Start(offset))
                .wrap_err_with(|| format!("failed to seek to page {} of {}", page_index, self.name))?;
            file.read_exact(&mut buf[..available])
                .wrap_err_with(|| format!("failed to read page {} of {}", page_index, self.name))?;
        }
        // Pages past the flushed end of the file are logically zero.

        Ok(buf)
    }

    fn write_page(&self, page_index: u64, data: &[u8]) -> Result<()> {
        let offset = page_index * PAGE_SIZE as u64;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("failed to seek to page {} of {}", page_index, self.name))?;
        file.write_all(data)
            .wrap_err_with(|| format!("failed to write page {} of {}", page_index, self.name))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_all()
            .wrap_err_with(|| format!("failed to sync {}", self.name))
    }
}

/// Lockable handle to one page's bytes.
pub struct CachePointer {
    data: RwLock<Box<[u8]>>,
}

impl CachePointer {
    fn new(data: Box<[u8]>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Shared access for readers operating under the owning tree's lock.
    pub fn acquire_shared(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    /// Exclusive access for writers. Hold the guard until the change has been
    /// logged and the entry marked dirty; dropping the guard releases the
    /// lock.
    pub fn acquire_exclusive(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.data.write()
    }
}

/// A pinned cache entry for one page.
pub struct CacheEntry {
    key: PageKey,
    file: Arc<FileState>,
    pointer: CachePointer,
    visited: AtomicBool,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl CacheEntry {
    fn new(key: PageKey, file: Arc<FileState>, data: Box<[u8]>) -> Self {
        Self {
            key,
            file,
            pointer: CachePointer::new(data),
            visited: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn page_index(&self) -> u64 {
        self.key.page_index
    }

    pub fn file_id(&self) -> u32 {
        self.key.file_id
    }

    pub fn pointer(&self) -> &CachePointer {
        &self.pointer
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on unpinned page");
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn clear_visited(&self) -> bool {
        self.visited.swap(false, Ordering::AcqRel)
    }

    /// Writes the page back to its file if dirty. Takes a shared guard, so an
    /// in-flight writer finishes (and logs) before the bytes leave the cache.
    fn write_back(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        let data = self.pointer.acquire_shared();
        self.file.write_page(self.key.page_index, &data)?;
        self.clear_dirty();
        Ok(())
    }
}

struct CacheShard {
    entries: Vec<Arc<CacheEntry>>,
    index: HashMap<PageKey, usize>,
    hand: usize,
}

impl CacheShard {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            hand: 0,
        }
    }

    fn get(&self, key: &PageKey) -> Option<&Arc<CacheEntry>> {
        self.index.get(key).map(|&idx| &self.entries[idx])
    }

    fn insert(&mut self, entry: Arc<CacheEntry>) {
        let key = entry.key;
        let idx = self.entries.len();
        self.entries.push(entry);
        self.index.insert(key, idx);
    }

    fn remove_at(&mut self, idx: usize) -> Arc<CacheEntry> {
        let entry = self.entries.swap_remove(idx);
        self.index.remove(&entry.key);

        if idx < self.entries.len() {
            let moved_key = self.entries[idx].key;
            self.index.insert(moved_key, idx);
        }

        if self.hand >= self.entries.len() {
            self.hand = 0;
        }

        entry
    }

    /// SIEVE scan: visited entries get a second chance, pinned entries are
    /// skipped, the first cold unpinned entry is removed and returned.
    fn evict(&mut self) -> Option<Arc<CacheEntry>> {
        if self.entries.is_empty() {
            return None;
        }

        let mut steps = 0;
        let max_steps = self.entries.len() * 2;

        while steps < max_steps {
            let idx = self.hand;
            let entry = &self.entries[idx];

            if entry.is_pinned() || entry.clear_visited() {
                self.hand = (self.hand + 1) % self.entries.len();
                steps += 1;
                continue;
            }

            return Some(self.remove_at(idx));
        }

        None
    }
}

/// Sharded page cache over the files of one storage directory.
pub struct DiskCache {
    dir: PathBuf,
    shards: Vec<RwLock<CacheShard>>,
    shard_capacity: usize,
    files: RwLock<HashMap<u32, Arc<FileState>>>,
}

impl DiskCache {
    pub fn new(dir: PathBuf, capacity_pages: usize) -> Self {
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|_| RwLock::new(CacheShard::new()))
            .collect();

        Self {
            dir,
            shards,
            shard_capacity: (capacity_pages / CACHE_SHARD_COUNT).max(4),
            files: RwLock::new(HashMap::new()),
        }
    }

    fn shard_for(&self, key: &PageKey) -> &RwLock<CacheShard> {
        let hash = (key.file_id as u64)
            .wrapping_mul(31)
            .wrapping_add(key.page_index);
        &self.shards[(hash % CACHE_SHARD_COUNT as u64) as usize]
    }

    fn file_state(&self, file_id: u32) -> Result<Arc<FileState>> {
        self.files
            .read()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| eyre::eyre!("file id {} is not open", file_id))
    }

    /// Stable id for a file name.
    pub fn file_id_for(name: &str) -> u32 {
        CRC32.checksum(name.as_bytes())
    }

    /// Opens (creating if absent) a file in the storage directory and returns
    /// its id. Reopening an already-open name returns the same id.
    pub fn open_file(&self, name: &str) -> Result<u32> {
        let file_id = Self::file_id_for(name);

        let mut files = self.files.write();
        if let Some(existing) = files.get(&file_id) {
            ensure!(
                existing.name == name,
                "file id collision: {:?} and {:?} both hash to {}",
                existing.name,
                name,
                file_id
            );
            return Ok(file_id);
        }

        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open data file {:?}", path))?;

        let len = file.metadata()?.len();
        let page_count = len.div_ceil(PAGE_SIZE as u64);

        files.insert(
            file_id,
            Arc::new(FileState {
                name: name.to_string(),
                path,
                file: Mutex::new(file),
                page_count: AtomicU64::new(page_count),
            }),
        );

        Ok(file_id)
    }

    /// Names of the data files currently open, with their ids.
    pub fn open_files(&self) -> Vec<(u32, String)> {
        self.files
            .read()
            .iter()
            .map(|(&id, state)| (id, state.name.clone()))
            .collect()
    }

    pub fn page_count(&self, file_id: u32) -> Result<u64> {
        Ok(self.file_state(file_id)?.page_count.load(Ordering::Acquire))
    }

    /// Extends the logical page count. Used by recovery when the log
    /// references pages that never reached the file.
    pub fn grow(&self, file_id: u32, page_count: u64) -> Result<()> {
        self.file_state(file_id)?
            .page_count
            .fetch_max(page_count, Ordering::AcqRel);
        Ok(())
    }

    /// Appends a zeroed page to the file and returns it pinned.
    pub fn allocate_new_page(&self, file_id: u32) -> Result<Arc<CacheEntry>> {
        let state = self.file_state(file_id)?;
        let page_index = state.page_count.fetch_add(1, Ordering::AcqRel);
        let key = PageKey::new(file_id, page_index);

        let entry = Arc::new(CacheEntry::new(
            key,
            state,
            vec![0u8; PAGE_SIZE].into_boxed_slice(),
        ));
        entry.pin();

        let mut shard = self.shard_for(&key).write();
        self.make_room(&mut shard)?;
        shard.insert(entry.clone());

        Ok(entry)
    }

    /// Loads a page, reading it from disk on a miss. The returned entry is
    /// pinned; callers must `release` it.
    pub fn load(&self, file_id: u32, page_index: u64, _check_pinned: bool) -> Result<Arc<CacheEntry>> {
        let state = self.file_state(file_id)?;
        ensure!(
            page_index < state.page_count.load(Ordering::Acquire),
            "page {} out of bounds for {} (page_count={})",
            page_index,
            state.name,
            state.page_count.load(Ordering::Acquire)
        );

        let key = PageKey::new(file_id, page_index);
        let shard_lock = self.shard_for(&key);

        {
            let shard = shard_lock.read();
            if let Some(entry) = shard.get(&key) {
                entry.pin();
                entry.mark_visited();
                return Ok(entry.clone());
            }
        }

        let mut shard = shard_lock.write();
        // Another thread may have loaded it while we upgraded.
        if let Some(entry) = shard.get(&key) {
            entry.pin();
            entry.mark_visited();
            return Ok(entry.clone());
        }

        let data = state.read_page(page_index)?;
        let entry = Arc::new(CacheEntry::new(key, state, data));
        entry.pin();

        self.make_room(&mut shard)?;
        shard.insert(entry.clone());

        Ok(entry)
    }

    fn make_room(&self, shard: &mut CacheShard) -> Result<()> {
        while shard.entries.len() >= self.shard_capacity {
            match shard.evict() {
                Some(victim) => {
                    if let Err(e) = victim.write_back() {
                        // Put the page back rather than lose a dirty buffer.
                        shard.insert(victim);
                        return Err(e);
                    }
                }
                // Every entry pinned: admit over capacity.
                None => break,
            }
        }
        Ok(())
    }

    /// Unpins a previously loaded entry.
    pub fn release(&self, entry: &CacheEntry) {
        entry.unpin();
    }

    fn purge_file(&self, file_id: u32, check_pinned: bool) -> Result<()> {
        for shard_lock in &self.shards {
            let mut shard = shard_lock.write();
            if check_pinned {
                ensure!(
                    !shard
                        .entries
                        .iter()
                        .any(|e| e.key.file_id == file_id && e.is_pinned()),
                    "cannot drop pages of file {} while pinned",
                    file_id
                );
            }

            let mut idx = 0;
            while idx < shard.entries.len() {
                if shard.entries[idx].key.file_id == file_id {
                    shard.remove_at(idx);
                } else {
                    idx += 1;
                }
            }
        }
        Ok(())
    }

    fn flush_file(&self, file_id: u32) -> Result<()> {
        for shard_lock in &self.shards {
            let dirty: Vec<Arc<CacheEntry>> = {
                let shard = shard_lock.read();
                shard
                    .entries
                    .iter()
                    .filter(|e| e.key.file_id == file_id && e.is_dirty())
                    .cloned()
                    .collect()
            };
            for entry in dirty {
                entry.write_back()?;
            }
        }
        self.file_state(file_id)?.sync()
    }

    /// Drops every cached page of the file and truncates it to zero length.
    pub fn truncate_file(&self, file_id: u32) -> Result<()> {
        let state = self.file_state(file_id)?;
        self.purge_file(file_id, true)?;

        state
            .file
            .lock()
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate {}", state.name))?;
        state.page_count.store(0, Ordering::Release);
        Ok(())
    }

    /// Removes the file from disk and forgets it entirely.
    pub fn delete_file(&self, file_id: u32) -> Result<()> {
        let state = self.file_state(file_id)?;
        self.purge_file(file_id, true)?;

        self.files.write().remove(&file_id);
        std::fs::remove_file(&state.path)
            .wrap_err_with(|| format!("failed to delete {:?}", state.path))?;
        Ok(())
    }

    /// Flushes (optionally) and drops the file's cached pages. The file stays
    /// registered so its id remains resolvable.
    pub fn close_file(&self, file_id: u32, flush: bool) -> Result<()> {
        if flush {
            self.flush_file(file_id)?;
        }
        self.purge_file(file_id, true)
    }

    /// Writes every dirty page back and syncs all files.
    pub fn flush_buffer(&self) -> Result<()> {
        for shard_lock in &self.shards {
            let dirty: Vec<Arc<CacheEntry>> = {
                let shard = shard_lock.read();
                shard
                    .entries
                    .iter()
                    .filter(|e| e.is_dirty())
                    .cloned()
                    .collect()
            };
            for entry in dirty {
                entry.write_back()?;
            }
        }

        let files: Vec<Arc<FileState>> = self.files.read().values().cloned().collect();
        for state in files {
            state.sync()?;
        }
        Ok(())
    }
}
