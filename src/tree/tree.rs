//! # Bonsai Tree
//!
//! The public ordered-map structure: a B+-tree whose nodes are sub-page
//! bucket regions, letting thousands of small trees share one paginated
//! file. Each tree is addressed by its root bucket pointer, which stays
//! stable for the tree's lifetime — a root split rewrites the root region in
//! place instead of moving it.
//!
//! ## Structure
//!
//! ```text
//!                     [root region @ (page 0, 16384)]
//!                      /                    \
//!          [leaf @ (page 1, 16384)] ⇄ [leaf @ (page 2, 16384)]
//!                      (doubly linked in key order)
//! ```
//!
//! Interior entries hold `(left_child, right_child, separator)`; adjacent
//! entries share the child between them. Leaves hold the key/value pairs and
//! a sibling chain that range scans walk without re-descending.
//!
//! ## Insert Algorithm
//!
//! ```text
//! 1. Descend from the root, recording the bucket pointer path
//! 2. At the leaf: add the entry (or update the value in place)
//! 3. On "no space": split the bucket
//!    - copy the upper half to a fresh page's conventional region
//!    - splice the new leaf into the sibling chain
//!    - insert the separator into the parent; if the parent overflows,
//!      split it recursively up the recorded path
//!    - a root split instead allocates BOTH halves and rewrites the root
//!      region as an interior node, preserving the root pointer
//! 4. Retry with the adjusted position the split hands back; value updates
//!    may split repeatedly until the new value fits
//! ```
//!
//! ## Delete Algorithm
//!
//! Deletion removes the entry from its leaf and decrements the tree size.
//! Buckets are never merged or rebalanced afterwards and never deallocated;
//! downstream holders of bucket pointers rely on this.
//!
//! ## Durability
//!
//! Every mutating operation runs inside an atomic unit: page deltas are
//! logged before each page guard is dropped, and the unit's end record makes
//! them recoverable as a group. The tree-size update of `remove` happens
//! inside the same unit as the entry removal.
//!
//! ## Concurrency
//!
//! A tree-level reader/writer lock classifies operations: lookups, scans,
//! size, first/last and flush share; put/remove/clear/create/load/close/
//! delete are exclusive. Page-level locks inside the cache serialize the
//! actual byte access; writers release each page only after logging its
//! changes and marking it dirty.

use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::RwLock;
use smallvec::SmallVec;

use super::bucket::{BonsaiBucket, BonsaiBucketMut, SearchResult, TreeEntry, MAX_ENTRY_SIZE};
use super::key::{PartialSearchMode, SentinelBound, TreeKey};
use super::pointer::BucketPointer;
use super::serializer::{field_len, serialized_len, BinarySerializer};
use crate::config::{DATA_FILE_EXTENSION, ROOT_BUCKET_OFFSET};
use crate::storage::{CacheEntry, DiskCache, DurableComponent, DurablePage, PaginatedStorage};

/// Construction-time options mirroring the structure's tuning knobs.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Extension of the container file (`<name><extension>`).
    pub extension: String,
    /// Declared arity for composite keys; 1 for plain keys.
    pub key_size: usize,
    /// Whether mutations outside a storage transaction still go through the
    /// WAL.
    pub durable_in_non_tx_mode: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            extension: DATA_FILE_EXTENSION.to_string(),
            key_size: 1,
            durable_in_non_tx_mode: true,
        }
    }
}

type Entry<KS, VS> =
    TreeEntry<<KS as BinarySerializer>::Item, <VS as BinarySerializer>::Item>;

/// Result of descending to the leaf that owns a key.
struct BucketSearchResult {
    index: SearchResult,
    path: SmallVec<[BucketPointer; 8]>,
}

impl BucketSearchResult {
    fn last_path_item(&self) -> BucketPointer {
        *self.path.last().expect("search path is never empty")
    }
}

/// Result of a bucket split: where the pending key now belongs.
struct SplitResult {
    item_index: usize,
    path: SmallVec<[BucketPointer; 8]>,
}

impl SplitResult {
    fn last_path_item(&self) -> BucketPointer {
        *self.path.last().expect("split path is never empty")
    }
}

struct PagePathItemUnit {
    pointer: BucketPointer,
    item_index: i64,
}

enum Step<K> {
    Return(K),
    Backtrack,
    Descend(BucketPointer),
}

/// A durable ordered map packed into sub-page bucket regions.
pub struct BonsaiTree<KS, VS>
where
    KS: BinarySerializer,
    KS::Item: TreeKey,
    VS: BinarySerializer,
    VS::Item: Clone,
{
    state: RwLock<TreeState<KS, VS>>,
}

struct TreeState<KS, VS> {
    name: String,
    file_id: u32,
    root: BucketPointer,
    key_size: usize,
    durable_in_non_tx_mode: bool,
    key_codec: KS,
    value_codec: VS,
    storage: Arc<PaginatedStorage>,
}

impl<KS, VS> DurableComponent for TreeState<KS, VS> {
    fn storage(&self) -> &PaginatedStorage {
        &self.storage
    }

    fn durable_in_non_tx_mode(&self) -> bool {
        self.durable_in_non_tx_mode
    }
}

impl<KS, VS> BonsaiTree<KS, VS>
where
    KS: BinarySerializer,
    KS::Item: TreeKey,
    VS: BinarySerializer,
    VS::Item: Clone,
{
    /// Creates a new empty tree. `root_index < 0` allocates a fresh root
    /// page; a non-negative index roots the tree at an existing page, which
    /// is how several trees share a file.
    pub fn create(
        name: &str,
        root_index: i64,
        key_codec: KS,
        value_codec: VS,
        storage: Arc<PaginatedStorage>,
    ) -> Result<Self> {
        Self::create_with(name, root_index, key_codec, value_codec, storage, TreeConfig::default())
    }

    pub fn create_with(
        name: &str,
        root_index: i64,
        key_codec: KS,
        value_codec: VS,
        storage: Arc<PaginatedStorage>,
        config: TreeConfig,
    ) -> Result<Self> {
        let file_id = storage
            .cache()
            .open_file(&format!("{}{}", name, config.extension))?;

        let root_entry = if root_index < 0 {
            storage.cache().allocate_new_page(file_id)?
        } else {
            storage.cache().load(file_id, root_index as u64, false)?
        };
        let root = BucketPointer::new(root_entry.page_index() as i64, ROOT_BUCKET_OFFSET);

        let state = TreeState {
            name: name.to_string(),
            file_id,
            root,
            key_size: config.key_size,
            durable_in_non_tx_mode: config.durable_in_non_tx_mode,
            key_codec,
            value_codec,
            storage,
        };

        let result = (|| -> Result<()> {
            state.start_durable_operation()?;
            {
                let mut data = root_entry.pointer().acquire_exclusive();
                let mut page = DurablePage::new(&mut data[..], state.track_mode())?;
                let mut root_bucket = BonsaiBucketMut::init(
                    &mut page,
                    root.page_offset(),
                    true,
                    &state.key_codec,
                    &state.value_codec,
                )?;
                root_bucket.set_key_serializer_id(KS::ID)?;
                root_bucket.set_value_serializer_id(VS::ID)?;
                root_bucket.set_tree_size(0)?;
                state.log_page_changes(&mut page, file_id, root.page_index() as u64, true)?;
            }
            root_entry.mark_dirty();
            state.cache().release(&root_entry);

            state.end_durable_operation(false)
        })();

        if let Err(e) = result {
            state.rollback_durable_operation();
            return Err(e.wrap_err(format!("error during creation of tree {}", name)));
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Loads an existing tree from its root pointer, verifying that the
    /// stored codec ids match the supplied codecs.
    pub fn load(
        name: &str,
        root: BucketPointer,
        key_codec: KS,
        value_codec: VS,
        storage: Arc<PaginatedStorage>,
    ) -> Result<Self> {
        Self::load_with(name, root, key_codec, value_codec, storage, TreeConfig::default())
    }

    pub fn load_with(
        name: &str,
        root: BucketPointer,
        key_codec: KS,
        value_codec: VS,
        storage: Arc<PaginatedStorage>,
        config: TreeConfig,
    ) -> Result<Self> {
        ensure!(root.is_valid(), "cannot load tree {} from a null root", name);

        let file_id = storage
            .cache()
            .open_file(&format!("{}{}", name, config.extension))
            .wrap_err_with(|| format!("error during loading of tree {}", name))?;

        let state = TreeState {
            name: name.to_string(),
            file_id,
            root,
            key_size: config.key_size,
            durable_in_non_tx_mode: config.durable_in_non_tx_mode,
            key_codec,
            value_codec,
            storage,
        };

        let entry = state.cache().load(file_id, root.page_index() as u64, false)?;
        let ids = {
            let data = entry.pointer().acquire_shared();
            let bucket = BonsaiBucket::from_page(
                &data,
                root.page_offset(),
                &state.key_codec,
                &state.value_codec,
            )?;
            (bucket.key_serializer_id(), bucket.value_serializer_id())
        };
        state.cache().release(&entry);

        ensure!(
            ids == (KS::ID, VS::ID),
            "tree {} was written with codecs ({}, {}), not ({}, {})",
            name,
            ids.0,
            ids.1,
            KS::ID,
            VS::ID
        );

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    pub fn get_name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn get_root_bucket_pointer(&self) -> BucketPointer {
        self.state.read().root
    }

    pub fn get(&self, key: &KS::Item) -> Result<Option<VS::Item>> {
        let state = self.state.read();
        state
            .get_inner(key)
            .wrap_err_with(|| format!("error during retrieval from tree {}", state.name))
    }

    pub fn put(&self, key: KS::Item, value: VS::Item) -> Result<()> {
        let state = self.state.write();

        let result = (|| -> Result<()> {
            state.start_durable_operation()?;
            state.put_inner(&key, &value)?;
            state.end_durable_operation(false)
        })();

        result.map_err(|e| {
            state.rollback_durable_operation();
            e.wrap_err(format!("error during update of tree {}", state.name))
        })
    }

    /// Removes a key, returning its value. The tree never merges or
    /// rebalances buckets on removal.
    pub fn remove(&self, key: &KS::Item) -> Result<Option<VS::Item>> {
        let state = self.state.write();

        let result = (|| -> Result<Option<VS::Item>> {
            state.start_durable_operation()?;
            let removed = state.remove_inner(key)?;
            state.end_durable_operation(false)?;
            Ok(removed)
        })();

        result.map_err(|e| {
            state.rollback_durable_operation();
            e.wrap_err(format!("error during removal of key from tree {}", state.name))
        })
    }

    pub fn size(&self) -> Result<u64> {
        let state = self.state.read();
        state
            .tree_size_inner()
            .wrap_err_with(|| format!("error during size retrieval of tree {}", state.name))
    }

    pub fn first_key(&self) -> Result<Option<KS::Item>> {
        let state = self.state.read();
        state
            .first_key_inner()
            .wrap_err_with(|| format!("error during search of first key in tree {}", state.name))
    }

    pub fn last_key(&self) -> Result<Option<KS::Item>> {
        let state = self.state.read();
        state
            .last_key_inner()
            .wrap_err_with(|| format!("error during search of last key in tree {}", state.name))
    }

    /// Feeds entries with keys `<= key` (or `< key`) to `listener`, newest
    /// boundary first, walking leaves leftward. A `false` return stops the
    /// scan.
    pub fn load_entries_minor<F>(&self, key: &KS::Item, inclusive: bool, listener: F) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let state = self.state.read();
        state
            .load_entries_minor_inner(key, inclusive, listener)
            .wrap_err_with(|| format!("error during fetch of minor values in tree {}", state.name))
    }

    /// Feeds entries with keys `>= key` (or `> key`) to `listener` in
    /// ascending order, walking leaves rightward.
    pub fn load_entries_major<F>(&self, key: &KS::Item, inclusive: bool, listener: F) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let state = self.state.read();
        state
            .load_entries_major_inner(key, inclusive, listener)
            .wrap_err_with(|| format!("error during fetch of major values in tree {}", state.name))
    }

    /// Feeds entries between the two boundary keys to `listener` in
    /// ascending order, honoring inclusivity at both ends.
    pub fn load_entries_between<F>(
        &self,
        key_from: &KS::Item,
        from_inclusive: bool,
        key_to: &KS::Item,
        to_inclusive: bool,
        listener: F,
    ) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let state = self.state.read();
        state
            .load_entries_between_inner(key_from, from_inclusive, key_to, to_inclusive, listener)
            .wrap_err_with(|| format!("error during fetch of values in tree {}", state.name))
    }

    pub fn get_values_minor(
        &self,
        key: &KS::Item,
        inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<VS::Item>> {
        let mut values = Vec::new();
        self.load_entries_minor(key, inclusive, |entry| {
            values.push(entry.value.clone().expect("leaf entry without value"));
            max_values_to_fetch <= -1 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    pub fn get_values_major(
        &self,
        key: &KS::Item,
        inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<VS::Item>> {
        let mut values = Vec::new();
        self.load_entries_major(key, inclusive, |entry| {
            values.push(entry.value.clone().expect("leaf entry without value"));
            max_values_to_fetch <= -1 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    pub fn get_values_between(
        &self,
        key_from: &KS::Item,
        from_inclusive: bool,
        key_to: &KS::Item,
        to_inclusive: bool,
        max_values_to_fetch: i64,
    ) -> Result<Vec<VS::Item>> {
        let mut values = Vec::new();
        self.load_entries_between(key_from, from_inclusive, key_to, to_inclusive, |entry| {
            values.push(entry.value.clone().expect("leaf entry without value"));
            max_values_to_fetch <= 0 || (values.len() as i64) < max_values_to_fetch
        })?;
        Ok(values)
    }

    /// Truncates the container file and reinitializes the root in place.
    pub fn clear(&self) -> Result<()> {
        let state = self.state.write();

        let result = (|| -> Result<()> {
            state.start_durable_operation()?;
            state.clear_inner()?;
            state.end_durable_operation(false)
        })();

        result.map_err(|e| {
            state.rollback_durable_operation();
            e.wrap_err(format!("error during clear of tree {}", state.name))
        })
    }

    pub fn close_with_flush(&self, flush: bool) -> Result<()> {
        let state = self.state.write();
        state
            .storage
            .cache()
            .close_file(state.file_id, flush)
            .wrap_err_with(|| format!("error during close of tree {}", state.name))
    }

    pub fn close(&self) -> Result<()> {
        self.close_with_flush(true)
    }

    /// Removes the container file.
    pub fn delete(&self) -> Result<()> {
        let state = self.state.write();
        state
            .storage
            .cache()
            .delete_file(state.file_id)
            .wrap_err_with(|| format!("error during deletion of tree {}", state.name))
    }

    pub fn flush(&self) -> Result<()> {
        let state = self.state.read();
        state
            .storage
            .cache()
            .flush_buffer()
            .wrap_err_with(|| format!("error during flush of tree {}", state.name))
    }
}

impl<KS, VS> TreeState<KS, VS>
where
    KS: BinarySerializer,
    KS::Item: TreeKey,
    VS: BinarySerializer,
    VS::Item: Clone,
{
    fn cache(&self) -> &DiskCache {
        self.storage.cache()
    }

    fn read_bucket<'a>(
        &'a self,
        data: &'a [u8],
        pointer: BucketPointer,
    ) -> Result<BonsaiBucket<'a, KS, VS>> {
        BonsaiBucket::from_page(data, pointer.page_offset(), &self.key_codec, &self.value_codec)
    }

    fn load_pointer(&self, pointer: BucketPointer) -> Result<Arc<CacheEntry>> {
        ensure!(pointer.is_valid(), "attempt to load a null bucket pointer");
        self.cache()
            .load(self.file_id, pointer.page_index() as u64, false)
    }

    /// Descends from the root to the leaf that owns `key`, recording the
    /// path. Short composite keys are bound-tagged according to `mode` so
    /// range scans resolve to the correct boundary leaf.
    fn find_bucket(
        &self,
        key: &KS::Item,
        mode: PartialSearchMode,
    ) -> Result<BucketSearchResult> {
        let mut key = key.clone();
        if self.key_size > 1 && key.arity() < self.key_size && mode != PartialSearchMode::None {
            let bound = match mode {
                PartialSearchMode::HighestBoundary => SentinelBound::Highest,
                PartialSearchMode::LowestBoundary => SentinelBound::Lowest,
                PartialSearchMode::None => unreachable!(),
            };
            key = key.with_bound(bound);
        }

        let mut pointer = self.root;
        let mut path: SmallVec<[BucketPointer; 8]> = SmallVec::new();

        loop {
            ensure!(
                path.len() <= 64,
                "search path exceeded 64 levels; tree is corrupt"
            );
            path.push(pointer);

            let entry = self.load_pointer(pointer)?;
            let step = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;
                let slot = bucket.find(&key)?;

                if bucket.is_leaf() {
                    Step::Return(slot)
                } else {
                    ensure!(!bucket.is_empty(), "empty interior bucket at {:?}", pointer);
                    let next = match slot {
                        SearchResult::Found(i) => bucket.children_at(i)?.1,
                        SearchResult::NotFound(j) => {
                            if j >= bucket.size() {
                                bucket.children_at(j - 1)?.1
                            } else {
                                bucket.children_at(j)?.0
                            }
                        }
                    };
                    Step::Descend(next)
                }
            };
            self.cache().release(&entry);

            match step {
                Step::Return(slot) => return Ok(BucketSearchResult { index: slot, path }),
                Step::Descend(next) => pointer = next,
                Step::Backtrack => unreachable!(),
            }
        }
    }

    fn get_inner(&self, key: &KS::Item) -> Result<Option<VS::Item>> {
        let search = self.find_bucket(key, PartialSearchMode::None)?;
        let SearchResult::Found(index) = search.index else {
            return Ok(None);
        };

        let pointer = search.last_path_item();
        let entry = self.load_pointer(pointer)?;
        let value = {
            let data = entry.pointer().acquire_shared();
            self.read_bucket(&data, pointer)?.value_at(index)?
        };
        self.cache().release(&entry);

        Ok(Some(value))
    }

    fn put_inner(&self, key: &KS::Item, value: &VS::Item) -> Result<()> {
        let entry_len = field_len(serialized_len(&self.key_codec, key)?)
            + field_len(serialized_len(&self.value_codec, value)?);
        ensure!(
            entry_len <= MAX_ENTRY_SIZE,
            "entry of {} bytes cannot fit a bucket",
            entry_len
        );

        let search = self.find_bucket(key, PartialSearchMode::None)?;

        match search.index {
            SearchResult::Found(index) => {
                self.put_update(search, index, key, value)?;
            }
            SearchResult::NotFound(index) => {
                self.put_insert(search, index, key, value)?;
                self.set_size(self.tree_size_inner()? + 1)?;
            }
        }

        Ok(())
    }

    /// Replaces an existing value, splitting the leaf as often as needed for
    /// the new value to fit.
    fn put_update(
        &self,
        search: BucketSearchResult,
        mut index: usize,
        key: &KS::Item,
        value: &VS::Item,
    ) -> Result<()> {
        let mut path = search.path;
        let mut pointer = *path.last().unwrap();

        loop {
            let entry = self.load_pointer(pointer)?;
            let updated = {
                let mut data = entry.pointer().acquire_exclusive();
                let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
                let mut bucket = BonsaiBucketMut::new(
                    &mut page,
                    pointer.page_offset(),
                    &self.key_codec,
                    &self.value_codec,
                )?;

                let updated = bucket.update_value(index, value)?;
                if updated {
                    self.log_page_changes(
                        &mut page,
                        self.file_id,
                        pointer.page_index() as u64,
                        false,
                    )?;
                }
                updated
            };

            if updated {
                entry.mark_dirty();
                self.cache().release(&entry);
                return Ok(());
            }
            self.cache().release(&entry);

            let split = self.split_bucket(&path, index, key)?;
            pointer = split.last_path_item();
            index = split.item_index;
            path = split.path;
        }
    }

    /// Inserts a new entry, splitting the leaf as often as needed.
    fn put_insert(
        &self,
        search: BucketSearchResult,
        mut index: usize,
        key: &KS::Item,
        value: &VS::Item,
    ) -> Result<()> {
        let mut path = search.path;
        let mut pointer = *path.last().unwrap();

        loop {
            let entry = self.load_pointer(pointer)?;
            let inserted = {
                let mut data = entry.pointer().acquire_exclusive();
                let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
                let mut bucket = BonsaiBucketMut::new(
                    &mut page,
                    pointer.page_offset(),
                    &self.key_codec,
                    &self.value_codec,
                )?;

                let inserted = bucket.add_entry(
                    index,
                    &TreeEntry::leaf(key.clone(), value.clone()),
                    true,
                )?;
                if inserted {
                    self.log_page_changes(
                        &mut page,
                        self.file_id,
                        pointer.page_index() as u64,
                        false,
                    )?;
                }
                inserted
            };

            if inserted {
                entry.mark_dirty();
                self.cache().release(&entry);
                return Ok(());
            }
            self.cache().release(&entry);

            let split = self.split_bucket(&path, index, key)?;
            pointer = split.last_path_item();
            index = split.item_index;
            path = split.path;
        }
    }

    fn remove_inner(&self, key: &KS::Item) -> Result<Option<VS::Item>> {
        let search = self.find_bucket(key, PartialSearchMode::None)?;
        let SearchResult::Found(index) = search.index else {
            return Ok(None);
        };

        let pointer = search.last_path_item();
        let entry = self.load_pointer(pointer)?;
        let removed = {
            let mut data = entry.pointer().acquire_exclusive();
            let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
            let mut bucket = BonsaiBucketMut::new(
                &mut page,
                pointer.page_offset(),
                &self.key_codec,
                &self.value_codec,
            )?;

            let removed = bucket.value_at(index)?;
            bucket.remove(index)?;
            self.log_page_changes(&mut page, self.file_id, pointer.page_index() as u64, false)?;
            removed
        };
        entry.mark_dirty();
        self.cache().release(&entry);

        // Size bookkeeping belongs to the same atomic unit as the removal.
        self.set_size(self.tree_size_inner()? - 1)?;

        Ok(Some(removed))
    }

    fn tree_size_inner(&self) -> Result<u64> {
        let entry = self.load_pointer(self.root)?;
        let size = {
            let data = entry.pointer().acquire_shared();
            self.read_bucket(&data, self.root)?.tree_size()
        };
        self.cache().release(&entry);
        Ok(size)
    }

    fn set_size(&self, size: u64) -> Result<()> {
        let entry = self.load_pointer(self.root)?;
        {
            let mut data = entry.pointer().acquire_exclusive();
            let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
            let mut bucket = BonsaiBucketMut::new(
                &mut page,
                self.root.page_offset(),
                &self.key_codec,
                &self.value_codec,
            )?;
            bucket.set_tree_size(size)?;
            self.log_page_changes(&mut page, self.file_id, self.root.page_index() as u64, false)?;
        }
        entry.mark_dirty();
        self.cache().release(&entry);
        Ok(())
    }

    /// Splits the bucket at the path tail around its median key.
    ///
    /// Non-root buckets move their upper half to a freshly allocated page and
    /// push the separator into the parent, recursing up the path on overflow.
    /// The root instead distributes both halves to two new pages and is
    /// rewritten in place as an interior node, keeping the root pointer
    /// stable. Returns the bucket and adjusted index where the pending key
    /// now belongs.
    fn split_bucket(
        &self,
        path: &[BucketPointer],
        key_index: usize,
        key_to_insert: &KS::Item,
    ) -> Result<SplitResult> {
        let pointer = *path.last().ok_or_else(|| eyre!("split of an empty path"))?;
        let entry = self.load_pointer(pointer)?;

        let result = (|| -> Result<SplitResult> {
            let mut data = entry.pointer().acquire_exclusive();
            let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
            let mut bucket = BonsaiBucketMut::new(
                &mut page,
                pointer.page_offset(),
                &self.key_codec,
                &self.value_codec,
            )?;

            let split_leaf = bucket.is_leaf();
            let bucket_size = bucket.size()?;
            // A leaf of one entry splits into an empty left half; an interior
            // node needs at least two entries to promote a separator.
            ensure!(
                if split_leaf { bucket_size >= 1 } else { bucket_size >= 2 },
                "cannot split bucket of {} entries",
                bucket_size
            );

            let index_to_split = bucket_size >> 1;
            let separation_key = bucket.key_at(index_to_split)?;
            // Leaves keep the median in the right half; interior nodes
            // promote it without duplication.
            let start_right = if split_leaf {
                index_to_split
            } else {
                index_to_split + 1
            };
            let right_entries: Vec<Entry<KS, VS>> = (start_right..bucket_size)
                .map(|i| bucket.get_entry(i))
                .collect::<Result<_>>()?;

            if pointer != self.root {
                self.split_non_root(
                    path,
                    pointer,
                    &mut page,
                    split_leaf,
                    index_to_split,
                    &separation_key,
                    right_entries,
                    key_index,
                    key_to_insert,
                )
            } else {
                let left_entries: Vec<Entry<KS, VS>> = (0..index_to_split)
                    .map(|i| bucket.get_entry(i))
                    .collect::<Result<_>>()?;
                let tree_size = bucket.tree_size()?;

                self.split_root(
                    path,
                    pointer,
                    &mut page,
                    split_leaf,
                    index_to_split,
                    &separation_key,
                    left_entries,
                    right_entries,
                    tree_size,
                    key_index,
                    key_to_insert,
                )
            }
        })();

        entry.mark_dirty();
        self.cache().release(&entry);

        result
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root(
        &self,
        path: &[BucketPointer],
        pointer: BucketPointer,
        page: &mut DurablePage<'_>,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: &KS::Item,
        right_entries: Vec<Entry<KS, VS>>,
        key_index: usize,
        key_to_insert: &KS::Item,
    ) -> Result<SplitResult> {
        let right_entry = self.cache().allocate_new_page(self.file_id)?;
        let right_pointer = BucketPointer::for_new_page(right_entry.page_index());

        {
            let mut right_data = right_entry.pointer().acquire_exclusive();
            let mut right_page = DurablePage::new(&mut right_data[..], self.track_mode())?;
            let mut right_bucket = BonsaiBucketMut::init(
                &mut right_page,
                right_pointer.page_offset(),
                split_leaf,
                &self.key_codec,
                &self.value_codec,
            )?;
            right_bucket.add_all(&right_entries)?;

            let mut bucket = BonsaiBucketMut::new(
                page,
                pointer.page_offset(),
                &self.key_codec,
                &self.value_codec,
            )?;
            bucket.shrink(index_to_split)?;

            if split_leaf {
                let old_right = bucket.right_sibling()?;

                right_bucket.set_right_sibling(old_right)?;
                right_bucket.set_left_sibling(pointer)?;
                bucket.set_right_sibling(right_pointer)?;

                if old_right.is_valid() {
                    let sibling_entry = self.load_pointer(old_right)?;
                    {
                        let mut sibling_data = sibling_entry.pointer().acquire_exclusive();
                        let mut sibling_page =
                            DurablePage::new(&mut sibling_data[..], self.track_mode())?;
                        let mut sibling_bucket = BonsaiBucketMut::new(
                            &mut sibling_page,
                            old_right.page_offset(),
                            &self.key_codec,
                            &self.value_codec,
                        )?;
                        sibling_bucket.set_left_sibling(right_pointer)?;
                        self.log_page_changes(
                            &mut sibling_page,
                            self.file_id,
                            old_right.page_index() as u64,
                            false,
                        )?;
                    }
                    sibling_entry.mark_dirty();
                    self.cache().release(&sibling_entry);
                }
            }

            self.insert_into_parent(path, pointer, right_pointer, separation_key)?;

            self.log_page_changes(
                &mut right_page,
                self.file_id,
                right_entry.page_index(),
                true,
            )?;
        }
        right_entry.mark_dirty();
        self.cache().release(&right_entry);

        self.log_page_changes(page, self.file_id, pointer.page_index() as u64, false)?;

        let mut result_path: SmallVec<[BucketPointer; 8]> =
            path[..path.len() - 1].iter().copied().collect();

        if key_to_insert < separation_key {
            result_path.push(pointer);
            return Ok(SplitResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        };
        Ok(SplitResult {
            item_index,
            path: result_path,
        })
    }

    /// Inserts the `(left, right, separator)` entry into the parent,
    /// splitting ancestors as needed. Parent state is re-read from the
    /// returned search result after every recursive split; positions from
    /// before the recursion are stale.
    fn insert_into_parent(
        &self,
        path: &[BucketPointer],
        left_pointer: BucketPointer,
        right_pointer: BucketPointer,
        separation_key: &KS::Item,
    ) -> Result<()> {
        let parent_entry_value =
            TreeEntry::<KS::Item, VS::Item>::interior(left_pointer, right_pointer, separation_key.clone());

        let mut parent_pointer = path[path.len() - 2];
        let mut parent_path_len = path.len() - 1;
        let mut parent_path: SmallVec<[BucketPointer; 8]> =
            path[..parent_path_len].iter().copied().collect();
        let mut insertion_index = None;

        loop {
            let parent_entry = self.load_pointer(parent_pointer)?;
            let inserted = {
                let mut parent_data = parent_entry.pointer().acquire_exclusive();
                let mut parent_page = DurablePage::new(&mut parent_data[..], self.track_mode())?;
                let mut parent_bucket = BonsaiBucketMut::new(
                    &mut parent_page,
                    parent_pointer.page_offset(),
                    &self.key_codec,
                    &self.value_codec,
                )?;

                let index = match insertion_index.take() {
                    Some(index) => index,
                    None => match parent_bucket.find(separation_key)? {
                        SearchResult::NotFound(index) => index,
                        SearchResult::Found(_) => {
                            bail!("separator key already present in parent bucket")
                        }
                    },
                };

                let inserted = parent_bucket.add_entry(index, &parent_entry_value, true)?;
                if inserted {
                    self.log_page_changes(
                        &mut parent_page,
                        self.file_id,
                        parent_pointer.page_index() as u64,
                        false,
                    )?;
                } else {
                    insertion_index = Some(index);
                }
                inserted
            };
            parent_entry.mark_dirty();
            self.cache().release(&parent_entry);

            if inserted {
                return Ok(());
            }

            let split = self.split_bucket(
                &parent_path[..parent_path_len],
                insertion_index.take().unwrap_or(0),
                separation_key,
            )?;
            parent_pointer = split.last_path_item();
            insertion_index = Some(split.item_index);
            parent_path = split.path;
            parent_path_len = parent_path.len();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_root(
        &self,
        path: &[BucketPointer],
        pointer: BucketPointer,
        page: &mut DurablePage<'_>,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: &KS::Item,
        left_entries: Vec<Entry<KS, VS>>,
        right_entries: Vec<Entry<KS, VS>>,
        tree_size: u64,
        key_index: usize,
        key_to_insert: &KS::Item,
    ) -> Result<SplitResult> {
        let left_entry = self.cache().allocate_new_page(self.file_id)?;
        let left_pointer = BucketPointer::for_new_page(left_entry.page_index());

        let right_entry = self.cache().allocate_new_page(self.file_id)?;
        let right_pointer = BucketPointer::for_new_page(right_entry.page_index());

        {
            let mut left_data = left_entry.pointer().acquire_exclusive();
            let mut left_page = DurablePage::new(&mut left_data[..], self.track_mode())?;
            let mut left_bucket = BonsaiBucketMut::init(
                &mut left_page,
                left_pointer.page_offset(),
                split_leaf,
                &self.key_codec,
                &self.value_codec,
            )?;
            left_bucket.add_all(&left_entries)?;
            if split_leaf {
                left_bucket.set_right_sibling(right_pointer)?;
            }
            self.log_page_changes(&mut left_page, self.file_id, left_entry.page_index(), true)?;
        }
        left_entry.mark_dirty();
        self.cache().release(&left_entry);

        {
            let mut right_data = right_entry.pointer().acquire_exclusive();
            let mut right_page = DurablePage::new(&mut right_data[..], self.track_mode())?;
            let mut right_bucket = BonsaiBucketMut::init(
                &mut right_page,
                right_pointer.page_offset(),
                split_leaf,
                &self.key_codec,
                &self.value_codec,
            )?;
            right_bucket.add_all(&right_entries)?;
            if split_leaf {
                right_bucket.set_left_sibling(left_pointer)?;
            }
            self.log_page_changes(&mut right_page, self.file_id, right_entry.page_index(), true)?;
        }
        right_entry.mark_dirty();
        self.cache().release(&right_entry);

        // Rewrite the root region in place as an interior node; the root
        // pointer must not change.
        let mut root_bucket = BonsaiBucketMut::init(
            page,
            pointer.page_offset(),
            false,
            &self.key_codec,
            &self.value_codec,
        )?;
        root_bucket.set_tree_size(tree_size)?;
        ensure!(
            root_bucket.add_entry(
                0,
                &TreeEntry::interior(left_pointer, right_pointer, separation_key.clone()),
                true,
            )?,
            "fresh root bucket rejected its single entry"
        );

        self.log_page_changes(page, self.file_id, pointer.page_index() as u64, false)?;

        // The root just became the parent of both halves, so it stays on the
        // returned path; a follow-up split of either half finds it there.
        let mut result_path: SmallVec<[BucketPointer; 8]> = path.iter().copied().collect();

        if key_to_insert < separation_key {
            result_path.push(left_pointer);
            return Ok(SplitResult {
                item_index: key_index,
                path: result_path,
            });
        }

        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split
        } else {
            key_index - index_to_split - 1
        };
        Ok(SplitResult {
            item_index,
            path: result_path,
        })
    }

    fn first_key_inner(&self) -> Result<Option<KS::Item>> {
        let mut path: Vec<PagePathItemUnit> = Vec::new();
        let mut pointer = self.root;
        let mut item_index: i64 = 0;

        loop {
            let entry = self.load_pointer(pointer)?;
            let step = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;

                if bucket.is_leaf() {
                    if bucket.is_empty() {
                        Step::Backtrack
                    } else {
                        Step::Return(bucket.key_at(0)?)
                    }
                } else if bucket.is_empty() || item_index >= bucket.size() as i64 {
                    Step::Backtrack
                } else {
                    Step::Descend(bucket.children_at(item_index as usize)?.0)
                }
            };
            self.cache().release(&entry);

            match step {
                Step::Return(key) => return Ok(Some(key)),
                Step::Backtrack => match path.pop() {
                    None => return Ok(None),
                    Some(unit) => {
                        pointer = unit.pointer;
                        item_index = unit.item_index + 1;
                    }
                },
                Step::Descend(child) => {
                    path.push(PagePathItemUnit {
                        pointer,
                        item_index,
                    });
                    pointer = child;
                    item_index = 0;
                }
            }
        }
    }

    fn last_key_inner(&self) -> Result<Option<KS::Item>> {
        const UNSET: i64 = i64::MAX;

        let mut path: Vec<PagePathItemUnit> = Vec::new();
        let mut pointer = self.root;
        let mut item_index: i64 = UNSET;

        loop {
            let entry = self.load_pointer(pointer)?;
            let step = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;
                let size = bucket.size() as i64;
                if item_index == UNSET {
                    item_index = size - 1;
                }

                if bucket.is_leaf() {
                    if bucket.is_empty() {
                        Step::Backtrack
                    } else {
                        Step::Return(bucket.key_at((size - 1) as usize)?)
                    }
                } else if item_index < 0 {
                    Step::Backtrack
                } else {
                    Step::Descend(bucket.children_at(item_index as usize)?.1)
                }
            };
            self.cache().release(&entry);

            match step {
                Step::Return(key) => return Ok(Some(key)),
                Step::Backtrack => match path.pop() {
                    None => return Ok(None),
                    Some(unit) => {
                        pointer = unit.pointer;
                        item_index = unit.item_index - 1;
                    }
                },
                Step::Descend(child) => {
                    path.push(PagePathItemUnit {
                        pointer,
                        item_index,
                    });
                    pointer = child;
                    item_index = UNSET;
                }
            }
        }
    }

    fn load_entries_minor_inner<F>(
        &self,
        key: &KS::Item,
        inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let mode = if inclusive {
            PartialSearchMode::HighestBoundary
        } else {
            PartialSearchMode::LowestBoundary
        };
        let search = self.find_bucket(key, mode)?;
        let mut pointer = search.last_path_item();

        let mut index: i64 = match search.index {
            SearchResult::Found(i) => {
                if inclusive {
                    i as i64
                } else {
                    i as i64 - 1
                }
            }
            SearchResult::NotFound(i) => i as i64 - 1,
        };

        let mut first_bucket = true;
        loop {
            let entry = self.load_pointer(pointer)?;
            let next = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;
                if !first_bucket {
                    index = bucket.size() as i64 - 1;
                }

                let mut i = index;
                let mut stopped = false;
                while i >= 0 {
                    if !listener(&bucket.get_entry(i as usize)?) {
                        stopped = true;
                        break;
                    }
                    i -= 1;
                }

                if stopped {
                    None
                } else {
                    Some(bucket.left_sibling())
                }
            };
            self.cache().release(&entry);
            first_bucket = false;

            match next {
                None => return Ok(()),
                Some(sibling) if !sibling.is_valid() => return Ok(()),
                Some(sibling) => pointer = sibling,
            }
        }
    }

    fn load_entries_major_inner<F>(
        &self,
        key: &KS::Item,
        inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let mode = if inclusive {
            PartialSearchMode::LowestBoundary
        } else {
            PartialSearchMode::HighestBoundary
        };
        let search = self.find_bucket(key, mode)?;
        let mut pointer = search.last_path_item();

        let mut index: i64 = match search.index {
            SearchResult::Found(i) => {
                if inclusive {
                    i as i64
                } else {
                    i as i64 + 1
                }
            }
            SearchResult::NotFound(i) => i as i64,
        };

        loop {
            let entry = self.load_pointer(pointer)?;
            let next = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;
                let size = bucket.size() as i64;

                let mut i = index.max(0);
                let mut stopped = false;
                while i < size {
                    if !listener(&bucket.get_entry(i as usize)?) {
                        stopped = true;
                        break;
                    }
                    i += 1;
                }

                if stopped {
                    None
                } else {
                    Some(bucket.right_sibling())
                }
            };
            self.cache().release(&entry);
            index = 0;

            match next {
                None => return Ok(()),
                Some(sibling) if !sibling.is_valid() => return Ok(()),
                Some(sibling) => pointer = sibling,
            }
        }
    }

    fn load_entries_between_inner<F>(
        &self,
        key_from: &KS::Item,
        from_inclusive: bool,
        key_to: &KS::Item,
        to_inclusive: bool,
        mut listener: F,
    ) -> Result<()>
    where
        F: FnMut(&Entry<KS, VS>) -> bool,
    {
        let mode_from = if from_inclusive {
            PartialSearchMode::LowestBoundary
        } else {
            PartialSearchMode::HighestBoundary
        };
        let search_from = self.find_bucket(key_from, mode_from)?;
        let pointer_from = search_from.last_path_item();

        let index_from: i64 = match search_from.index {
            SearchResult::Found(i) => {
                if from_inclusive {
                    i as i64
                } else {
                    i as i64 + 1
                }
            }
            SearchResult::NotFound(i) => i as i64,
        };

        let mode_to = if to_inclusive {
            PartialSearchMode::HighestBoundary
        } else {
            PartialSearchMode::LowestBoundary
        };
        let search_to = self.find_bucket(key_to, mode_to)?;
        let pointer_to = search_to.last_path_item();

        let index_to: i64 = match search_to.index {
            SearchResult::Found(i) => {
                if to_inclusive {
                    i as i64
                } else {
                    i as i64 - 1
                }
            }
            SearchResult::NotFound(i) => i as i64 - 1,
        };

        let mut pointer = pointer_from;
        let mut start_index = index_from;

        loop {
            let entry = self.load_pointer(pointer)?;
            let next = {
                let data = entry.pointer().acquire_shared();
                let bucket = self.read_bucket(&data, pointer)?;
                let end_index = if pointer == pointer_to {
                    index_to
                } else {
                    bucket.size() as i64 - 1
                };

                let mut i = start_index.max(0);
                let mut stopped = false;
                while i <= end_index {
                    if !listener(&bucket.get_entry(i as usize)?) {
                        stopped = true;
                        break;
                    }
                    i += 1;
                }

                if stopped || pointer == pointer_to {
                    None
                } else {
                    Some(bucket.right_sibling())
                }
            };
            self.cache().release(&entry);
            start_index = 0;

            match next {
                None => return Ok(()),
                Some(sibling) if !sibling.is_valid() => return Ok(()),
                Some(sibling) => pointer = sibling,
            }
        }
    }

    fn clear_inner(&self) -> Result<()> {
        self.cache().truncate_file(self.file_id)?;

        // The root pointer survives a clear, so the first page allocated
        // after truncation must land back at the root's page index.
        let entry = self.cache().allocate_new_page(self.file_id)?;
        ensure!(
            entry.page_index() as i64 == self.root.page_index(),
            "root page {} not reallocated at its original index after truncate (got {})",
            self.root.page_index(),
            entry.page_index()
        );

        {
            let mut data = entry.pointer().acquire_exclusive();
            let mut page = DurablePage::new(&mut data[..], self.track_mode())?;
            let mut root_bucket = BonsaiBucketMut::init(
                &mut page,
                self.root.page_offset(),
                true,
                &self.key_codec,
                &self.value_codec,
            )?;
            root_bucket.set_key_serializer_id(KS::ID)?;
            root_bucket.set_value_serializer_id(VS::ID)?;
            root_bucket.set_tree_size(0)?;
            self.log_page_changes(&mut page, self.file_id, self.root.page_index() as u64, true)?;
        }
        entry.mark_dirty();
        self.cache().release(&entry);

        Ok(())
    }
}
