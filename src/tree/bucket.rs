//! # Bucket: One Tree Node Inside a Page
//!
//! A bucket is a fixed-size region (16KB) inside a 64KB page holding either a
//! leaf or an interior node. Packing nodes into sub-regions is what lets
//! thousands of small trees share a single file.
//!
//! ## Region Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------------------------------------------
//! 0       1     flags              bit 0: leaf
//! 1       1     key_serializer     codec id (meaningful in the root)
//! 2       1     value_serializer   codec id (meaningful in the root)
//! 3       1     reserved
//! 4       2     size               entry count
//! 6       2     free_pointer       lowest used content offset
//! 8       12    left_sibling       i64 page + u32 offset (leaves)
//! 20      12    right_sibling      i64 page + u32 offset (leaves)
//! 32      8     tree_size          live entries (meaningful in the root)
//! 40      2*N   slot directory     u16 region-relative content offsets
//! ...           free space
//! ...           entry content      grows down from the region end
//! 16384         region end
//! ```
//!
//! All offsets in the slot directory are relative to the region start, so a
//! bucket's bytes are position-independent within its page.
//!
//! ## Entry Content
//!
//! ```text
//! Leaf:     [key_len varint][key][value_len varint][value]
//! Interior: [left i64+u32][right i64+u32][key_len varint][key]
//! ```
//!
//! Entries are kept sorted by key; the slot directory provides the ordering
//! indirection so inserts move two bytes per slot instead of entry content.
//!
//! ## Space Reclamation
//!
//! `remove` physically compacts the content area: the gap left by the removed
//! entry is closed by shifting lower content up and patching affected slots.
//! `update_value` with a size change is remove-plus-reinsert at the same
//! index, so free-space accounting stays exact. `shrink` rebuilds the region
//! from its first `n` entries after a split copies the rest elsewhere.
//!
//! ## Views
//!
//! `BonsaiBucket` reads from a shared page buffer; `BonsaiBucketMut` writes
//! through a [`DurablePage`] so every mutation is delta-tracked for the WAL.
//! Synchronization is the cache's per-page lock held by the caller.

use eyre::{ensure, eyre, Result};

use super::key::TreeKey;
use super::pointer::BucketPointer;
use super::serializer::BinarySerializer;
use crate::config::MAX_BUCKET_SIZE_BYTES;
use crate::encoding::varint::{decode_varint, encode_varint, varint_len, MAX_VARINT_LEN};
use crate::storage::DurablePage;

const FLAGS_OFFSET: usize = 0;
const KEY_SERIALIZER_OFFSET: usize = 1;
const VALUE_SERIALIZER_OFFSET: usize = 2;
const SIZE_OFFSET: usize = 4;
const FREE_POINTER_OFFSET: usize = 6;
const LEFT_SIBLING_OFFSET: usize = 8;
const RIGHT_SIBLING_OFFSET: usize = 20;
const TREE_SIZE_OFFSET: usize = 32;

pub const BUCKET_HEADER_SIZE: usize = 40;
const SLOT_SIZE: usize = 2;

const LEAF_FLAG: u8 = 0x01;
const INTERIOR_POINTERS_SIZE: usize = 24;

/// Largest entry content that fits an otherwise empty bucket.
pub const MAX_ENTRY_SIZE: usize = MAX_BUCKET_SIZE_BYTES - BUCKET_HEADER_SIZE - SLOT_SIZE;

/// One bucket entry. Leaf entries carry a value and null children; interior
/// entries carry child pointers and no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry<K, V> {
    pub left_child: BucketPointer,
    pub right_child: BucketPointer,
    pub key: K,
    pub value: Option<V>,
}

impl<K, V> TreeEntry<K, V> {
    pub fn leaf(key: K, value: V) -> Self {
        Self {
            left_child: BucketPointer::NULL,
            right_child: BucketPointer::NULL,
            key,
            value: Some(value),
        }
    }

    pub fn interior(left_child: BucketPointer, right_child: BucketPointer, key: K) -> Self {
        Self {
            left_child,
            right_child,
            key,
            value: None,
        }
    }
}

/// Outcome of a key search within one bucket. `NotFound` carries the index
/// at which the key would be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    pub fn index(&self) -> usize {
        match self {
            SearchResult::Found(i) | SearchResult::NotFound(i) => *i,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, SearchResult::Found(_))
    }
}

fn read_pointer(bytes: &[u8]) -> BucketPointer {
    let page_index = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let page_offset = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    BucketPointer::new(page_index, page_offset)
}

/// Read-only view of a bucket region inside a shared page buffer.
pub struct BonsaiBucket<'a, KS, VS> {
    region: &'a [u8],
    key_codec: &'a KS,
    value_codec: &'a VS,
}

impl<'a, KS, VS> BonsaiBucket<'a, KS, VS>
where
    KS: BinarySerializer,
    KS::Item: TreeKey,
    VS: BinarySerializer,
{
    pub fn from_page(page: &'a [u8], offset: u32, key_codec: &'a KS, value_codec: &'a VS) -> Result<Self> {
        let offset = offset as usize;
        ensure!(
            offset + MAX_BUCKET_SIZE_BYTES <= page.len(),
            "bucket region [{}, {}) exceeds page size {}",
            offset,
            offset + MAX_BUCKET_SIZE_BYTES,
            page.len()
        );
        Ok(Self {
            region: &page[offset..offset + MAX_BUCKET_SIZE_BYTES],
            key_codec,
            value_codec,
        })
    }

    fn u16_at(&self, pos: usize) -> u16 {
        u16::from_le_bytes(self.region[pos..pos + 2].try_into().unwrap())
    }

    pub fn is_leaf(&self) -> bool {
        self.region[FLAGS_OFFSET] & LEAF_FLAG != 0
    }

    pub fn size(&self) -> usize {
        self.u16_at(SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.region[KEY_SERIALIZER_OFFSET]
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.region[VALUE_SERIALIZER_OFFSET]
    }

    pub fn tree_size(&self) -> u64 {
        u64::from_le_bytes(
            self.region[TREE_SIZE_OFFSET..TREE_SIZE_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn left_sibling(&self) -> BucketPointer {
        read_pointer(&self.region[LEFT_SIBLING_OFFSET..LEFT_SIBLING_OFFSET + 12])
    }

    pub fn right_sibling(&self) -> BucketPointer {
        read_pointer(&self.region[RIGHT_SIBLING_OFFSET..RIGHT_SIBLING_OFFSET + 12])
    }

    fn slot(&self, index: usize) -> Result<usize> {
        ensure!(
            index < self.size(),
            "entry index {} out of bounds (size={})",
            index,
            self.size()
        );
        Ok(self.u16_at(BUCKET_HEADER_SIZE + index * SLOT_SIZE) as usize)
    }

    pub fn key_at(&self, index: usize) -> Result<KS::Item> {
        let mut pos = self.slot(index)?;
        if !self.is_leaf() {
            pos += INTERIOR_POINTERS_SIZE;
        }

        let (key_len, n) = decode_varint(&self.region[pos..])?;
        let start = pos + n;
        let end = start + key_len as usize;
        ensure!(end <= MAX_BUCKET_SIZE_BYTES, "key extends beyond bucket region");

        self.key_codec.deserialize(&self.region[start..end])
    }

    pub fn value_at(&self, index: usize) -> Result<VS::Item> {
        ensure!(self.is_leaf(), "value_at on interior bucket");
        let pos = self.slot(index)?;

        let (key_len, n) = decode_varint(&self.region[pos..])?;
        let value_pos = pos + n + key_len as usize;
        let (value_len, n) = decode_varint(&self.region[value_pos..])?;
        let start = value_pos + n;
        let end = start + value_len as usize;
        ensure!(end <= MAX_BUCKET_SIZE_BYTES, "value extends beyond bucket region");

        self.value_codec.deserialize(&self.region[start..end])
    }

    pub fn children_at(&self, index: usize) -> Result<(BucketPointer, BucketPointer)> {
        ensure!(!self.is_leaf(), "children_at on leaf bucket");
        let pos = self.slot(index)?;
        let left = read_pointer(&self.region[pos..pos + 12]);
        let right = read_pointer(&self.region[pos + 12..pos + 24]);
        Ok((left, right))
    }

    pub fn get_entry(&self, index: usize) -> Result<TreeEntry<KS::Item, VS::Item>> {
        if self.is_leaf() {
            Ok(TreeEntry::leaf(self.key_at(index)?, self.value_at(index)?))
        } else {
            let (left, right) = self.children_at(index)?;
            Ok(TreeEntry::interior(left, right, self.key_at(index)?))
        }
    }

    /// Binary search for `key` over the sorted entries.
    pub fn find(&self, key: &KS::Item) -> Result<SearchResult> {
        let mut low = 0;
        let mut high = self.size();

        while low < high {
            let mid = (low + high) / 2;
            match self.key_at(mid)?.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }

        Ok(SearchResult::NotFound(low))
    }
}

/// Mutable view of a bucket region, writing through a delta-tracked page.
pub struct BonsaiBucketMut<'a, 'p, KS, VS> {
    page: &'a mut DurablePage<'p>,
    offset: usize,
    key_codec: &'a KS,
    value_codec: &'a VS,
}

impl<'a, 'p, KS, VS> BonsaiBucketMut<'a, 'p, KS, VS>
where
    KS: BinarySerializer,
    KS::Item: TreeKey,
    VS: BinarySerializer,
    VS::Item: Clone,
{
    pub fn new(
        page: &'a mut DurablePage<'p>,
        offset: u32,
        key_codec: &'a KS,
        value_codec: &'a VS,
    ) -> Result<Self> {
        Ok(Self {
            page,
            offset: offset as usize,
            key_codec,
            value_codec,
        })
    }

    /// Initializes a fresh bucket region. Codec ids are stamped immediately;
    /// they only carry meaning in root buckets but are harmless elsewhere.
    pub fn init(
        page: &'a mut DurablePage<'p>,
        offset: u32,
        is_leaf: bool,
        key_codec: &'a KS,
        value_codec: &'a VS,
    ) -> Result<Self> {
        let mut bucket = Self::new(page, offset, key_codec, value_codec)?;
        bucket.write_fresh_header(is_leaf)?;
        Ok(bucket)
    }

    fn write_fresh_header(&mut self, is_leaf: bool) -> Result<()> {
        let base = self.offset;
        self.page
            .set_u8(base + FLAGS_OFFSET, if is_leaf { LEAF_FLAG } else { 0 })?;
        self.page.set_u8(base + KEY_SERIALIZER_OFFSET, KS::ID)?;
        self.page.set_u8(base + VALUE_SERIALIZER_OFFSET, VS::ID)?;
        self.page.set_u8(base + 3, 0)?;
        self.page.set_u16(base + SIZE_OFFSET, 0)?;
        self.page
            .set_u16(base + FREE_POINTER_OFFSET, MAX_BUCKET_SIZE_BYTES as u16)?;
        self.write_pointer(LEFT_SIBLING_OFFSET, BucketPointer::NULL)?;
        self.write_pointer(RIGHT_SIBLING_OFFSET, BucketPointer::NULL)?;
        self.page.set_u64(base + TREE_SIZE_OFFSET, 0)?;
        Ok(())
    }

    fn write_pointer(&mut self, pos: usize, pointer: BucketPointer) -> Result<()> {
        self.page.set_i64(self.offset + pos, pointer.page_index())?;
        self.page.set_u32(self.offset + pos + 8, pointer.page_offset())
    }

    fn read_pointer_at(&self, pos: usize) -> Result<BucketPointer> {
        let page_index = self.page.get_i64(self.offset + pos)?;
        let page_offset = self.page.get_u32(self.offset + pos + 8)?;
        Ok(BucketPointer::new(page_index, page_offset))
    }

    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(self.offset + FLAGS_OFFSET).unwrap_or(0) & LEAF_FLAG != 0
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.page.get_u16(self.offset + SIZE_OFFSET)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    fn free_pointer(&self) -> Result<usize> {
        Ok(self.page.get_u16(self.offset + FREE_POINTER_OFFSET)? as usize)
    }

    pub fn key_serializer_id(&self) -> Result<u8> {
        self.page.get_u8(self.offset + KEY_SERIALIZER_OFFSET)
    }

    pub fn set_key_serializer_id(&mut self, id: u8) -> Result<()> {
        self.page.set_u8(self.offset + KEY_SERIALIZER_OFFSET, id)
    }

    pub fn value_serializer_id(&self) -> Result<u8> {
        self.page.get_u8(self.offset + VALUE_SERIALIZER_OFFSET)
    }

    pub fn set_value_serializer_id(&mut self, id: u8) -> Result<()> {
        self.page.set_u8(self.offset + VALUE_SERIALIZER_OFFSET, id)
    }

    pub fn tree_size(&self) -> Result<u64> {
        self.page.get_u64(self.offset + TREE_SIZE_OFFSET)
    }

    pub fn set_tree_size(&mut self, size: u64) -> Result<()> {
        self.page.set_u64(self.offset + TREE_SIZE_OFFSET, size)
    }

    pub fn left_sibling(&self) -> Result<BucketPointer> {
        self.read_pointer_at(LEFT_SIBLING_OFFSET)
    }

    pub fn set_left_sibling(&mut self, pointer: BucketPointer) -> Result<()> {
        self.write_pointer(LEFT_SIBLING_OFFSET, pointer)
    }

    pub fn right_sibling(&self) -> Result<BucketPointer> {
        self.read_pointer_at(RIGHT_SIBLING_OFFSET)
    }

    pub fn set_right_sibling(&mut self, pointer: BucketPointer) -> Result<()> {
        self.write_pointer(RIGHT_SIBLING_OFFSET, pointer)
    }

    fn slot(&self, index: usize) -> Result<usize> {
        let size = self.size()?;
        ensure!(
            index < size,
            "entry index {} out of bounds (size={})",
            index,
            size
        );
        Ok(self
            .page
            .get_u16(self.offset + BUCKET_HEADER_SIZE + index * SLOT_SIZE)? as usize)
    }

    fn set_slot(&mut self, index: usize, pos: usize) -> Result<()> {
        self.page.set_u16(
            self.offset + BUCKET_HEADER_SIZE + index * SLOT_SIZE,
            pos as u16,
        )
    }

    /// Window over the varint head of a field at region-relative `pos`.
    fn varint_head(&self, pos: usize) -> Result<&[u8]> {
        self.page.bytes(
            self.offset + pos,
            MAX_VARINT_LEN.min(MAX_BUCKET_SIZE_BYTES.saturating_sub(pos)),
        )
    }

    /// Total byte length of the entry content starting at region-relative
    /// `pos`.
    fn entry_len_at(&self, pos: usize) -> Result<usize> {
        let mut len = 0usize;
        let mut cursor = pos;

        if !self.is_leaf() {
            len += INTERIOR_POINTERS_SIZE;
            cursor += INTERIOR_POINTERS_SIZE;
        }

        let (key_len, n) = decode_varint(self.varint_head(cursor)?)?;
        len += n + key_len as usize;
        cursor += n + key_len as usize;

        if self.is_leaf() {
            let (value_len, n) = decode_varint(self.varint_head(cursor)?)?;
            len += n + value_len as usize;
        }

        Ok(len)
    }

    pub fn key_at(&self, index: usize) -> Result<KS::Item> {
        let mut pos = self.slot(index)?;
        if !self.is_leaf() {
            pos += INTERIOR_POINTERS_SIZE;
        }

        let (key_len, n) = decode_varint(self.varint_head(pos)?)?;
        let bytes = self.page.bytes(self.offset + pos + n, key_len as usize)?;
        self.key_codec.deserialize(bytes)
    }

    pub fn value_at(&self, index: usize) -> Result<VS::Item> {
        ensure!(self.is_leaf(), "value_at on interior bucket");
        let pos = self.slot(index)?;

        let (key_len, n) = decode_varint(self.varint_head(pos)?)?;
        let value_pos = pos + n + key_len as usize;

        let (value_len, n) = decode_varint(self.varint_head(value_pos)?)?;
        let bytes = self
            .page
            .bytes(self.offset + value_pos + n, value_len as usize)?;
        self.value_codec.deserialize(bytes)
    }

    pub fn children_at(&self, index: usize) -> Result<(BucketPointer, BucketPointer)> {
        ensure!(!self.is_leaf(), "children_at on leaf bucket");
        let pos = self.slot(index)?;
        let bytes = self.page.bytes(self.offset + pos, INTERIOR_POINTERS_SIZE)?;
        Ok((read_pointer(&bytes[0..12]), read_pointer(&bytes[12..24])))
    }

    pub fn get_entry(&self, index: usize) -> Result<TreeEntry<KS::Item, VS::Item>> {
        if self.is_leaf() {
            Ok(TreeEntry::leaf(self.key_at(index)?, self.value_at(index)?))
        } else {
            let (left, right) = self.children_at(index)?;
            Ok(TreeEntry::interior(left, right, self.key_at(index)?))
        }
    }

    pub fn find(&self, key: &KS::Item) -> Result<SearchResult> {
        let mut low = 0;
        let mut high = self.size()?;

        while low < high {
            let mid = (low + high) / 2;
            match self.key_at(mid)?.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }

        Ok(SearchResult::NotFound(low))
    }

    fn encode_entry(&self, entry: &TreeEntry<KS::Item, VS::Item>) -> Result<Vec<u8>> {
        let mut key_buf = Vec::new();
        self.key_codec.serialize(&entry.key, &mut key_buf)?;

        let mut out = Vec::new();
        let mut scratch = [0u8; MAX_VARINT_LEN];

        if self.is_leaf() {
            let value = entry
                .value
                .as_ref()
                .ok_or_else(|| eyre!("leaf entry without a value"))?;
            let mut value_buf = Vec::new();
            self.value_codec.serialize(value, &mut value_buf)?;

            let n = encode_varint(key_buf.len() as u64, &mut scratch);
            out.extend_from_slice(&scratch[..n]);
            out.extend_from_slice(&key_buf);
            let n = encode_varint(value_buf.len() as u64, &mut scratch);
            out.extend_from_slice(&scratch[..n]);
            out.extend_from_slice(&value_buf);
        } else {
            out.extend_from_slice(&entry.left_child.page_index().to_le_bytes());
            out.extend_from_slice(&entry.left_child.page_offset().to_le_bytes());
            out.extend_from_slice(&entry.right_child.page_index().to_le_bytes());
            out.extend_from_slice(&entry.right_child.page_offset().to_le_bytes());
            let n = encode_varint(key_buf.len() as u64, &mut scratch);
            out.extend_from_slice(&scratch[..n]);
            out.extend_from_slice(&key_buf);
        }

        Ok(out)
    }

    /// Inserts an entry at `index`. Returns `false` when the region has no
    /// room left, in which case the caller must split the bucket. With
    /// `update_size == false` the size field is left for the caller to set
    /// after a bulk rebuild.
    pub fn add_entry(
        &mut self,
        index: usize,
        entry: &TreeEntry<KS::Item, VS::Item>,
        update_size: bool,
    ) -> Result<bool> {
        let content = self.encode_entry(entry)?;
        let size = self.size()?;
        let free_pointer = self.free_pointer()?;

        let slots_end = BUCKET_HEADER_SIZE + (size.max(index) + 1) * SLOT_SIZE;
        if free_pointer < slots_end + content.len() {
            return Ok(false);
        }

        let new_pos = free_pointer - content.len();
        self.page.write_bytes(self.offset + new_pos, &content)?;

        if index < size {
            let src = self.offset + BUCKET_HEADER_SIZE + index * SLOT_SIZE;
            self.page
                .move_bytes(src, src + SLOT_SIZE, (size - index) * SLOT_SIZE)?;
        }

        self.set_slot(index, new_pos)?;
        self.page
            .set_u16(self.offset + FREE_POINTER_OFFSET, new_pos as u16)?;
        if update_size {
            self.page
                .set_u16(self.offset + SIZE_OFFSET, (size + 1) as u16)?;
        }

        // An interior entry carries both children, and adjacent entries share
        // the child between them: stitch the neighbors to the newcomer so
        // entry[i].right_child stays identical to entry[i+1].left_child.
        // Bulk rebuilds pass mutually consistent entries and skip this.
        if !self.is_leaf() && update_size {
            if index > 0 {
                let prev_pos = self.slot(index - 1)?;
                self.write_pointer(prev_pos + 12, entry.left_child)?;
            }
            if index < size {
                let next_pos = self.slot(index + 1)?;
                self.write_pointer(next_pos, entry.right_child)?;
            }
        }

        Ok(true)
    }

    /// Bulk-appends entries after a split. The target bucket must have room
    /// for all of them.
    pub fn add_all(&mut self, entries: &[TreeEntry<KS::Item, VS::Item>]) -> Result<()> {
        let base = self.size()?;
        for (i, entry) in entries.iter().enumerate() {
            ensure!(
                self.add_entry(base + i, entry, false)?,
                "no space for bulk append of {} entries",
                entries.len()
            );
        }
        self.page
            .set_u16(self.offset + SIZE_OFFSET, (base + entries.len()) as u16)?;
        Ok(())
    }

    /// Replaces the value at `index`. Same-size values are overwritten in
    /// place; differently sized values are re-inserted at the same index if
    /// the region has room. Returns `false` when it does not — the caller
    /// splits and retries, which is why `put` loops.
    pub fn update_value(&mut self, index: usize, value: &VS::Item) -> Result<bool> {
        ensure!(self.is_leaf(), "update_value on interior bucket");

        let pos = self.slot(index)?;
        let (key_len, n) = decode_varint(self.varint_head(pos)?)?;
        let value_pos = pos + n + key_len as usize;

        let (old_value_len, old_n) = decode_varint(self.varint_head(value_pos)?)?;
        let old_field_len = old_n + old_value_len as usize;

        let mut value_buf = Vec::new();
        self.value_codec.serialize(value, &mut value_buf)?;
        let new_field_len = varint_len(value_buf.len() as u64) + value_buf.len();

        if new_field_len == old_field_len {
            let mut field = Vec::with_capacity(new_field_len);
            let mut scratch = [0u8; MAX_VARINT_LEN];
            let n = encode_varint(value_buf.len() as u64, &mut scratch);
            field.extend_from_slice(&scratch[..n]);
            field.extend_from_slice(&value_buf);
            self.page.write_bytes(self.offset + value_pos, &field)?;
            return Ok(true);
        }

        // Size changed: re-insert at the same index if the freed space plus
        // the remaining free space can hold the new entry.
        let old_entry_len = self.entry_len_at(pos)?;
        let size = self.size()?;
        let free_pointer = self.free_pointer()?;
        let slots_end_after = BUCKET_HEADER_SIZE + size * SLOT_SIZE;
        let new_entry_len = old_entry_len - old_field_len + new_field_len;

        if free_pointer + old_entry_len < slots_end_after + new_entry_len {
            return Ok(false);
        }

        let key = self.key_at(index)?;
        self.remove(index)?;
        ensure!(
            self.add_entry(index, &TreeEntry::leaf(key, value.clone()), true)?,
            "entry vanished during value update"
        );
        Ok(true)
    }

    /// Deletes the entry at `index`, compacting the content area. Siblings
    /// are never merged.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        let size = self.size()?;
        let pos = self.slot(index)?;
        let entry_len = self.entry_len_at(pos)?;
        let free_pointer = self.free_pointer()?;

        // Close the content gap: shift everything below the entry up.
        if pos > free_pointer {
            self.page.move_bytes(
                self.offset + free_pointer,
                self.offset + free_pointer + entry_len,
                pos - free_pointer,
            )?;
        }

        // Patch slots that pointed below the removed entry.
        for i in 0..size {
            if i == index {
                continue;
            }
            let slot_pos = self.slot(i)?;
            if slot_pos < pos {
                self.set_slot(i, slot_pos + entry_len)?;
            }
        }

        // Drop the slot itself.
        if index + 1 < size {
            let src = self.offset + BUCKET_HEADER_SIZE + (index + 1) * SLOT_SIZE;
            self.page.move_bytes(
                src,
                src - SLOT_SIZE,
                (size - index - 1) * SLOT_SIZE,
            )?;
        }

        self.page
            .set_u16(self.offset + SIZE_OFFSET, (size - 1) as u16)?;
        self.page
            .set_u16(self.offset + FREE_POINTER_OFFSET, (free_pointer + entry_len) as u16)?;
        Ok(())
    }

    /// Truncates the bucket to its first `n` entries, rebuilding the content
    /// area. Header metadata (siblings, codec ids, tree size) is preserved.
    pub fn shrink(&mut self, n: usize) -> Result<()> {
        let size = self.size()?;
        ensure!(n <= size, "cannot shrink {} entries to {}", size, n);

        let entries: Vec<TreeEntry<KS::Item, VS::Item>> =
            (0..n).map(|i| self.get_entry(i)).collect::<Result<_>>()?;

        let is_leaf = self.is_leaf();
        let key_serializer_id = self.key_serializer_id()?;
        let value_serializer_id = self.value_serializer_id()?;
        let left_sibling = self.left_sibling()?;
        let right_sibling = self.right_sibling()?;
        let tree_size = self.tree_size()?;

        self.write_fresh_header(is_leaf)?;
        self.set_key_serializer_id(key_serializer_id)?;
        self.set_value_serializer_id(value_serializer_id)?;
        self.set_left_sibling(left_sibling)?;
        self.set_right_sibling(right_sibling)?;
        self.set_tree_size(tree_size)?;

        self.add_all(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::storage::TrackMode;
    use crate::tree::serializer::{Int64Serializer, Utf8Serializer};

    const KC: Int64Serializer = Int64Serializer;
    const VC: Utf8Serializer = Utf8Serializer;

    fn make_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    fn leaf_entry(key: i64, value: &str) -> TreeEntry<i64, String> {
        TreeEntry::leaf(key, value.to_string())
    }

    #[test]
    fn init_writes_an_empty_leaf() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        assert!(bucket.is_leaf());
        assert!(bucket.is_empty().unwrap());
        assert_eq!(bucket.key_serializer_id().unwrap(), Int64Serializer::ID);
        assert_eq!(bucket.value_serializer_id().unwrap(), Utf8Serializer::ID);
        assert!(!bucket.left_sibling().unwrap().is_valid());
        assert!(!bucket.right_sibling().unwrap().is_valid());
        assert_eq!(bucket.tree_size().unwrap(), 0);
    }

    #[test]
    fn entries_stay_sorted_through_arbitrary_insert_order() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        for key in [30i64, 10, 20, 40, 5] {
            let at = match bucket.find(&key).unwrap() {
                SearchResult::NotFound(i) => i,
                SearchResult::Found(_) => panic!("duplicate"),
            };
            assert!(bucket
                .add_entry(at, &leaf_entry(key, &format!("v{key}")), true)
                .unwrap());
        }

        let keys: Vec<i64> = (0..bucket.size().unwrap())
            .map(|i| bucket.key_at(i).unwrap())
            .collect();
        assert_eq!(keys, vec![5, 10, 20, 30, 40]);
        assert_eq!(bucket.value_at(2).unwrap(), "v20");
    }

    #[test]
    fn find_reports_insertion_points() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        for (i, key) in [10i64, 20, 30].iter().enumerate() {
            bucket.add_entry(i, &leaf_entry(*key, "x"), true).unwrap();
        }

        assert_eq!(bucket.find(&10).unwrap(), SearchResult::Found(0));
        assert_eq!(bucket.find(&5).unwrap(), SearchResult::NotFound(0));
        assert_eq!(bucket.find(&25).unwrap(), SearchResult::NotFound(2));
        assert_eq!(bucket.find(&35).unwrap(), SearchResult::NotFound(3));
    }

    #[test]
    fn add_entry_reports_exhaustion_instead_of_overflowing() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        let big = "x".repeat(1000);
        let mut inserted = 0usize;
        loop {
            let fit = bucket
                .add_entry(inserted, &leaf_entry(inserted as i64, &big), true)
                .unwrap();
            if !fit {
                break;
            }
            inserted += 1;
            assert!(inserted < 32, "bucket never filled");
        }

        assert!(inserted > 10);
        assert_eq!(bucket.size().unwrap(), inserted);
        // Content must still be intact after the refused insert.
        assert_eq!(bucket.value_at(0).unwrap(), big);
    }

    #[test]
    fn remove_compacts_and_preserves_remaining_entries() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        for i in 0..5i64 {
            bucket
                .add_entry(i as usize, &leaf_entry(i, &format!("value{i}")), true)
                .unwrap();
        }
        let free_before = bucket.free_pointer().unwrap();

        bucket.remove(2).unwrap();

        assert_eq!(bucket.size().unwrap(), 4);
        assert!(bucket.free_pointer().unwrap() > free_before);
        let keys: Vec<i64> = (0..4).map(|i| bucket.key_at(i).unwrap()).collect();
        assert_eq!(keys, vec![0, 1, 3, 4]);
        assert_eq!(bucket.value_at(2).unwrap(), "value3");
    }

    #[test]
    fn removing_everything_restores_all_space() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        for i in 0..10i64 {
            bucket
                .add_entry(i as usize, &leaf_entry(i, "v"), true)
                .unwrap();
        }
        for _ in 0..10 {
            bucket.remove(0).unwrap();
        }

        assert!(bucket.is_empty().unwrap());
        assert_eq!(bucket.free_pointer().unwrap(), MAX_BUCKET_SIZE_BYTES);
    }

    #[test]
    fn update_value_same_size_in_place() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        bucket.add_entry(0, &leaf_entry(1, "aaaa"), true).unwrap();
        let free_before = bucket.free_pointer().unwrap();

        assert!(bucket.update_value(0, &"bbbb".to_string()).unwrap());
        assert_eq!(bucket.value_at(0).unwrap(), "bbbb");
        assert_eq!(bucket.free_pointer().unwrap(), free_before);
    }

    #[test]
    fn update_value_grows_by_relocating() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        bucket.add_entry(0, &leaf_entry(1, "short"), true).unwrap();
        bucket.add_entry(1, &leaf_entry(2, "other"), true).unwrap();

        let long = "a much longer value than before".to_string();
        assert!(bucket.update_value(0, &long).unwrap());

        assert_eq!(bucket.size().unwrap(), 2);
        assert_eq!(bucket.key_at(0).unwrap(), 1);
        assert_eq!(bucket.value_at(0).unwrap(), long);
        assert_eq!(bucket.value_at(1).unwrap(), "other");
    }

    #[test]
    fn update_value_without_room_asks_for_a_split() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        let chunk = "x".repeat(1500);
        let mut i = 0i64;
        while bucket
            .add_entry(i as usize, &leaf_entry(i, &chunk), true)
            .unwrap()
        {
            i += 1;
        }

        let huge = "y".repeat(3000);
        assert!(!bucket.update_value(0, &huge).unwrap());
        // Unchanged on refusal.
        assert_eq!(bucket.value_at(0).unwrap(), chunk);
    }

    #[test]
    fn shrink_keeps_prefix_and_metadata() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();

        bucket.set_tree_size(99).unwrap();
        bucket.set_right_sibling(BucketPointer::new(5, 16384)).unwrap();
        for i in 0..8i64 {
            bucket
                .add_entry(i as usize, &leaf_entry(i, &format!("v{i}")), true)
                .unwrap();
        }

        bucket.shrink(3).unwrap();

        assert_eq!(bucket.size().unwrap(), 3);
        assert_eq!(bucket.tree_size().unwrap(), 99);
        assert_eq!(bucket.right_sibling().unwrap(), BucketPointer::new(5, 16384));
        let keys: Vec<i64> = (0..3).map(|i| bucket.key_at(i).unwrap()).collect();
        assert_eq!(keys, vec![0, 1, 2]);
    }

    #[test]
    fn interior_entries_round_trip_children() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, false, &KC, &VC).unwrap();

        let left = BucketPointer::new(2, 16384);
        let right = BucketPointer::new(3, 16384);
        bucket
            .add_entry(0, &TreeEntry::interior(left, right, 50), true)
            .unwrap();

        assert!(!bucket.is_leaf());
        assert_eq!(bucket.children_at(0).unwrap(), (left, right));
        assert_eq!(bucket.key_at(0).unwrap(), 50);
        assert_eq!(bucket.get_entry(0).unwrap().value, None);
    }

    #[test]
    fn interior_insert_updates_neighbor_children() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        let mut bucket = BonsaiBucketMut::init(&mut view, 16384, false, &KC, &VC).unwrap();

        let a = BucketPointer::new(1, 16384);
        let b = BucketPointer::new(2, 16384);
        let c = BucketPointer::new(3, 16384);
        bucket.add_entry(0, &TreeEntry::interior(a, b, 10), true).unwrap();
        bucket.add_entry(1, &TreeEntry::interior(b, c, 30), true).unwrap();

        // Child b splits into (b, b2) around key 20.
        let b2 = BucketPointer::new(4, 16384);
        bucket.add_entry(1, &TreeEntry::interior(b, b2, 20), true).unwrap();

        // Adjacent entries must share the child between them.
        assert_eq!(bucket.children_at(0).unwrap(), (a, b));
        assert_eq!(bucket.children_at(1).unwrap(), (b, b2));
        assert_eq!(bucket.children_at(2).unwrap(), (b2, c));
    }

    #[test]
    fn read_view_agrees_with_mut_view() {
        let mut page = make_page();
        {
            let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
            let mut bucket = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();
            for i in 0..4i64 {
                bucket
                    .add_entry(i as usize, &leaf_entry(i * 10, &format!("v{i}")), true)
                    .unwrap();
            }
            bucket.set_tree_size(4).unwrap();
        }

        let bucket = BonsaiBucket::from_page(&page, 16384, &KC, &VC).unwrap();
        assert!(bucket.is_leaf());
        assert_eq!(bucket.size(), 4);
        assert_eq!(bucket.tree_size(), 4);
        assert_eq!(bucket.find(&20).unwrap(), SearchResult::Found(2));
        assert_eq!(bucket.value_at(1).unwrap(), "v1");
        assert_eq!(
            bucket.get_entry(3).unwrap(),
            TreeEntry::leaf(30, "v3".to_string())
        );
    }

    #[test]
    fn regions_at_different_offsets_are_independent() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();

        {
            let mut first = BonsaiBucketMut::init(&mut view, 16384, true, &KC, &VC).unwrap();
            first.add_entry(0, &leaf_entry(1, "first"), true).unwrap();
        }
        {
            let mut second = BonsaiBucketMut::init(&mut view, 32768, true, &KC, &VC).unwrap();
            second.add_entry(0, &leaf_entry(2, "second"), true).unwrap();
        }

        let first = BonsaiBucketMut::new(&mut view, 16384, &KC, &VC).unwrap();
        assert_eq!(first.key_at(0).unwrap(), 1);
        assert_eq!(first.value_at(0).unwrap(), "first");
    }
}
