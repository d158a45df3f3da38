//! # Page Header and Durable Page Views
//!
//! Every 64KB page begins with a 16-byte header whose only live field is the
//! LSN of the last WAL record that touched the page. Bucket regions start at
//! region-aligned offsets past the header.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   ------------------------------------------
//! 0       8      lsn        LSN of the last logged change (0 = never logged)
//! 8       8      reserved
//! 16384   16384  bucket region 1 (conventional root/new-bucket slot)
//! 32768   16384  bucket region 2
//! 49152   16384  bucket region 3
//! ```
//!
//! ## Change Tracking
//!
//! `DurablePage` is the only write path to page bytes. Under
//! `TrackMode::Full` every write records an `(offset, old, new)` delta; the
//! accumulated `PageChanges` become the payload of an `UpdatePage` WAL record
//! and can later be re-applied (redo) or reverted (undo) byte-for-byte.
//! Under `TrackMode::None` writes go straight through — used when no WAL is
//! attached or no storage transaction is active.
//!
//! The LSN header field is deliberately written outside tracking: it is
//! recovery bookkeeping, not page content, and replaying a delta must not
//! clobber the LSN the replay itself maintains.
//!
//! ## Thread Safety
//!
//! A `DurablePage` borrows a page buffer exclusively; synchronization is the
//! page cache's per-page lock, which callers hold for the lifetime of the
//! view.

use bytes::{Buf, BufMut, BytesMut};
use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    lsn: U64,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.get()
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = U64::new(lsn);
    }
}

/// Whether a page view buffers deltas for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    None,
    Full,
}

/// One tracked byte-range change: `old` is the pre-image (undo), `new` the
/// post-image (redo). Both slices cover the same `[offset, offset + len)`
/// range of the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDelta {
    pub offset: u32,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Ordered list of deltas accumulated by one page view since its last reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageChanges {
    deltas: Vec<PageDelta>,
}

impl PageChanges {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    fn push(&mut self, delta: PageDelta) {
        self.deltas.push(delta);
    }

    /// Re-applies the post-images to `page` (recovery redo).
    pub fn apply_redo(&self, page: &mut [u8]) -> Result<()> {
        for delta in &self.deltas {
            let start = delta.offset as usize;
            let end = start + delta.new.len();
            ensure!(
                end <= page.len(),
                "page delta [{}, {}) exceeds page size {}",
                start,
                end,
                page.len()
            );
            page[start..end].copy_from_slice(&delta.new);
        }
        Ok(())
    }

    /// Restores the pre-images, newest delta first (undo).
    pub fn apply_undo(&self, page: &mut [u8]) -> Result<()> {
        for delta in self.deltas.iter().rev() {
            let start = delta.offset as usize;
            let end = start + delta.old.len();
            ensure!(
                end <= page.len(),
                "page delta [{}, {}) exceeds page size {}",
                start,
                end,
                page.len()
            );
            page[start..end].copy_from_slice(&delta.old);
        }
        Ok(())
    }

    pub fn to_bytes(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.deltas.len() as u32);
        for delta in &self.deltas {
            buf.put_u32_le(delta.offset);
            buf.put_u32_le(delta.new.len() as u32);
            buf.put_slice(&delta.old);
            buf.put_slice(&delta.new);
        }
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        ensure!(data.len() >= 4, "page changes payload too short");
        let count = data.get_u32_le() as usize;

        let mut deltas = Vec::with_capacity(count);
        for _ in 0..count {
            ensure!(data.len() >= 8, "truncated page delta header");
            let offset = data.get_u32_le();
            let len = data.get_u32_le() as usize;
            ensure!(data.len() >= 2 * len, "truncated page delta body");

            let old = data[..len].to_vec();
            data.advance(len);
            let new = data[..len].to_vec();
            data.advance(len);

            deltas.push(PageDelta { offset, old, new });
        }

        Ok(Self { deltas })
    }
}

/// Exclusive write view over one page buffer with delta tracking.
pub struct DurablePage<'a> {
    data: &'a mut [u8],
    track_mode: TrackMode,
    changes: PageChanges,
}

impl<'a> DurablePage<'a> {
    pub fn new(data: &'a mut [u8], track_mode: TrackMode) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self {
            data,
            track_mode,
            changes: PageChanges::default(),
        })
    }

    pub fn lsn(&self) -> u64 {
        PageHeader::from_bytes(self.data).unwrap().lsn()
    }

    /// Stores the LSN assigned to the latest change record. Not tracked.
    pub fn set_lsn(&mut self, lsn: u64) {
        PageHeader::from_bytes_mut(self.data).unwrap().set_lsn(lsn);
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        ensure!(
            offset + len <= PAGE_SIZE,
            "page read [{}, {}) out of bounds",
            offset,
            offset + len
        );
        Ok(&self.data[offset..offset + len])
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn get_u16(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.bytes(offset, 2)?.try_into()?))
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(offset, 4)?.try_into()?))
    }

    pub fn get_u64(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(offset, 8)?.try_into()?))
    }

    pub fn get_i64(&self, offset: usize) -> Result<i64> {
        Ok(i64::from_le_bytes(self.bytes(offset, 8)?.try_into()?))
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        ensure!(
            offset + bytes.len() <= PAGE_SIZE,
            "page write [{}, {}) out of bounds",
            offset,
            offset + bytes.len()
        );

        if self.track_mode == TrackMode::Full {
            self.changes.push(PageDelta {
                offset: offset as u32,
                old: self.data[offset..offset + bytes.len()].to_vec(),
                new: bytes.to_vec(),
            });
        }

        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write_bytes(offset, &[value])
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Moves `len` bytes from `src` to `dst` within the page, recording the
    /// destination range as a single delta.
    pub fn move_bytes(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        let moved = self.bytes(src, len)?.to_vec();
        self.write_bytes(dst, &moved)
    }

    /// Drains the accumulated deltas, resetting the view's buffer.
    pub fn take_changes(&mut self) -> PageChanges {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn header_lsn_round_trip() {
        let mut page = make_page();
        PageHeader::from_bytes_mut(&mut page).unwrap().set_lsn(42);
        assert_eq!(PageHeader::from_bytes(&page).unwrap().lsn(), 42);
    }

    #[test]
    fn tracked_writes_record_old_and_new_images() {
        let mut page = make_page();
        page[100..104].copy_from_slice(&[1, 2, 3, 4]);

        let mut view = DurablePage::new(&mut page, TrackMode::Full).unwrap();
        view.write_bytes(100, &[9, 8, 7, 6]).unwrap();

        let changes = view.take_changes();
        assert_eq!(changes.len(), 1);

        let mut replayed = make_page();
        changes.apply_redo(&mut replayed).unwrap();
        assert_eq!(&replayed[100..104], &[9, 8, 7, 6]);

        let mut reverted = page.clone();
        changes.apply_undo(&mut reverted).unwrap();
        assert_eq!(&reverted[100..104], &[1, 2, 3, 4]);
    }

    #[test]
    fn untracked_writes_leave_no_deltas() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::None).unwrap();
        view.set_u64(200, 0xDEAD_BEEF).unwrap();

        assert!(view.take_changes().is_empty());
        assert_eq!(view.get_u64(200).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn set_lsn_is_not_tracked() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::Full).unwrap();
        view.set_lsn(7);

        assert!(view.take_changes().is_empty());
        assert_eq!(view.lsn(), 7);
    }

    #[test]
    fn changes_serialize_round_trip() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::Full).unwrap();
        view.set_u16(20, 77).unwrap();
        view.write_bytes(5000, b"abcdef").unwrap();
        let changes = view.take_changes();

        let mut buf = BytesMut::new();
        changes.to_bytes(&mut buf);
        let decoded = PageChanges::from_bytes(&buf).unwrap();

        assert_eq!(decoded, changes);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut page = make_page();
        let mut view = DurablePage::new(&mut page, TrackMode::Full).unwrap();

        assert!(view.bytes(PAGE_SIZE - 2, 4).is_err());
        assert!(view.write_bytes(PAGE_SIZE, &[1]).is_err());
    }

    #[test]
    fn rejects_wrong_buffer_size() {
        let mut short = vec![0u8; PAGE_SIZE - 1];
        assert!(DurablePage::new(&mut short, TrackMode::None).is_err());
    }
}
