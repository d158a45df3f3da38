//! # Write-Ahead Log
//!
//! Append-only log of the records that make tree mutations crash-recoverable.
//! Every page modification performed inside an atomic operation is logged
//! before the page leaves its exclusive lock, so the log alone can rebuild
//! the effects of every completed atomic unit.
//!
//! ## Record Kinds
//!
//! - `AtomicUnitStart` — opens an atomic unit; its LSN becomes the unit's
//!   start LSN, which new pages link back to.
//! - `AtomicUnitEnd` — closes a unit, recording whether it rolled back.
//! - `UpdatePage` — byte-range deltas of one page, chained to the page's
//!   previous record via `prev_lsn`.
//!
//! ## On-Disk Format
//!
//! ```text
//! +--------------------+-----------------+
//! | Record Header (16B)| Payload         |
//! +--------------------+-----------------+
//! ```
//!
//! The header carries the payload length, the record type, and a CRC-64 over
//! type + payload. A short, zeroed, or checksum-failing tail is treated as
//! the end of the log: torn final writes are expected after a crash and are
//! discarded on open.
//!
//! ## LSNs
//!
//! An LSN is the 1-based ordinal of a record in the log. Page headers store
//! the LSN of the last record that touched the page, giving recovery an
//! idempotence check and each page an undo chain through `prev_lsn`.
//!
//! ## Concurrency
//!
//! Appends serialize through a single mutex and sync before returning.
//! Scans map the file read-only and never touch the writer's state.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::page::PageChanges;
use crate::config::WAL_RECORD_HEADER_SIZE;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Log sequence number: 1-based ordinal of a record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// "Never logged" marker stored in fresh page headers.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one atomic operation unit. Unique within a log's lifetime;
/// the storage seeds its generator past the highest id found on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationUnitId(pub u64);

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum RecordType {
    AtomicUnitStart = 1,
    AtomicUnitEnd = 2,
    UpdatePage = 3,
}

impl RecordType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(RecordType::AtomicUnitStart),
            2 => Ok(RecordType::AtomicUnitEnd),
            3 => Ok(RecordType::UpdatePage),
            _ => bail!("invalid WAL record type: {}", b),
        }
    }
}

/// A logical log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicUnitStart {
        rollback_supported: bool,
        unit_id: OperationUnitId,
    },
    AtomicUnitEnd {
        unit_id: OperationUnitId,
        rollback: bool,
    },
    UpdatePage {
        file_id: u32,
        page_index: u64,
        unit_id: OperationUnitId,
        prev_lsn: Lsn,
        changes: PageChanges,
    },
}

impl WalRecord {
    fn record_type(&self) -> RecordType {
        match self {
            WalRecord::AtomicUnitStart { .. } => RecordType::AtomicUnitStart,
            WalRecord::AtomicUnitEnd { .. } => RecordType::AtomicUnitEnd,
            WalRecord::UpdatePage { .. } => RecordType::UpdatePage,
        }
    }

    pub fn unit_id(&self) -> OperationUnitId {
        match self {
            WalRecord::AtomicUnitStart { unit_id, .. } => *unit_id,
            WalRecord::AtomicUnitEnd { unit_id, .. } => *unit_id,
            WalRecord::UpdatePage { unit_id, .. } => *unit_id,
        }
    }

    fn payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            WalRecord::AtomicUnitStart {
                rollback_supported,
                unit_id,
            } => {
                buf.put_u8(*rollback_supported as u8);
                buf.put_u64_le(unit_id.0);
            }
            WalRecord::AtomicUnitEnd { unit_id, rollback } => {
                buf.put_u64_le(unit_id.0);
                buf.put_u8(*rollback as u8);
            }
            WalRecord::UpdatePage {
                file_id,
                page_index,
                unit_id,
                prev_lsn,
                changes,
            } => {
                buf.put_u32_le(*file_id);
                buf.put_u64_le(*page_index);
                buf.put_u64_le(unit_id.0);
                buf.put_u64_le(prev_lsn.0);
                changes.to_bytes(&mut buf);
            }
        }
        buf
    }

    fn decode(record_type: RecordType, mut data: &[u8]) -> Result<Self> {
        match record_type {
            RecordType::AtomicUnitStart => {
                ensure!(data.len() >= 9, "truncated AtomicUnitStart payload");
                let rollback_supported = data.get_u8() != 0;
                let unit_id = OperationUnitId(data.get_u64_le());
                Ok(WalRecord::AtomicUnitStart {
                    rollback_supported,
                    unit_id,
                })
            }
            RecordType::AtomicUnitEnd => {
                ensure!(data.len() >= 9, "truncated AtomicUnitEnd payload");
                let unit_id = OperationUnitId(data.get_u64_le());
                let rollback = data.get_u8() != 0;
                Ok(WalRecord::AtomicUnitEnd { unit_id, rollback })
            }
            RecordType::UpdatePage => {
                ensure!(data.len() >= 28, "truncated UpdatePage payload");
                let file_id = data.get_u32_le();
                let page_index = data.get_u64_le();
                let unit_id = OperationUnitId(data.get_u64_le());
                let prev_lsn = Lsn(data.get_u64_le());
                let changes = PageChanges::from_bytes(data)?;
                Ok(WalRecord::UpdatePage {
                    file_id,
                    page_index,
                    unit_id,
                    prev_lsn,
                    changes,
                })
            }
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RecordHeader {
    payload_len: U32,
    record_type: u8,
    reserved: [u8; 3],
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == WAL_RECORD_HEADER_SIZE);

fn compute_checksum(record_type: u8, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[record_type]);
    digest.update(payload);
    digest.finalize()
}

struct WalInner {
    file: File,
    offset: u64,
    next_lsn: u64,
}

/// Single-file write-ahead log.
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL at {:?}", path))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                offset: 0,
                next_lsn: 1,
            }),
        })
    }

    /// Opens an existing log, validating the tail. Torn or corrupt trailing
    /// bytes are truncated away so the next append lands on a clean boundary.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create(path);
        }

        let records = scan_records(path)?;
        let valid_end: u64 = records
            .iter()
            .map(|r| (WAL_RECORD_HEADER_SIZE + r.payload_len) as u64)
            .sum();
        let count = records.len() as u64;

        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        file.set_len(valid_end)
            .wrap_err("failed to trim torn WAL tail")?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                offset: valid_end,
                next_lsn: count + 1,
            }),
        })
    }

    /// Appends a record and syncs it to disk, returning its LSN.
    pub fn log(&self, record: &WalRecord) -> Result<Lsn> {
        let payload = record.payload();
        let record_type = record.record_type() as u8;
        let header = RecordHeader {
            payload_len: U32::new(payload.len() as u32),
            record_type,
            reserved: [0; 3],
            checksum: U64::new(compute_checksum(record_type, &payload)),
        };

        let mut inner = self.inner.lock();
        inner
            .file
            .write_all(header.as_bytes())
            .wrap_err("failed to write WAL record header")?;
        inner
            .file
            .write_all(&payload)
            .wrap_err("failed to write WAL record payload")?;
        inner
            .file
            .sync_data()
            .wrap_err("failed to sync WAL record")?;

        inner.offset += (WAL_RECORD_HEADER_SIZE + payload.len()) as u64;
        let lsn = Lsn(inner.next_lsn);
        inner.next_lsn += 1;
        Ok(lsn)
    }

    /// Highest atomic-unit id that appears in the log, if any. Used to seed
    /// the unit-id generator past ids consumed before a crash.
    pub fn max_unit_id(&self) -> Result<Option<u64>> {
        Ok(self
            .read_records()?
            .into_iter()
            .map(|(_, record)| record.unit_id().0)
            .max())
    }

    /// Reads every valid record in log order with its LSN.
    pub fn read_records(&self) -> Result<Vec<(Lsn, WalRecord)>> {
        let _guard = self.inner.lock();
        let scanned = scan_records(&self.path)?;
        scanned
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let record = WalRecord::decode(raw.record_type, &raw.payload)?;
                Ok((Lsn(i as u64 + 1), record))
            })
            .collect()
    }

    /// Discards all records. Called after a checkpoint has made the data
    /// files authoritative.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0).wrap_err("failed to truncate WAL")?;
        inner
            .file
            .sync_data()
            .wrap_err("failed to sync WAL after truncate")?;
        inner.offset = 0;
        inner.next_lsn = 1;
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.inner.lock().offset
    }
}

struct RawRecord {
    record_type: RecordType,
    payload_len: usize,
    payload: Vec<u8>,
}

/// Scans the log file, stopping at the first short, zeroed, or
/// checksum-failing record.
fn scan_records(path: &Path) -> Result<Vec<RawRecord>> {
    let file = File::open(path).wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Ok(Vec::new());
    }

    let mmap = unsafe { Mmap::map(&file).wrap_err("failed to mmap WAL for scan")? };

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset + WAL_RECORD_HEADER_SIZE <= len {
        let header_bytes = &mmap[offset..offset + WAL_RECORD_HEADER_SIZE];
        let header = match RecordHeader::read_from_bytes(header_bytes) {
            Ok(h) => h,
            Err(_) => break,
        };

        let payload_len = header.payload_len.get() as usize;
        let record_type = match RecordType::from_byte(header.record_type) {
            Ok(t) => t,
            Err(_) => break,
        };

        let payload_start = offset + WAL_RECORD_HEADER_SIZE;
        if payload_start + payload_len > len {
            break;
        }

        let payload = &mmap[payload_start..payload_start + payload_len];
        if compute_checksum(header.record_type, payload) != header.checksum.get() {
            break;
        }

        records.push(RawRecord {
            record_type,
            payload_len,
            payload: payload.to_vec(),
        });
        offset = payload_start + payload_len;
    }

    Ok(records)
}
