//! Record-addressed window over a byte range of a device.

use crate::Device;
use nestfs_error::{EfsError, Result};
use std::io::SeekFrom;

/// A fence maps record index `i` (0-based) to the byte range
/// `offset + i*stride .. offset + i*stride + record_size` of a parent
/// device and enforces exact-size record transfers.
///
/// The stride defaults to the record size; a larger stride lets two fences
/// share one table region, e.g. block headers interleaved with block data.
///
/// The fence does not own the device; callers pass it per operation. The
/// engine keeps one fence per on-disk table (names, inodes, blocks).
#[derive(Debug, Clone)]
pub struct Fence {
    offset: u64,
    record_size: u32,
    stride: u32,
    record_count: u32,
    /// Written by `wipe`; always exactly `record_size` bytes.
    prototype: Vec<u8>,
}

impl Fence {
    /// Create a fence with stride equal to the record size. `prototype`,
    /// when given, must be exactly `record_size` bytes; when omitted,
    /// wiping writes zeroes.
    pub fn new(
        offset: u64,
        record_size: u32,
        record_count: u32,
        prototype: Option<&[u8]>,
    ) -> Result<Self> {
        Self::with_stride(offset, record_size, record_size, record_count, prototype)
    }

    /// Create a fence whose records repeat every `stride` bytes.
    pub fn with_stride(
        offset: u64,
        record_size: u32,
        stride: u32,
        record_count: u32,
        prototype: Option<&[u8]>,
    ) -> Result<Self> {
        if record_size == 0 || record_count == 0 {
            return Err(EfsError::Arg("fence record size and count must be nonzero"));
        }
        if stride < record_size {
            return Err(EfsError::Arg("fence stride smaller than record size"));
        }
        let record_len = usize::try_from(record_size)
            .map_err(|_| EfsError::Range(format!("record size {record_size} overflows usize")))?;
        let prototype = match prototype {
            Some(p) => {
                if p.len() != record_len {
                    return Err(EfsError::Arg("fence prototype length != record size"));
                }
                p.to_vec()
            }
            None => vec![0; record_len],
        };
        Ok(Self {
            offset,
            record_size,
            stride,
            record_count,
            prototype,
        })
    }

    #[must_use]
    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    #[must_use]
    pub fn in_range(&self, index: u32) -> bool {
        index < self.record_count
    }

    /// Byte offset of record `index` on the parent device.
    fn position(&self, index: u32) -> Result<u64> {
        if !self.in_range(index) {
            return Err(EfsError::Range(format!(
                "record {index} >= record count {}",
                self.record_count
            )));
        }
        u64::from(index)
            .checked_mul(u64::from(self.stride))
            .and_then(|rel| self.offset.checked_add(rel))
            .ok_or_else(|| EfsError::Range("record offset overflows u64".to_owned()))
    }

    fn check_span(&self, at: u32, len: usize) -> Result<()> {
        let end = u64::from(at) + len as u64;
        if end > u64::from(self.record_size) {
            return Err(EfsError::Range(format!(
                "span {at}..{end} exceeds record size {}",
                self.record_size
            )));
        }
        Ok(())
    }

    fn check_len(&self, buf_len: usize) -> Result<()> {
        if buf_len != self.prototype.len() {
            return Err(EfsError::Arg("record buffer length != record size"));
        }
        Ok(())
    }

    /// Read record `index` into `buf` (which must be record-sized).
    pub fn read(&self, dev: &mut dyn Device, index: u32, buf: &mut [u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let pos = self.position(index)?;
        dev.seek(SeekFrom::Start(pos))?;
        dev.read_exact(buf)
    }

    /// Write `buf` (which must be record-sized) as record `index`.
    pub fn write(&self, dev: &mut dyn Device, index: u32, buf: &[u8]) -> Result<()> {
        self.check_len(buf.len())?;
        let pos = self.position(index)?;
        dev.seek(SeekFrom::Start(pos))?;
        dev.write_all(buf)
    }

    /// Read part of record `index`, starting `at` bytes into it.
    pub fn read_at(&self, dev: &mut dyn Device, index: u32, at: u32, buf: &mut [u8]) -> Result<()> {
        self.check_span(at, buf.len())?;
        let pos = self.position(index)?;
        dev.seek(SeekFrom::Start(pos + u64::from(at)))?;
        dev.read_exact(buf)
    }

    /// Write part of record `index`, starting `at` bytes into it.
    pub fn write_at(&self, dev: &mut dyn Device, index: u32, at: u32, buf: &[u8]) -> Result<()> {
        self.check_span(at, buf.len())?;
        let pos = self.position(index)?;
        dev.seek(SeekFrom::Start(pos + u64::from(at)))?;
        dev.write_all(buf)
    }

    /// Reset record `index` to the prototype.
    pub fn wipe(&self, dev: &mut dyn Device, index: u32) -> Result<()> {
        let pos = self.position(index)?;
        dev.seek(SeekFrom::Start(pos))?;
        dev.write_all(&self.prototype)
    }
}
