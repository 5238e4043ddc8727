#![forbid(unsafe_code)]
//! Seekable byte devices and the record-addressed fence built on them.
//!
//! A [`Device`] is a synchronous, single-owner, seekable byte store: a file,
//! a growable memory buffer, or anything else that can honor the same
//! contract. The engine consumes devices exclusively through this trait.
//!
//! A [`Fence`] partitions a byte range of a device into fixed-size records
//! addressed by index; it is the only mechanism by which the engine touches
//! the name, inode, and block tables on disk.

mod fence;

pub use fence::Fence;

use nestfs_error::{EfsError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Synchronous seekable byte device.
///
/// Implementations keep a single cursor shared by reads and writes, like a
/// POSIX file description. All methods take `&mut self`; a device has
/// exactly one owner at a time.
pub trait Device {
    /// Read up to `buf.len()` bytes at the cursor, advancing it. Returns the
    /// number of bytes read; 0 at end of device.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf` at the cursor, advancing it. Returns the number of bytes
    /// written. Writing past the end grows the device where supported.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Reposition the cursor. Returns the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Current absolute cursor position.
    fn tell(&mut self) -> Result<u64>;

    /// Grow or shrink the device to exactly `size` bytes. The cursor is
    /// clamped to the new end if it would fall past it.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Flush buffered writes to the backing store.
    fn flush(&mut self) -> Result<()>;

    /// Total device length in bytes.
    fn size(&mut self) -> Result<u64>;

    /// Whether the cursor is at or past the end of the device.
    fn eof(&mut self) -> Result<bool> {
        Ok(self.tell()? >= self.size()?)
    }

    /// Native file handle, if this device is file-backed. Side-channel
    /// introspection used for advisory locking.
    fn as_file(&self) -> Option<&File> {
        None
    }

    /// Raw buffer contents, if this device is memory-backed.
    fn as_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// Take a blocking advisory lock on the backing store. Cross-process
    /// only, never an in-process mutex. Devices without a native file
    /// handle report `Unsupported`.
    fn lock(&mut self, _exclusive: bool) -> Result<()> {
        Err(EfsError::Unsupported("locking on this device"))
    }

    /// Release an advisory lock taken with [`Device::lock`].
    fn unlock(&mut self) -> Result<()> {
        Err(EfsError::Unsupported("locking on this device"))
    }

    /// Flush and release any OS resources. The device must not be used
    /// afterwards.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    /// Read exactly `buf.len()` bytes or fail with a short-transfer error.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                return Err(EfsError::short_io("read", buf.len(), done));
            }
            done += n;
        }
        Ok(())
    }

    /// Write all of `buf` or fail with a short-transfer error.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..])?;
            if n == 0 {
                return Err(EfsError::short_io("write", buf.len(), done));
            }
            done += n;
        }
        Ok(())
    }
}

/// Growable in-memory device.
///
/// Writes past the current end zero-extend the buffer. The buffer may be
/// larger than a container declares itself to be; the engine tolerates
/// that at open time.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    buf: Vec<u8>,
    pos: u64,
}

impl MemoryDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sized zero-filled buffer.
    #[must_use]
    pub fn with_capacity(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            pos: 0,
        }
    }

    /// Wrap existing bytes (e.g. a container image read from elsewhere).
    #[must_use]
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

fn pos_to_usize(pos: u64) -> Result<usize> {
    usize::try_from(pos).map_err(|_| EfsError::Range(format!("position {pos} overflows usize")))
}

impl Device for MemoryDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pos = pos_to_usize(self.pos)?;
        if pos >= self.buf.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.buf.len() - pos);
        buf[..n].copy_from_slice(&self.buf[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let pos = pos_to_usize(self.pos)?;
        let end = pos
            .checked_add(buf.len())
            .ok_or_else(|| EfsError::Range("write range overflows usize".to_owned()))?;
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[pos..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.buf.len() as u64;
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => i128::from(len) + i128::from(d),
        };
        if target < 0 {
            return Err(EfsError::Range(format!("seek before start ({target})")));
        }
        self.pos =
            u64::try_from(target).map_err(|_| EfsError::Range("seek overflows u64".to_owned()))?;
        Ok(self.pos)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let size = pos_to_usize(size)?;
        self.buf.resize(size, 0);
        if self.pos > size as u64 {
            self.pos = size as u64;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        Some(&self.buf)
    }
}

/// File-backed device.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    writable: bool,
}

impl FileDevice {
    /// Open an existing file read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Self {
                file,
                writable: true,
            }),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "falling back to read-only");
                let file = OpenOptions::new().read(true).open(path)?;
                Ok(Self {
                    file,
                    writable: false,
                })
            }
        }
    }

    /// Create (or truncate) a file read-write.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Device for FileDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(EfsError::Access("device opened read-only"));
        }
        Ok(self.file.write(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if !self.writable {
            return Err(EfsError::Access("device opened read-only"));
        }
        self.file.set_len(size)?;
        if self.file.stream_position()? > size {
            self.file.seek(SeekFrom::Start(size))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn as_file(&self) -> Option<&File> {
        Some(&self.file)
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        // Blocks indefinitely; advisory and cross-process only.
        if exclusive {
            self.file.lock()?;
        } else {
            self.file.lock_shared()?;
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.file.unlock()?;
        Ok(())
    }
}
