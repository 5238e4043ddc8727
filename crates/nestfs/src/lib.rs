#![forbid(unsafe_code)]
//! Embedded virtual filesystem.
//!
//! Stores many independently resizable pseudo-files inside a single
//! seekable container (a file, a memory buffer, or any [`Device`]), with
//! POSIX-like open/read/write/seek/truncate/close semantics per entry.
//!
//! ```no_run
//! use nestfs::{Filesystem, FsOptions, MemoryDevice, OpenMode};
//!
//! # fn main() -> nestfs::Result<()> {
//! let mut fs = Filesystem::mkfs(FsOptions::default(), Box::new(MemoryDevice::new()))?;
//! let mut file = fs.open_file(b"greeting", OpenMode::ReadWrite)?;
//! fs.write(&mut file, b"hello")?;
//! fs.close(file)?;
//! let device = fs.finalize()?;
//! # let _ = device;
//! # Ok(())
//! # }
//! ```

pub use nestfs_core::{
    calculate_size, Block, FileHandle, Filesystem, Inode, Layout, OpenMode, CONTAINER_MAGIC,
};
pub use nestfs_device::{Device, Fence, FileDevice, MemoryDevice};
pub use nestfs_error::{EfsError, Result};
pub use nestfs_types::{
    block_flags, inode_flags, BlockId, EngineConfig, FsOptions, InodeId, MAX_FILENAME_LENGTH,
};

/// On-disk codec primitives, exposed for tooling that inspects containers.
pub mod codec {
    pub use nestfs_codec::*;
}
