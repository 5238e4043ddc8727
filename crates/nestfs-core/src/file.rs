//! Pseudo-file handles and the per-inode open table entry.

use crate::inode::Inode;
use nestfs_types::InodeId;

/// Access mode requested when opening a pseudo-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// One open pseudo-file: an inode id, a cursor, and the mode it was
/// opened with.
///
/// Handles are plain values; all I/O goes through [`Filesystem`] methods
/// that take the handle by reference. Closing consumes the handle, so a
/// closed handle cannot be used again. Size and chain state live in the
/// filesystem's per-inode open table, shared by every handle on the same
/// inode.
///
/// [`Filesystem`]: crate::Filesystem
#[derive(Debug)]
pub struct FileHandle {
    pub(crate) inode: InodeId,
    pub(crate) cursor: u64,
    pub(crate) mode: OpenMode,
}

impl FileHandle {
    pub(crate) fn new(inode: InodeId, mode: OpenMode) -> Self {
        Self {
            inode,
            cursor: 0,
            mode,
        }
    }

    #[must_use]
    pub fn inode(&self) -> InodeId {
        self.inode
    }

    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Current cursor position.
    #[must_use]
    pub fn tell(&self) -> u64 {
        self.cursor
    }
}

/// Shared state for one open inode, reference-counted across handles.
///
/// The inode's resources are released only when the last handle closes,
/// which makes every close ordering of sibling handles well-defined.
#[derive(Debug)]
pub(crate) struct OpenEntry {
    pub(crate) inode: Inode,
    pub(crate) open_count: u32,
    /// At most one writable handle per inode at a time.
    pub(crate) writer: bool,
}

impl OpenEntry {
    pub(crate) fn new(inode: Inode) -> Self {
        Self {
            inode,
            open_count: 0,
            writer: false,
        }
    }
}
