#![forbid(unsafe_code)]
//! Identifier newtypes, on-disk flag constants, and container options.
//!
//! Inode and block ids are 1-based; id 0 is the "none" sentinel everywhere
//! (no first block, no owning inode). Ids are fixed at 32 bits on disk.

use nestfs_error::{EfsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard ceiling on `FsOptions::filename_length`.
pub const MAX_FILENAME_LENGTH: u16 = 128;

/// Number of bits in an encoded id. Recorded in the container magic so an
/// image created with a different id width is rejected at open.
pub const ID_TYPE_BITS: u32 = 32;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeId(pub u32);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId(pub u32);

impl InodeId {
    /// "Not an inode".
    pub const NONE: Self = Self(0);
    /// The root entry; always marked used and never allocatable.
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BlockId {
    /// "Not a block" / end of chain.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode flag bits (stored as a tagged u8 on disk).
pub mod inode_flags {
    pub const UNUSED: u8 = 0x00;
    pub const USED: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x04;
    pub const OPENED: u8 = 0x08;
}

/// Block flag bits (stored as a tagged u16 on disk).
pub mod block_flags {
    pub const USED: u16 = 0x01;
}

/// Container geometry and client identification.
///
/// Immutable after `mkfs` except through the engine's explicit growth
/// operation; changing any field on a live container corrupts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsOptions {
    /// Opaque client magic blob, stored verbatim in the container header.
    pub magic: Vec<u8>,
    /// Data bytes per block, excluding the block header.
    pub block_size: u32,
    /// Number of block slots.
    pub block_count: u32,
    /// Number of inode slots, including the reserved root.
    pub inode_count: u32,
    /// Maximum filename length; fixes the width of name table records.
    pub filename_length: u16,
}

impl Default for FsOptions {
    fn default() -> Self {
        Self {
            magic: b"nestfs".to_vec(),
            block_size: 4096,
            block_count: 512,
            inode_count: 128,
            filename_length: 64,
        }
    }
}

impl FsOptions {
    /// Validate the geometry for container creation.
    ///
    /// The floor of 32 on `block_size` keeps the per-block overhead (a
    /// 14-byte header) from dominating the container.
    pub fn validate(&self) -> Result<()> {
        if self.inode_count < 2 {
            return Err(EfsError::Range(format!(
                "inode_count {} < 2 (id 1 is reserved for the root entry)",
                self.inode_count
            )));
        }
        if self.block_size < 32 {
            return Err(EfsError::Range(format!(
                "block_size {} < 32",
                self.block_size
            )));
        }
        if self.block_count < self.inode_count {
            return Err(EfsError::Range(format!(
                "block_count {} < inode_count {}",
                self.block_count, self.inode_count
            )));
        }
        if self.filename_length == 0 || self.filename_length > MAX_FILENAME_LENGTH {
            return Err(EfsError::Range(format!(
                "filename_length {} not in 1..={MAX_FILENAME_LENGTH}",
                self.filename_length
            )));
        }
        if self.magic.is_empty() {
            return Err(EfsError::Range("client magic must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Whether `id` names an inode slot in this geometry.
    #[must_use]
    pub fn inode_id_in_range(&self, id: InodeId) -> bool {
        id.0 >= 1 && id.0 <= self.inode_count
    }

    /// Whether `id` names a block slot in this geometry.
    #[must_use]
    pub fn block_id_in_range(&self, id: BlockId) -> bool {
        id.0 >= 1 && id.0 <= self.block_count
    }
}

/// Runtime engine configuration, validated once at construction.
///
/// Replaces what would otherwise be a matrix of build-time feature flags:
/// each field is independent and documented, and disabling a cache changes
/// performance, never on-disk state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Eagerly scan the inode table at open to populate the used bitsets
    /// and the name caches. Disabling this makes open O(1) but the first
    /// name lookup and allocation O(N).
    pub load_caches_on_open: bool,
    /// Keep the name hash + string caches at all. When false, every name
    /// lookup is a linear table scan.
    pub use_name_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_caches_on_open: true,
            use_name_cache: true,
        }
    }
}
