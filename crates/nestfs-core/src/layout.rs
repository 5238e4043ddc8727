//! On-disk layout: a pure function of the container options.
//!
//! The container is a fixed sequence of regions: core magic, total size
//! field, client magic blob, options block, name table, inode table, block
//! table. Every offset below is derived from [`FsOptions`] alone, so `open`
//! reproduces the creating layout by construction once it has read the
//! options back.

use nestfs_codec::{SIZEOF_ID, SIZEOF_U16, SIZEOF_U32, SIZEOF_U8};
use nestfs_error::{EfsError, Result};
use nestfs_types::{FsOptions, ID_TYPE_BITS};

/// Core magic sequence, stored as tagged u32 values at offset 0.
///
/// The third element records the id width, so an image written with a
/// different width fails the magic match instead of misparsing.
pub const CONTAINER_MAGIC: [u32; 3] = [0x4E45_5354, 0x4653_0001, ID_TYPE_BITS];

/// Tag byte opening every name table record.
pub const TAG_NAME_RECORD: u8 = 0x80 | b'\'';
/// Tag byte opening every inode table record.
pub const TAG_INODE_RECORD: u8 = 0x80 | b'i';
/// Tag byte opening every block header.
pub const TAG_BLOCK_RECORD: u8 = 0x80 | b'#';

/// Inode record: tag + id + flags u8 + mtime u32 + data size u32 + first
/// block id. 23 bytes.
pub const INODE_RECORD_SIZE: u32 =
    (1 + SIZEOF_ID + SIZEOF_U8 + SIZEOF_U32 + SIZEOF_U32 + SIZEOF_ID) as u32;

/// Name record header: tag + owner id + length u16. The name bytes follow,
/// padded to `filename_length`.
pub const NAME_RECORD_HEADER_SIZE: u32 = (1 + SIZEOF_ID + SIZEOF_U16) as u32;

/// Block header: tag + id + flags u16 + next block id. The `block_size`
/// data bytes follow. 14 bytes.
pub const BLOCK_HEADER_SIZE: u32 = (1 + SIZEOF_ID + SIZEOF_U16 + SIZEOF_ID) as u32;

/// Options block: block size u32 + block count u32 + inode count u32 +
/// filename length u16.
pub const OPTIONS_BLOCK_SIZE: u32 = (3 * SIZEOF_U32 + SIZEOF_U16) as u32;

/// Byte offsets and record sizes of every container region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Core magic sequence; always 0.
    pub core_magic_offset: u64,
    /// Declared total container size (tagged u32, written last by mkfs).
    pub size_field_offset: u64,
    /// Client magic blob (u16 length + raw bytes).
    pub client_magic_offset: u64,
    /// Options block.
    pub options_offset: u64,
    /// Name table: one record per inode slot.
    pub name_table_offset: u64,
    /// Inode table: one record per inode slot.
    pub inode_table_offset: u64,
    /// Block table: header + data per block slot.
    pub block_table_offset: u64,
    /// Name record size including padding.
    pub name_record_size: u32,
    /// Full block record size: header + block data.
    pub block_record_size: u32,
    /// Total container size in bytes.
    pub total_size: u64,
}

fn add(a: u64, b: u64) -> Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| EfsError::Range("layout offset overflows u64".to_owned()))
}

fn mul(a: u64, b: u64) -> Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| EfsError::Range("layout region size overflows u64".to_owned()))
}

impl Layout {
    /// Compute the layout for `options`. Fails with `Range` when a region
    /// overflows or the total size does not fit the 32-bit size field.
    pub fn compute(options: &FsOptions) -> Result<Self> {
        let inode_count = u64::from(options.inode_count);
        let block_count = u64::from(options.block_count);

        let name_record_size = NAME_RECORD_HEADER_SIZE + u32::from(options.filename_length);
        let block_record_size = BLOCK_HEADER_SIZE
            .checked_add(options.block_size)
            .ok_or_else(|| EfsError::Range("block record size overflows u32".to_owned()))?;

        let core_magic_offset = 0;
        let size_field_offset = (CONTAINER_MAGIC.len() * SIZEOF_U32) as u64;
        let client_magic_offset = add(size_field_offset, SIZEOF_U32 as u64)?;
        let options_offset = add(
            client_magic_offset,
            add(SIZEOF_U16 as u64, options.magic.len() as u64)?,
        )?;
        let name_table_offset = add(options_offset, u64::from(OPTIONS_BLOCK_SIZE))?;
        let inode_table_offset = add(
            name_table_offset,
            mul(inode_count, u64::from(name_record_size))?,
        )?;
        let block_table_offset = add(
            inode_table_offset,
            mul(inode_count, u64::from(INODE_RECORD_SIZE))?,
        )?;
        let total_size = add(
            block_table_offset,
            mul(block_count, u64::from(block_record_size))?,
        )?;

        if u32::try_from(total_size).is_err() {
            return Err(EfsError::Range(format!(
                "container size {total_size} exceeds the 32-bit size field"
            )));
        }

        Ok(Self {
            core_magic_offset,
            size_field_offset,
            client_magic_offset,
            options_offset,
            name_table_offset,
            inode_table_offset,
            block_table_offset,
            name_record_size,
            block_record_size,
            total_size,
        })
    }
}

/// Byte length a freshly created container will have for `options`.
pub fn calculate_size(options: &FsOptions) -> Result<u64> {
    Ok(Layout::compute(options)?.total_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> FsOptions {
        FsOptions {
            magic: b"test".to_vec(),
            block_size: 128,
            block_count: 3,
            inode_count: 2,
            filename_length: 16,
        }
    }

    #[test]
    fn regions_are_contiguous_and_ordered() {
        let opt = small();
        let layout = Layout::compute(&opt).expect("layout");

        assert_eq!(layout.core_magic_offset, 0);
        assert_eq!(layout.size_field_offset, 15);
        assert_eq!(layout.client_magic_offset, 20);
        // u16 length prefix + 4 magic bytes.
        assert_eq!(layout.options_offset, 27);
        assert_eq!(layout.name_table_offset, 27 + 18);
        assert_eq!(layout.name_record_size, 9 + 16);
        assert_eq!(layout.inode_table_offset, layout.name_table_offset + 2 * 25);
        assert_eq!(
            layout.block_table_offset,
            layout.inode_table_offset + 2 * u64::from(INODE_RECORD_SIZE)
        );
        assert_eq!(layout.block_record_size, 14 + 128);
        assert_eq!(
            layout.total_size,
            layout.block_table_offset + 3 * u64::from(layout.block_record_size)
        );
    }

    #[test]
    fn size_is_pure_in_options() {
        let opt = small();
        assert_eq!(
            calculate_size(&opt).expect("size"),
            calculate_size(&opt.clone()).expect("size")
        );

        let bigger = FsOptions {
            block_count: 4,
            ..small()
        };
        assert_eq!(
            calculate_size(&bigger).expect("size"),
            calculate_size(&opt).expect("size") + u64::from(BLOCK_HEADER_SIZE) + 128
        );
    }

    #[test]
    fn oversized_geometry_is_rejected() {
        let opt = FsOptions {
            block_size: u32::MAX / 2,
            block_count: u32::MAX,
            inode_count: 2,
            ..small()
        };
        assert!(matches!(
            Layout::compute(&opt),
            Err(EfsError::Range(_))
        ));
    }
}
