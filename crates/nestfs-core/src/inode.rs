//! Inode and name table records.
//!
//! Both tables hold one fixed-size record per inode slot. Metadata and
//! names live in separate tables so metadata scans stay cheap regardless
//! of the configured filename length.

use crate::layout::{INODE_RECORD_SIZE, NAME_RECORD_HEADER_SIZE, TAG_INODE_RECORD, TAG_NAME_RECORD};
use nestfs_codec as codec;
use nestfs_error::{EfsError, Result};
use nestfs_types::{inode_flags, BlockId, InodeId};

/// In-memory copy of one inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub id: InodeId,
    pub flags: u8,
    /// Last modification, seconds since the Unix epoch.
    pub mtime: u32,
    pub data_size: u32,
    /// First block of the data chain; none when empty.
    pub first_block: BlockId,
}

impl Inode {
    /// Blank record for slot `id`.
    #[must_use]
    pub fn unused(id: InodeId) -> Self {
        Self {
            id,
            flags: inode_flags::UNUSED,
            mtime: 0,
            data_size: 0,
            first_block: BlockId::NONE,
        }
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.flags & inode_flags::USED != 0
    }

    /// Encode into a record-sized buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != INODE_RECORD_SIZE as usize {
            return Err(EfsError::Arg("inode record buffer has the wrong size"));
        }
        buf[0] = TAG_INODE_RECORD;
        let mut off = 1;
        off += codec::encode_u32(&mut buf[off..], self.id.0)?;
        off += codec::encode_u8(&mut buf[off..], self.flags)?;
        off += codec::encode_u32(&mut buf[off..], self.mtime)?;
        off += codec::encode_u32(&mut buf[off..], self.data_size)?;
        codec::encode_u32(&mut buf[off..], self.first_block.0)?;
        Ok(())
    }

    /// Decode a record read from slot `expect`. The stored id must match
    /// the slot it was read from.
    pub fn decode(buf: &[u8], expect: InodeId) -> Result<Self> {
        if buf.len() != INODE_RECORD_SIZE as usize {
            return Err(EfsError::Arg("inode record buffer has the wrong size"));
        }
        if buf[0] != TAG_INODE_RECORD {
            return Err(EfsError::Consistency(format!(
                "inode record tag mismatch: expected {TAG_INODE_RECORD:#04x}, got {:#04x}",
                buf[0]
            )));
        }
        let mut off = 1;
        let id = InodeId(codec::decode_u32(&buf[off..])?);
        off += codec::SIZEOF_U32;
        if id != expect && !id.is_none() {
            return Err(EfsError::Consistency(format!(
                "inode record in slot {expect} claims id {id}"
            )));
        }
        let flags = codec::decode_u8(&buf[off..])?;
        off += codec::SIZEOF_U8;
        let mtime = codec::decode_u32(&buf[off..])?;
        off += codec::SIZEOF_U32;
        let data_size = codec::decode_u32(&buf[off..])?;
        off += codec::SIZEOF_U32;
        let first_block = BlockId(codec::decode_u32(&buf[off..])?);
        Ok(Self {
            id: expect,
            flags,
            mtime,
            data_size,
            first_block,
        })
    }
}

/// Encode a name record: tag + owner id + length + name bytes, zero-padded
/// to the table's record size.
pub fn encode_name_record(buf: &mut [u8], owner: InodeId, name: &[u8]) -> Result<()> {
    let header = NAME_RECORD_HEADER_SIZE as usize;
    let width = buf
        .len()
        .checked_sub(header)
        .ok_or(EfsError::Arg("name record buffer shorter than its header"))?;
    if name.len() > width {
        return Err(EfsError::Range(format!(
            "name of {} bytes exceeds record width {width}",
            name.len()
        )));
    }
    buf[0] = TAG_NAME_RECORD;
    let mut off = 1;
    off += codec::encode_u32(&mut buf[off..], owner.0)?;
    let len = u16::try_from(name.len())
        .map_err(|_| EfsError::Range(format!("name length {} overflows u16", name.len())))?;
    off += codec::encode_u16(&mut buf[off..], len)?;
    buf[off..off + name.len()].copy_from_slice(name);
    buf[off + name.len()..].fill(0);
    Ok(())
}

/// Decode a name record into `(owner, name bytes)`.
pub fn decode_name_record(buf: &[u8]) -> Result<(InodeId, Vec<u8>)> {
    let header = NAME_RECORD_HEADER_SIZE as usize;
    if buf.len() < header {
        return Err(EfsError::Arg("name record buffer shorter than its header"));
    }
    if buf[0] != TAG_NAME_RECORD {
        return Err(EfsError::Consistency(format!(
            "name record tag mismatch: expected {TAG_NAME_RECORD:#04x}, got {:#04x}",
            buf[0]
        )));
    }
    let owner = InodeId(codec::decode_u32(&buf[1..])?);
    let len = usize::from(codec::decode_u16(&buf[1 + codec::SIZEOF_U32..])?);
    if len > buf.len() - header {
        return Err(EfsError::Consistency(format!(
            "name length {len} exceeds record width {}",
            buf.len() - header
        )));
    }
    Ok((owner, buf[header..header + len].to_vec()))
}

/// Blank name record used as the name table's wipe prototype.
#[must_use]
pub fn blank_name_record(record_size: u32) -> Vec<u8> {
    let mut buf = vec![0; record_size as usize];
    // Infallible for a well-formed record size; fall back to zeroes.
    if encode_name_record(&mut buf, InodeId::NONE, b"").is_err() {
        buf.fill(0);
    }
    buf
}
