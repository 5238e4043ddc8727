//! Block table headers.
//!
//! Each block slot is a fixed header followed by `block_size` data bytes.
//! Chains are singly linked through the header's `next` field; block data
//! never stores chain structure.

use crate::layout::{BLOCK_HEADER_SIZE, TAG_BLOCK_RECORD};
use nestfs_codec as codec;
use nestfs_error::{EfsError, Result};
use nestfs_types::{block_flags, BlockId};

/// In-memory copy of one block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub flags: u16,
    /// Next block in the chain; none at the tail.
    pub next: BlockId,
}

impl Block {
    /// Blank header for slot `id`.
    #[must_use]
    pub fn unused(id: BlockId) -> Self {
        Self {
            id,
            flags: 0,
            next: BlockId::NONE,
        }
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.flags & block_flags::USED != 0
    }

    /// Encode into a header-sized buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_HEADER_SIZE as usize {
            return Err(EfsError::Arg("block header buffer has the wrong size"));
        }
        buf[0] = TAG_BLOCK_RECORD;
        let mut off = 1;
        off += codec::encode_u32(&mut buf[off..], self.id.0)?;
        off += codec::encode_u16(&mut buf[off..], self.flags)?;
        codec::encode_u32(&mut buf[off..], self.next.0)?;
        Ok(())
    }

    /// Decode a header read from slot `expect`.
    pub fn decode(buf: &[u8], expect: BlockId) -> Result<Self> {
        if buf.len() != BLOCK_HEADER_SIZE as usize {
            return Err(EfsError::Arg("block header buffer has the wrong size"));
        }
        if buf[0] != TAG_BLOCK_RECORD {
            return Err(EfsError::Consistency(format!(
                "block header tag mismatch: expected {TAG_BLOCK_RECORD:#04x}, got {:#04x}",
                buf[0]
            )));
        }
        let mut off = 1;
        let id = BlockId(codec::decode_u32(&buf[off..])?);
        off += codec::SIZEOF_U32;
        if id != expect && !id.is_none() {
            return Err(EfsError::Consistency(format!(
                "block header in slot {expect} claims id {id}"
            )));
        }
        let flags = codec::decode_u16(&buf[off..])?;
        off += codec::SIZEOF_U16;
        let next = BlockId(codec::decode_u32(&buf[off..])?);
        Ok(Self {
            id: expect,
            flags,
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_round_trips() {
        let block = Block {
            id: BlockId(5),
            flags: block_flags::USED,
            next: BlockId(9),
        };
        let mut buf = vec![0; BLOCK_HEADER_SIZE as usize];
        block.encode(&mut buf).expect("encode");
        assert_eq!(Block::decode(&buf, BlockId(5)).expect("decode"), block);
    }

    #[test]
    fn block_header_rejects_wrong_slot_and_tag() {
        let mut buf = vec![0; BLOCK_HEADER_SIZE as usize];
        let mut used = Block::unused(BlockId(5));
        used.flags = block_flags::USED;
        used.encode(&mut buf).expect("encode");

        assert!(matches!(
            Block::decode(&buf, BlockId(6)),
            Err(EfsError::Consistency(_))
        ));

        buf[0] = 0x00;
        assert!(matches!(
            Block::decode(&buf, BlockId(5)),
            Err(EfsError::Consistency(_))
        ));
    }
}
