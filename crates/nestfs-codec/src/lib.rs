#![forbid(unsafe_code)]
//! Self-describing tagged binary codec.
//!
//! Every on-disk scalar is encoded as one tag byte followed by the
//! magnitude in big-endian order. The tag value encodes the bit width
//! (`0x80 | width`), which makes encoded fields easy to spot in a hex
//! viewer and doubles as a decode-time sanity check: a tag mismatch is a
//! [`EfsError::Consistency`] error, never a silent misparse.
//!
//! Strings encode as tag + 32-bit length + raw bytes. No terminator is
//! stored; embedded NUL bytes are legal; a decoded length of 0 is a legal,
//! explicit empty string.
//!
//! Only scalar and string encodings are wire-stable. The hash functions at
//! the bottom of this crate are cache-internal and may change between
//! versions.

use nestfs_device::Device;
use nestfs_error::{EfsError, Result};

/// Tag byte for an encoded u8.
pub const TAG_U8: u8 = 0x80 | 8;
/// Tag byte for an encoded u16.
pub const TAG_U16: u8 = 0x80 | 16;
/// Tag byte for an encoded u32.
pub const TAG_U32: u8 = 0x80 | 32;
/// Tag byte for an encoded u64.
pub const TAG_U64: u8 = 0x80 | 64;
/// Tag byte for an encoded string.
pub const TAG_STRING: u8 = 0x80 | b'"';

/// Encoded size of a u8: tag + 1.
pub const SIZEOF_U8: usize = 2;
/// Encoded size of a u16: tag + 2.
pub const SIZEOF_U16: usize = 3;
/// Encoded size of a u32: tag + 4.
pub const SIZEOF_U32: usize = 5;
/// Encoded size of a u64: tag + 8.
pub const SIZEOF_U64: usize = 9;
/// Encoded size of a string header (tag + u32 length), excluding the bytes.
pub const SIZEOF_STRING_HEADER: usize = 1 + SIZEOF_U32;
/// Encoded size of an inode/block id (ids are 32-bit on disk).
pub const SIZEOF_ID: usize = SIZEOF_U32;

fn tag_mismatch(expected: u8, actual: u8) -> EfsError {
    EfsError::Consistency(format!(
        "tag byte mismatch: expected {expected:#04x}, got {actual:#04x}"
    ))
}

fn need(buf_len: usize, needed: usize) -> Result<()> {
    if buf_len < needed {
        return Err(EfsError::Arg("codec buffer too short"));
    }
    Ok(())
}

macro_rules! scalar_codec {
    ($encode:ident, $decode:ident, $ty:ty, $tag:expr, $size:expr) => {
        /// Encode into the front of `dest`, returning the encoded size.
        pub fn $encode(dest: &mut [u8], value: $ty) -> Result<usize> {
            need(dest.len(), $size)?;
            dest[0] = $tag;
            dest[1..$size].copy_from_slice(&value.to_be_bytes());
            Ok($size)
        }

        /// Decode from the front of `src`, re-validating the tag byte.
        pub fn $decode(src: &[u8]) -> Result<$ty> {
            need(src.len(), $size)?;
            if src[0] != $tag {
                return Err(tag_mismatch($tag, src[0]));
            }
            let mut raw = [0_u8; $size - 1];
            raw.copy_from_slice(&src[1..$size]);
            Ok(<$ty>::from_be_bytes(raw))
        }
    };
}

scalar_codec!(encode_u8, decode_u8, u8, TAG_U8, SIZEOF_U8);
scalar_codec!(encode_u16, decode_u16, u16, TAG_U16, SIZEOF_U16);
scalar_codec!(encode_u32, decode_u32, u32, TAG_U32, SIZEOF_U32);
scalar_codec!(encode_u64, decode_u64, u64, TAG_U64, SIZEOF_U64);

/// Encoded size of a string of `len` bytes.
#[must_use]
pub fn sizeof_string(len: usize) -> usize {
    SIZEOF_STRING_HEADER + len
}

/// Encode a byte string: tag + u32 length + raw bytes.
///
/// The slice's length is authoritative; empty is legal and encodes an
/// explicit zero length. Embedded NUL bytes are preserved verbatim.
pub fn encode_string(dest: &mut [u8], value: &[u8]) -> Result<usize> {
    let total = sizeof_string(value.len());
    need(dest.len(), total)?;
    let len = u32::try_from(value.len())
        .map_err(|_| EfsError::Range(format!("string length {} overflows u32", value.len())))?;
    dest[0] = TAG_STRING;
    encode_u32(&mut dest[1..], len)?;
    dest[SIZEOF_STRING_HEADER..total].copy_from_slice(value);
    Ok(total)
}

/// Decode a byte string, returning `(bytes, consumed)`.
pub fn decode_string(src: &[u8]) -> Result<(Vec<u8>, usize)> {
    need(src.len(), SIZEOF_STRING_HEADER)?;
    if src[0] != TAG_STRING {
        return Err(tag_mismatch(TAG_STRING, src[0]));
    }
    let len = decode_u32(&src[1..])? as usize;
    let total = SIZEOF_STRING_HEADER + len;
    need(src.len(), total)?;
    Ok((src[SIZEOF_STRING_HEADER..total].to_vec(), total))
}

/// Encode `values` back to back into `dest`. Returns the count actually
/// completed, which is less than `values.len()` if `dest` runs out —
/// callers treat a short count as an error.
#[must_use]
pub fn encode_u32_array(dest: &mut [u8], values: &[u32]) -> usize {
    let mut done = 0;
    let mut off = 0;
    for &value in values {
        if encode_u32(&mut dest[off..], value).is_err() {
            break;
        }
        off += SIZEOF_U32;
        done += 1;
    }
    done
}

/// Decode `out.len()` consecutive u32 values from `src`. Returns the count
/// actually completed; a short count signals a decode failure at that
/// element.
#[must_use]
pub fn decode_u32_array(src: &[u8], out: &mut [u32]) -> usize {
    let mut done = 0;
    let mut off = 0;
    for slot in out.iter_mut() {
        match src.get(off..).map(decode_u32) {
            Some(Ok(value)) => *slot = value,
            _ => break,
        }
        off += SIZEOF_U32;
        done += 1;
    }
    done
}

// ── Device-stream variants ──────────────────────────────────────────────────
//
// Same wire format, but reading/writing at the device cursor. Short device
// transfers surface as Io errors from the device layer.

macro_rules! scalar_stream_codec {
    ($write:ident, $read:ident, $encode:ident, $decode:ident, $ty:ty, $size:expr) => {
        /// Encode at the device cursor. Returns the encoded size.
        pub fn $write(dev: &mut dyn Device, value: $ty) -> Result<usize> {
            let mut buf = [0_u8; $size];
            $encode(&mut buf, value)?;
            dev.write_all(&buf)?;
            Ok($size)
        }

        /// Decode at the device cursor.
        pub fn $read(dev: &mut dyn Device) -> Result<$ty> {
            let mut buf = [0_u8; $size];
            dev.read_exact(&mut buf)?;
            $decode(&buf)
        }
    };
}

scalar_stream_codec!(write_u8_to, read_u8_from, encode_u8, decode_u8, u8, SIZEOF_U8);
scalar_stream_codec!(write_u16_to, read_u16_from, encode_u16, decode_u16, u16, SIZEOF_U16);
scalar_stream_codec!(write_u32_to, read_u32_from, encode_u32, decode_u32, u32, SIZEOF_U32);
scalar_stream_codec!(write_u64_to, read_u64_from, encode_u64, decode_u64, u64, SIZEOF_U64);

/// Encode `values` at the device cursor. Returns the count completed.
pub fn write_u32_array_to(dev: &mut dyn Device, values: &[u32]) -> Result<usize> {
    for (i, &value) in values.iter().enumerate() {
        if write_u32_to(dev, value).is_err() {
            return Ok(i);
        }
    }
    Ok(values.len())
}

/// Decode `out.len()` consecutive u32 values at the device cursor. Returns
/// the count completed.
pub fn read_u32_array_from(dev: &mut dyn Device, out: &mut [u32]) -> Result<usize> {
    for (i, slot) in out.iter_mut().enumerate() {
        match read_u32_from(dev) {
            Ok(value) => *slot = value,
            Err(_) => return Ok(i),
        }
    }
    Ok(out.len())
}

// ── Hashes ──────────────────────────────────────────────────────────────────

/// 64-bit one-at-a-time mixing hash over a byte span.
///
/// Cache-internal: the algorithm is unspecified and may change between
/// versions. It must never be written into a container in a way that
/// makes the format depend on it.
#[must_use]
pub fn bytes_hash(data: &[u8]) -> u64 {
    if data.is_empty() {
        return 0;
    }
    let mut h: u64 = 0;
    for &b in data {
        h = h.wrapping_add(u64::from(b));
        h = h.wrapping_add(h << 10);
        h ^= h >> 6;
    }
    h = h.wrapping_add(h << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

/// Multiplicative string hash (hash*33 + byte) used by the name cache.
///
/// Same stability caveat as [`bytes_hash`]: cache-only, never wire-stable.
#[must_use]
pub fn name_hash(name: &[u8]) -> u64 {
    let mut h: u64 = 5381;
    for &b in name {
        h = (h << 5).wrapping_add(h).wrapping_add(u64::from(b));
    }
    h
}
