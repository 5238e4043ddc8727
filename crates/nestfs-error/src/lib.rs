#![forbid(unsafe_code)]
//! Error types for nestfs.
//!
//! Every fallible operation in the engine, codec, device, and cache layers
//! returns [`EfsError`]; there is no panic-based error propagation in
//! non-test code. "OK" is simply `Ok(())`.
//!
//! Policy notes:
//!
//! - `Consistency` covers both on-disk corruption (bad tag bytes, size-field
//!   mismatches) and internal structural self-checks during container
//!   creation. A self-check failure indicates an implementation bug, but it
//!   is surfaced as an error rather than an abort so callers can recover.
//! - `Unsupported` is a soft degradation, not a failure: platform-specific
//!   features (advisory file locking on memory-backed devices) report it and
//!   leave the operation's other effects intact.
//! - `BadMagic` is distinct from `Consistency` so callers can tell "this is
//!   not a container at all" from "this container is damaged".

use thiserror::Error;

/// Unified error type for all nestfs operations.
#[derive(Debug, Error)]
pub enum EfsError {
    /// An argument was structurally invalid (empty name, zero-length buffer).
    #[error("invalid argument: {0}")]
    Arg(&'static str),

    /// A value was outside the range valid for the current container
    /// geometry (id out of bounds, name too long, bad options).
    #[error("out of range: {0}")]
    Range(String),

    /// A table or cache has no capacity left (no free inode or block slot,
    /// name cache at its configured ceiling).
    #[error("allocation failed: {0}")]
    Alloc(String),

    /// Operating system I/O error, or a short read/write against a device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state disagrees with what the format guarantees, or an
    /// internal structural self-check failed.
    #[error("consistency check failed: {0}")]
    Consistency(String),

    /// The operation requires write access but the container was opened
    /// read-only.
    #[error("access denied: {0}")]
    Access(&'static str),

    /// An internal invariant was violated (name-hash collision between two
    /// distinct inodes).
    #[error("internal error: {0}")]
    Internal(String),

    /// The device does not start with the container magic sequence.
    #[error("bad magic: {0}")]
    BadMagic(String),

    /// The feature is not available on this device or platform.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl EfsError {
    /// Shorthand for a short-transfer I/O error with a uniform message.
    #[must_use]
    pub fn short_io(what: &str, expected: usize, actual: usize) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("short {what}: expected {expected} bytes, got {actual}"),
        ))
    }
}

/// Result alias using `EfsError`.
pub type Result<T> = std::result::Result<T, EfsError>;
