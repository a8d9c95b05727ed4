//! # Error Types
//!
//! General error handling for the inspection library.
//!
//! We use `thiserror` to generate `Error` trait implementations and
//! human-readable messages. Parse failures of the *primary* images (the
//! executable or the core) are fatal and surface through these variants;
//! most other failures degrade output instead (a missing debug companion,
//! a section we cannot decompress, a frame we cannot unwind past).

use thiserror::Error;

/// Main error type for all inspection operations.
#[derive(Error, Debug)]
pub enum Error
{
    /// A backing read failed at the OS level.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image does not carry the ELF magic, or its version field is
    /// not the current one.
    #[error("{0}: content is not an ELF image")]
    NotElf(String),

    /// A strict record read got fewer bytes than the record requires.
    #[error("short read at offset {offset:#x}: wanted {wanted}, got {got}")]
    ShortRead
    {
        /// Absolute offset of the attempted read.
        offset: u64,
        /// Bytes the record requires.
        wanted: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// A string read ran off the end of the reader before the NUL.
    #[error("unterminated string at offset {0:#x}")]
    UnterminatedString(u64),

    /// A section header describes data that the image cannot supply.
    #[error("truncated section: {0}")]
    TruncatedSection(String),

    /// The DWARF data is malformed or uses a construct we do not support.
    #[error("bad DWARF: {0}")]
    BadDwarf(String),

    /// A virtual address is not backed by any segment of the address space.
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),

    /// No frame-description entry covers the program counter; unwinding
    /// cannot proceed past this frame.
    #[error("no FDE covers address {0:#x}")]
    NoFde(u64),

    /// The target process already has a tracer attached.
    #[error("process {0} is busy (already traced)")]
    Busy(u32),

    /// The operation ran against a process whose provider was dropped.
    #[error("process detached")]
    Detached,

    /// The running platform cannot supply this operation (for example,
    /// live register capture on an architecture without a reader).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<gimli::Error> for Error
{
    fn from(err: gimli::Error) -> Self
    {
        Error::BadDwarf(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
