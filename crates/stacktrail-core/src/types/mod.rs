//! Platform-agnostic types shared across the crate.
//!
//! These types abstract over the two address-space providers (live process,
//! core image) and over the target architectures we can decode registers
//! for, so the ELF/DWARF layers and the unwinder never need to know which
//! kind of target they are looking at.

mod address;
mod frame;
mod registers;

pub use address::Address;
pub use frame::{Frame, ResolvedSymbol, SourceLocation, SymbolName};
pub use registers::{Machine, RegisterFile};

/// OS-level thread identifier.
///
/// On Linux this is the TID from `/proc/<pid>/task` for a live target, or
/// `pr_pid` of the `NT_PRSTATUS` note for a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

impl From<u32> for ThreadId
{
    fn from(tid: u32) -> Self
    {
        ThreadId(tid)
    }
}

impl std::fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}", self.0)
    }
}
