//! # stacktrail-core
//!
//! Inspection primitives for live processes and core images on ELF-based
//! systems: a caching reader layer, an ELF object model, the DWARF state
//! needed for call-frame unwinding and symbolication, a process model over
//! ptrace and core providers, the unwinder itself, and the vtable scanner.
//!
//! ## Layering
//!
//! - **`reader`** feeds bytes to everything.
//! - **`elf`** parses images from readers.
//! - **`dwarf`** builds CFI and line/name state per image.
//! - **`proc`** glues images, address space, and threads into a
//!   [`Process`].
//! - **`unwind`** and **`scan`** consume a `Process`.
//!
//! Components never call upward.
//!
//! ```rust,no_run
//! use stacktrail_core::open_core;
//!
//! fn main() -> stacktrail_core::Result<()>
//! {
//!     let mut process = open_core("core.1234", None)?;
//!     process.load()?;
//!     for thread in process.threads().to_vec() {
//!         println!("thread {}", thread.tid);
//!         for frame in process.unwind(&thread) {
//!             println!("  {:?}", frame);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod demangle;
pub mod dwarf;
pub mod elf;
pub mod error;
pub mod proc;
pub mod reader;
pub mod scan;
pub mod types;
pub mod unwind;

use std::path::Path;
use std::sync::Arc;

// Re-export the surface collaborators build on.
pub use elf::ElfObject;
pub use error::{Error, Result};
pub use proc::{LoadedObject, Process, ProcessOptions, Thread};
pub use scan::{scan_vtables, ScanConfig, ScanReport};
pub use types::{Address, Frame, Machine, RegisterFile, ThreadId};

/// Open and parse an ELF image from a path.
pub fn open_elf(path: impl AsRef<Path>) -> Result<ElfObject>
{
    ElfObject::open(path)
}

/// Open and parse an ELF image from an arbitrary reader.
pub fn open_elf_from(reader: Arc<dyn reader::Reader>) -> Result<ElfObject>
{
    ElfObject::from_reader(reader)
}

/// Attach to a live process, freezing its threads until the returned
/// [`Process`] is dropped.
pub fn attach_live(pid: u32) -> Result<Process>
{
    Process::attach(pid)
}

/// Open a core image, optionally with the executable that produced it.
pub fn open_core(core: impl AsRef<Path>, exec: Option<&Path>) -> Result<Process>
{
    Process::open_core(core, exec)
}
