//! # Process Model
//!
//! Unifies the two ways we can look at a target: attached live via ptrace,
//! or post-mortem through a core image. Either way the result is the same
//! shape: an address-space [`Reader`] whose offsets are virtual addresses,
//! a list of [`LoadedObject`]s binding relocation bases to ELF images, and
//! a set of threads with captured register files.
//!
//! Loaded-object discovery follows the runtime linker's debug rendezvous
//! (`PT_DYNAMIC` → `DT_DEBUG` → `r_debug` → link-map list); cores without
//! a usable rendezvous fall back to the kernel's `NT_FILE` mapping note.

mod core_target;
mod live;
mod rendezvous;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::demangle::make_symbol_name;
use crate::dwarf::DwarfContext;
use crate::elf::defs::{ET_CORE, ET_DYN, STT_FUNC};
use crate::elf::ElfObject;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::{Machine, RegisterFile, ResolvedSymbol, ThreadId};

pub use live::LiveTarget;

/// Knobs threaded through process construction.
#[derive(Debug, Clone)]
pub struct ProcessOptions
{
    /// Root under which `.gnu_debuglink` companions are searched.
    pub debug_prefix: PathBuf,
    /// Upper bound on frames emitted per thread.
    pub max_frames: usize,
}

impl Default for ProcessOptions
{
    fn default() -> Self
    {
        Self {
            debug_prefix: PathBuf::from(crate::elf::DEFAULT_DEBUG_PREFIX),
            max_frames: 4096,
        }
    }
}

/// An ELF image bound to the address it is loaded at.
pub struct LoadedObject
{
    /// Relocation base: the image's zero address as seen in the process.
    pub reloc: u64,
    /// Path or describe-string of the image.
    pub name: String,
    pub object: Arc<ElfObject>,
    dwarf: OnceCell<DwarfContext>,
}

impl LoadedObject
{
    fn new(reloc: u64, name: String, object: Arc<ElfObject>) -> Self
    {
        Self {
            reloc,
            name,
            object,
            dwarf: OnceCell::new(),
        }
    }

    /// Whether a process virtual address falls inside one of this image's
    /// loadable segments.
    pub fn contains(&self, va: u64) -> bool
    {
        va.checked_sub(self.reloc)
            .map(|local| self.object.find_header_for_address(local).is_some())
            .unwrap_or(false)
    }

    /// Translate a process virtual address to the image's unrelocated one.
    pub fn to_local(&self, va: u64) -> Option<u64>
    {
        va.checked_sub(self.reloc)
    }

    /// The image's DWARF state, built on first use.
    pub fn dwarf(&self) -> &DwarfContext
    {
        self.dwarf.get_or_init(|| DwarfContext::new(&self.object))
    }
}

impl std::fmt::Debug for LoadedObject
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "LoadedObject({} @ {:#x})", self.name, self.reloc)
    }
}

/// A thread of the target, frozen at capture time.
#[derive(Debug, Clone)]
pub struct Thread
{
    pub tid: ThreadId,
    pub regs: RegisterFile,
}

enum Target
{
    Core
    {
        core: Arc<ElfObject>
    },
    Live
    {
        target: LiveTarget
    },
}

/// A target process: executable, optional core, address space, loaded
/// objects, threads.
pub struct Process
{
    exec: Option<Arc<ElfObject>>,
    io: Arc<dyn Reader>,
    target: Target,
    objects: Vec<LoadedObject>,
    threads: Vec<Thread>,
    loaded: bool,
    options: ProcessOptions,
}

impl Process
{
    /// Open a core image, optionally with the executable that produced it.
    ///
    /// Failure to parse either file is fatal; everything downstream (a
    /// missing note, an unreadable loaded object) degrades instead.
    pub fn open_core(core_path: impl AsRef<Path>, exec_path: Option<&Path>) -> Result<Self>
    {
        Self::open_core_with(core_path, exec_path, ProcessOptions::default())
    }

    pub fn open_core_with(core_path: impl AsRef<Path>, exec_path: Option<&Path>, options: ProcessOptions) -> Result<Self>
    {
        let core_path = core_path.as_ref();
        let core = Arc::new(ElfObject::open_with_prefix(core_path, options.debug_prefix.clone())?);
        if core.header().e_type != ET_CORE {
            warn!("{} is not a core image (e_type {})", core.describe(), core.header().e_type);
        }
        let exec = match exec_path {
            Some(path) => Some(Arc::new(ElfObject::open_with_prefix(path, options.debug_prefix.clone())?)),
            None => None,
        };

        let io: Arc<dyn Reader> = Arc::new(core_target::CoreReader::new(core.clone()));
        let threads = core_target::threads(&core);
        info!("opened {} with {} threads", core.describe(), threads.len());
        Ok(Self {
            exec,
            io,
            target: Target::Core { core },
            objects: Vec::new(),
            threads,
            loaded: false,
            options,
        })
    }

    /// Attach to a live process, stopping all of its threads. Dropping the
    /// `Process` detaches and resumes them.
    pub fn attach(pid: u32) -> Result<Self>
    {
        Self::attach_with(pid, ProcessOptions::default())
    }

    pub fn attach_with(pid: u32, options: ProcessOptions) -> Result<Self>
    {
        let target = LiveTarget::attach(pid)?;
        let exec_path = target.exec_path();
        let exec = match &exec_path {
            Some(path) => match ElfObject::open_with_prefix(path, options.debug_prefix.clone()) {
                Ok(object) => Some(Arc::new(object)),
                Err(err) => {
                    warn!("cannot parse executable of pid {pid}: {err}");
                    None
                }
            },
            None => None,
        };
        let threads = target.threads()?;
        let io = target.reader();
        info!("attached to pid {pid} ({} threads)", threads.len());
        Ok(Self {
            exec,
            io,
            target: Target::Live { target },
            objects: Vec::new(),
            threads,
            loaded: false,
            options,
        })
    }

    pub fn options(&self) -> &ProcessOptions
    {
        &self.options
    }

    /// The process address space; offsets are virtual addresses.
    pub fn io(&self) -> &Arc<dyn Reader>
    {
        &self.io
    }

    pub fn exec(&self) -> Option<&Arc<ElfObject>>
    {
        self.exec.as_ref()
    }

    /// The core image, for providers built over one.
    pub fn core(&self) -> Option<&Arc<ElfObject>>
    {
        match &self.target {
            Target::Core { core } => Some(core),
            Target::Live { .. } => None,
        }
    }

    /// Machine of the target, from the executable or the core.
    pub fn machine(&self) -> Machine
    {
        if let Some(exec) = &self.exec {
            return exec.machine();
        }
        match &self.target {
            Target::Core { core } => core.machine(),
            Target::Live { .. } => Machine::from_elf(0),
        }
    }

    /// Threads in OS enumeration order.
    pub fn threads(&self) -> &[Thread]
    {
        &self.threads
    }

    pub fn objects(&self) -> &[LoadedObject]
    {
        &self.objects
    }

    /// The loaded object covering a process virtual address.
    pub fn object_for_address(&self, va: u64) -> Option<&LoadedObject>
    {
        self.objects.iter().find(|object| object.contains(va))
    }

    /// Discover loaded objects. Idempotent: the second and later calls are
    /// no-ops.
    pub fn load(&mut self) -> Result<()>
    {
        if self.loaded {
            return Ok(());
        }
        self.loaded = true;

        let exec_bias = self.exec_bias();
        if let (Some(exec), Some(path)) = (&self.exec, self.exec_name()) {
            self.objects.push(LoadedObject::new(exec_bias, path, exec.clone()));
        }

        // Runtime-linker rendezvous, the authoritative list.
        if let Some(exec) = self.exec.clone() {
            match rendezvous::discover(&exec, exec_bias, self.io.as_ref()) {
                Ok(entries) => {
                    for entry in entries {
                        self.add_object(entry.l_addr, &entry.name);
                    }
                }
                Err(err) => debug!("rendezvous walk failed: {err}"),
            }
        }

        // NT_FILE supplements whatever the rendezvous could not provide
        // (no executable given, partially overwritten link map).
        if let Target::Core { core } = &self.target {
            let mappings = core_target::file_mappings(core);
            for mapping in mappings {
                debug!("NT_FILE mapping {} {:#x}..{:#x}", mapping.path, mapping.start, mapping.end);
                if mapping.file_offset != 0 {
                    // Interior mapping of an already-seen image.
                    continue;
                }
                let Ok(object) = ElfObject::open_with_prefix(&mapping.path, self.options.debug_prefix.clone()) else {
                    continue;
                };
                let reloc = mapping.start.wrapping_sub(object.base());
                self.add_loaded(reloc, mapping.path.clone(), Arc::new(object));
            }
        }

        info!("discovered {} loaded objects", self.objects.len());
        Ok(())
    }

    fn exec_name(&self) -> Option<String>
    {
        self.exec.as_ref().map(|exec| exec.describe())
    }

    /// Relocation bias of the executable itself. Fixed executables load at
    /// their link-time addresses; a PIE's bias is recovered from the
    /// core's `NT_FILE` note or the live target's lowest mapping.
    fn exec_bias(&self) -> u64
    {
        let Some(exec) = &self.exec else {
            return 0;
        };
        if exec.header().e_type != ET_DYN {
            return 0;
        }
        match &self.target {
            Target::Core { core } => core_target::image_base(core, &exec.describe())
                .map(|start| start.wrapping_sub(exec.base()))
                .unwrap_or(0),
            Target::Live { target } => target
                .image_base(&exec.describe())
                .map(|start| start.wrapping_sub(exec.base()))
                .unwrap_or(0),
        }
    }

    fn add_object(&mut self, l_addr: u64, name: &str)
    {
        if name.is_empty() {
            // The executable's own link-map entry usually has an empty
            // name; it is already in the list.
            return;
        }
        match ElfObject::open_with_prefix(name, self.options.debug_prefix.clone()) {
            Ok(object) => self.add_loaded(l_addr, name.to_string(), Arc::new(object)),
            Err(err) => {
                // The backing file is gone; try the copy mapped into the
                // target itself.
                debug!("{name}: not readable from disk ({err}), trying memory");
                let reader = Arc::new(OffsetReader {
                    inner: self.io.clone(),
                    base: l_addr,
                    name: name.to_string(),
                });
                match ElfObject::from_reader(reader) {
                    Ok(object) => self.add_loaded(l_addr, name.to_string(), Arc::new(object)),
                    Err(err) => debug!("{name}: skipped ({err})"),
                }
            }
        }
    }

    fn add_loaded(&mut self, reloc: u64, name: String, object: Arc<ElfObject>)
    {
        if self.objects.iter().any(|existing| existing.reloc == reloc || existing.name == name) {
            return;
        }
        debug!("loaded object {name} at {reloc:#x}");
        self.objects.push(LoadedObject::new(reloc, name, object));
    }

    /// Resolve a process virtual address to `(object, symbol, offset,
    /// source line)`.
    ///
    /// Symbol tables are consulted first; when they are stripped the
    /// `.debug_info` subprogram walk supplies the name. Either path can
    /// come up empty, in which case the annotation simply names the
    /// containing object.
    pub fn symbolicate(&self, va: u64) -> Option<ResolvedSymbol>
    {
        let object = self.object_for_address(va)?;
        let local = object.to_local(va)?;

        let mut name = None;
        let mut offset = 0;
        if let Ok(Some(found)) = object.object.find_symbol_by_address(local, Some(STT_FUNC)) {
            offset = local - found.symbol.st_value;
            name = Some(found.name);
        } else if let Some(raw) = object.dwarf().find_function(local) {
            name = Some(raw);
        }
        let location = object.dwarf().find_location(local);

        Some(ResolvedSymbol {
            object: object.name.clone(),
            name: name.map(make_symbol_name),
            offset,
            location,
        })
    }
}

impl std::fmt::Debug for Process
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Process")
            .field("io", &self.io.describe())
            .field("objects", &self.objects.len())
            .field("threads", &self.threads.len())
            .finish()
    }
}

/// Reader view of an image mapped inside a target address space: offset 0
/// is the image's relocation base.
struct OffsetReader
{
    inner: Arc<dyn Reader>,
    base: u64,
    name: String,
}

impl Reader for OffsetReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let va = self.base.checked_add(offset).ok_or(Error::Unmapped(offset))?;
        self.inner.read_at(va, dst)
    }

    fn describe(&self) -> String
    {
        format!("{} (in memory at {:#x})", self.name, self.base)
    }
}
