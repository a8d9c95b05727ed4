//! # ELF Object Model
//!
//! Parses an ELF image into headers, segments, sections, and symbol tables,
//! all through the [`Reader`] abstraction so the same model serves files on
//! disk and images that only exist inside a target address space.
//!
//! ## Module Structure
//!
//! - **`defs`**: raw record decoders and constants
//! - **`symbols`**: symbol iteration, the SysV hash accelerator, and the
//!   by-name/by-address lookups
//!
//! A stripped image may ship its section/symbol data in a separate file
//! named by `.gnu_debuglink`; that companion is searched for under a debug
//! prefix (default `/usr/lib/debug`), opened at most once, and consulted
//! before the local section map.

pub mod defs;
mod symbols;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::{CacheReader, FileReader, MemReader, Reader};
use crate::types::Machine;
use defs::{
    Decoder, Encoding, FileHeader, Note, ProgramHeader, SectionHeader, PT_INTERP, PT_LOAD, PT_NOTE, SHF_COMPRESSED,
    SHN_UNDEF, SHT_HASH, SHT_NOBITS, SHT_PROGBITS,
};
pub use symbols::{elf_hash, SymbolIter, SymbolMatch};

/// Default root under which debug companions are searched.
pub const DEFAULT_DEBUG_PREFIX: &str = "/usr/lib/debug";

/// Companion lookup recurses at most this deep.
const MAX_COMPANION_DEPTH: u8 = 1;

/// A short-lived view of one section: the owning object plus an index.
#[derive(Clone, Copy)]
pub struct SectionRef<'obj>
{
    pub object: &'obj ElfObject,
    pub index: usize,
}

impl<'obj> SectionRef<'obj>
{
    pub fn header(&self) -> &'obj SectionHeader
    {
        &self.object.sections[self.index]
    }

    pub fn data(&self) -> Result<Arc<[u8]>>
    {
        self.object.section_data(self.index)
    }
}

/// A parsed ELF image.
pub struct ElfObject
{
    io: Arc<dyn Reader>,
    header: FileHeader,
    segments: Vec<ProgramHeader>,
    sections: Vec<SectionHeader>,
    names: HashMap<String, usize>,
    hash: Option<symbols::SymHash>,
    debug: OnceCell<Option<Arc<ElfObject>>>,
    debug_prefix: PathBuf,
    origin: Option<PathBuf>,
    companion_depth: u8,
}

impl ElfObject
{
    /// Open and parse an image from disk, behind a page cache.
    pub fn open(path: impl AsRef<Path>) -> Result<Self>
    {
        Self::open_with_prefix(path, DEFAULT_DEBUG_PREFIX)
    }

    /// Open with a non-default debug-companion prefix.
    pub fn open_with_prefix(path: impl AsRef<Path>, prefix: impl Into<PathBuf>) -> Result<Self>
    {
        let path = path.as_ref();
        let io: Arc<dyn Reader> = Arc::new(CacheReader::new(Arc::new(FileReader::open(path)?)));
        Self::parse(io, Some(path.to_path_buf()), prefix.into(), 0)
    }

    /// Parse an image from an arbitrary reader (a memory snapshot, a test
    /// fixture). No companion search is possible without an origin path.
    pub fn from_reader(io: Arc<dyn Reader>) -> Result<Self>
    {
        Self::parse(io, None, PathBuf::from(DEFAULT_DEBUG_PREFIX), 0)
    }

    fn parse(io: Arc<dyn Reader>, origin: Option<PathBuf>, debug_prefix: PathBuf, companion_depth: u8) -> Result<Self>
    {
        let describe = io.describe();
        let mut ident = [0u8; 64];
        let got = io.read_at(0, &mut ident)?;
        let header = FileHeader::parse(&ident[..got], &describe)?;
        let enc = header.encoding;

        let mut segments = Vec::with_capacity(header.e_phnum as usize);
        let mut off = header.e_phoff;
        let mut buf = vec![0u8; ProgramHeader::entry_size(enc)];
        for _ in 0..header.e_phnum {
            io.read_exact_at(off, &mut buf)?;
            segments.push(ProgramHeader::parse(&buf, enc)?);
            off += header.e_phentsize as u64;
        }

        let mut sections = Vec::with_capacity(header.e_shnum as usize);
        let mut off = header.e_shoff;
        let mut buf = vec![0u8; SectionHeader::entry_size(enc)];
        for _ in 0..header.e_shnum {
            io.read_exact_at(off, &mut buf)?;
            sections.push(SectionHeader::parse(&buf, enc)?);
            off += header.e_shentsize as u64;
        }

        let mut names = HashMap::new();
        if header.e_shstrndx != SHN_UNDEF && (header.e_shstrndx as usize) < sections.len() {
            let strs = sections[header.e_shstrndx as usize];
            for (index, section) in sections.iter().enumerate() {
                let name = io.read_string_at(strs.sh_offset + section.sh_name as u64)?;
                names.insert(name, index);
            }
        }

        let mut object = Self {
            io,
            header,
            segments,
            sections,
            names,
            hash: None,
            debug: OnceCell::new(),
            debug_prefix,
            origin,
            companion_depth,
        };

        if let Some(index) = object.local_section(".hash", Some(SHT_HASH)) {
            match symbols::SymHash::parse(&object, index) {
                Ok(hash) => object.hash = Some(hash),
                Err(err) => debug!("{}: unusable .hash section: {err}", object.describe()),
            }
        }
        Ok(object)
    }

    pub fn io(&self) -> &Arc<dyn Reader>
    {
        &self.io
    }

    pub fn describe(&self) -> String
    {
        self.io.describe()
    }

    pub fn header(&self) -> &FileHeader
    {
        &self.header
    }

    pub fn encoding(&self) -> Encoding
    {
        self.header.encoding
    }

    pub fn machine(&self) -> Machine
    {
        Machine::from_elf(self.header.e_machine)
    }

    pub fn segments(&self) -> &[ProgramHeader]
    {
        &self.segments
    }

    pub fn sections(&self) -> &[SectionHeader]
    {
        &self.sections
    }

    /// First `PT_LOAD` segment whose memory range covers `va`.
    pub fn find_header_for_address(&self, va: u64) -> Option<&ProgramHeader>
    {
        self.segments.iter().find(|hdr| hdr.p_type == PT_LOAD && hdr.contains(va))
    }

    /// Lowest `p_vaddr` over the `PT_LOAD` segments.
    pub fn base(&self) -> u64
    {
        self.segments
            .iter()
            .filter(|hdr| hdr.p_type == PT_LOAD)
            .map(|hdr| hdr.p_vaddr)
            .min()
            .unwrap_or(0)
    }

    /// The `PT_INTERP` string, or empty when the image has none.
    pub fn interpreter(&self) -> Result<String>
    {
        for seg in &self.segments {
            if seg.p_type == PT_INTERP {
                return self.io.read_string_at(seg.p_offset);
            }
        }
        Ok(String::new())
    }

    /// The `PT_DYNAMIC` segment, if any.
    pub fn dynamic_segment(&self) -> Option<&ProgramHeader>
    {
        self.segments.iter().find(|hdr| hdr.p_type == defs::PT_DYNAMIC)
    }

    /// Section lookup against the local name map only.
    fn local_section(&self, name: &str, sh_type: Option<u32>) -> Option<usize>
    {
        let index = *self.names.get(name)?;
        let section = &self.sections[index];
        match sh_type {
            Some(ty) if section.sh_type != ty => None,
            _ => Some(index),
        }
    }

    /// Look up a section by name, preferring the debug companion.
    ///
    /// `sh_type` of `None` is the wildcard. The companion is consulted
    /// first so that split debug files shadow the (usually empty) sections
    /// of the stripped image.
    pub fn get_section(&self, name: &str, sh_type: Option<u32>) -> Option<SectionRef<'_>>
    {
        if let Some(companion) = self.debug_companion() {
            if let Some(found) = companion.get_section(name, sh_type) {
                return Some(SectionRef {
                    object: found.object,
                    index: found.index,
                });
            }
        }
        self.local_section(name, sh_type).map(|index| SectionRef { object: self, index })
    }

    /// Bytes of a section, decompressed when `SHF_COMPRESSED` is set.
    pub fn section_data(&self, index: usize) -> Result<Arc<[u8]>>
    {
        let section = &self.sections[index];
        if section.sh_type == SHT_NOBITS {
            return Ok(Arc::from(Vec::new()));
        }
        let mut raw = vec![0u8; section.sh_size as usize];
        self.io
            .read_at(section.sh_offset, &mut raw)
            .ok()
            .filter(|&got| got == raw.len())
            .ok_or_else(|| Error::TruncatedSection(format!("{} section {index}", self.describe())))?;

        if section.sh_flags & SHF_COMPRESSED == 0 {
            return Ok(Arc::from(raw));
        }
        self.decompress_section(index, raw)
    }

    fn decompress_section(&self, index: usize, raw: Vec<u8>) -> Result<Arc<[u8]>>
    {
        let enc = self.header.encoding;
        let mut d = Decoder::new(&raw, enc);
        let ch_type = d.u32()?;
        if enc.class64 {
            d.skip(4);
        }
        let ch_size = d.word()?;
        let _ch_addralign = d.word()?;
        let hdr_len = if enc.class64 { 24 } else { 12 };
        let body: Vec<u8> = raw[hdr_len..].to_vec();
        let name = format!("{} section {index}", self.describe());

        match ch_type {
            #[cfg(feature = "zlib")]
            defs::ELFCOMPRESS_ZLIB => {
                let reader = crate::reader::InflateReader::new(name, body, ch_size);
                let mut out = vec![0u8; ch_size as usize];
                reader.read_exact_at(0, &mut out)?;
                Ok(Arc::from(out))
            }
            #[cfg(feature = "xz")]
            defs::ELFCOMPRESS_XZ => {
                let reader = crate::reader::XzReader::new(name, body, ch_size);
                let mut out = vec![0u8; ch_size as usize];
                reader.read_exact_at(0, &mut out)?;
                Ok(Arc::from(out))
            }
            other => Err(Error::TruncatedSection(format!("{name}: unsupported compression {other}"))),
        }
    }

    /// All notes from the image's `PT_NOTE` segments, in segment order.
    pub fn notes(&self) -> Result<Vec<Note>>
    {
        let mut notes = Vec::new();
        for seg in &self.segments {
            if seg.p_type != PT_NOTE {
                continue;
            }
            let mut buf = vec![0u8; seg.p_filesz as usize];
            self.io.read_exact_at(seg.p_offset, &mut buf)?;
            notes.extend(defs::parse_notes(&buf, self.header.encoding));
        }
        Ok(notes)
    }

    /// The `.gnu_debuglink` companion, loaded on first use and at most once.
    ///
    /// A companion that cannot be found or parsed is silently absent; the
    /// image then serves its own (possibly stripped) tables.
    pub fn debug_companion(&self) -> Option<&Arc<ElfObject>>
    {
        self.debug
            .get_or_init(|| {
                if self.companion_depth >= MAX_COMPANION_DEPTH {
                    return None;
                }
                self.load_companion()
            })
            .as_ref()
    }

    fn load_companion(&self) -> Option<Arc<ElfObject>>
    {
        let index = self.local_section(".gnu_debuglink", Some(SHT_PROGBITS))?;
        let section = &self.sections[index];
        let link = self.io.read_string_at(section.sh_offset).ok()?;
        if link.is_empty() {
            return None;
        }

        let dir = self.origin.as_ref().and_then(|p| p.parent()).unwrap_or_else(|| Path::new("."));
        let mut candidates = Vec::new();
        let relative = dir.strip_prefix("/").unwrap_or(dir);
        candidates.push(self.debug_prefix.join(relative).join(&link));
        candidates.push(dir.join(&link));

        for candidate in candidates {
            let Ok(file) = FileReader::open(&candidate) else {
                continue;
            };
            let io: Arc<dyn Reader> = Arc::new(CacheReader::new(Arc::new(file)));
            match Self::parse(io, Some(candidate.clone()), self.debug_prefix.clone(), self.companion_depth + 1) {
                Ok(companion) => {
                    debug!("{}: using debug companion {}", self.describe(), candidate.display());
                    return Some(Arc::new(companion));
                }
                Err(err) => {
                    debug!("{}: companion {} rejected: {err}", self.describe(), candidate.display());
                }
            }
        }
        None
    }

    /// Convenience constructor over raw bytes, used by tests and by images
    /// recovered from a target's memory.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Result<Self>
    {
        Self::from_reader(Arc::new(MemReader::new(name, bytes)))
    }
}

impl std::fmt::Debug for ElfObject
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ElfObject")
            .field("io", &self.describe())
            .field("segments", &self.segments.len())
            .field("sections", &self.sections.len())
            .finish()
    }
}
