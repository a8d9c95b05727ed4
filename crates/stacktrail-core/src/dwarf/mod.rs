//! # DWARF Reader
//!
//! Per-image DWARF state: the call-frame-information tables driving the
//! unwinder, and the `.debug_info`/`.debug_line` side used to put names and
//! source lines on frames when symbol tables are stripped.
//!
//! Section bytes are pulled through the owning [`ElfObject`], which means a
//! `.gnu_debuglink` companion (and compressed debug sections) are handled
//! transparently. Heavyweight state — the CFI index, the `addr2line`
//! context — is built lazily and at most once.

mod frames;

use std::collections::HashMap;
use std::sync::Arc;

use addr2line::Context;
use gimli::{Dwarf, EndianArcSlice, RunTimeEndian, SectionId};
use once_cell::sync::OnceCell;
use tracing::debug;

pub use frames::{CfiRow, TableId};

use crate::elf::defs::SHT_PROGBITS;
use crate::elf::ElfObject;
use crate::error::Result;
use crate::reader::Reader;
use crate::types::{RegisterFile, SourceLocation};

pub(crate) type OwnedReader = EndianArcSlice<RunTimeEndian>;

/// The sections `addr2line` and the CFI side may ask for.
const DWARF_SECTIONS: &[SectionId] = &[
    SectionId::DebugAbbrev,
    SectionId::DebugAddr,
    SectionId::DebugInfo,
    SectionId::DebugLine,
    SectionId::DebugLineStr,
    SectionId::DebugRanges,
    SectionId::DebugRngLists,
    SectionId::DebugStr,
    SectionId::DebugStrOffsets,
    SectionId::DebugTypes,
    SectionId::DebugLoc,
    SectionId::DebugLocLists,
];

struct SectionBlob
{
    data: Arc<[u8]>,
    address: u64,
}

/// DWARF state for one ELF image. Addresses are unrelocated file virtual
/// addresses throughout; the process model derelocates PCs before asking.
pub struct DwarfContext
{
    endian: RunTimeEndian,
    sections: HashMap<&'static str, Arc<[u8]>>,
    eh_frame: Option<SectionBlob>,
    debug_frame: Option<SectionBlob>,
    text_address: u64,
    got_address: u64,
    cfi: OnceCell<Vec<frames::CfiTable>>,
    context: OnceCell<Option<Context<OwnedReader>>>,
}

impl DwarfContext
{
    /// Collect the debug sections of `object`. Cheap: section bytes are
    /// read, nothing is parsed yet. A section that cannot be read is
    /// dropped with a debug log; missing DWARF degrades output, it never
    /// fails the image.
    pub fn new(object: &ElfObject) -> Self
    {
        let endian = if object.encoding().little {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let mut sections = HashMap::new();
        for id in DWARF_SECTIONS {
            if let Some(section) = object.get_section(id.name(), None) {
                match section.data() {
                    Ok(data) => {
                        sections.insert(id.name(), data);
                    }
                    Err(err) => debug!("{}: skipping {}: {err}", object.describe(), id.name()),
                }
            }
        }

        let blob = |name: &str| -> Option<SectionBlob> {
            let section = object.get_section(name, Some(SHT_PROGBITS))?;
            let address = section.header().sh_addr;
            match section.data() {
                Ok(data) if !data.is_empty() => Some(SectionBlob { data, address }),
                Ok(_) => None,
                Err(err) => {
                    debug!("{}: skipping {name}: {err}", object.describe());
                    None
                }
            }
        };
        let eh_frame = blob(".eh_frame");
        let debug_frame = blob(".debug_frame");
        let text_address = object.get_section(".text", None).map(|s| s.header().sh_addr).unwrap_or(0);
        let got_address = object.get_section(".got", None).map(|s| s.header().sh_addr).unwrap_or(0);

        Self {
            endian,
            sections,
            eh_frame,
            debug_frame,
            text_address,
            got_address,
            cfi: OnceCell::new(),
            context: OnceCell::new(),
        }
    }

    fn section_reader(&self, id: SectionId) -> OwnedReader
    {
        let data = self
            .sections
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()));
        EndianArcSlice::new(data, self.endian)
    }

    /// The CFI tables, `.debug_frame` first. Built on first use; a table
    /// that fails to parse is dropped with a debug log rather than
    /// poisoning the other one.
    fn tables(&self) -> &[frames::CfiTable]
    {
        self.cfi.get_or_init(|| {
            let mut tables = Vec::new();
            if let Some(blob) = &self.debug_frame {
                match frames::CfiTable::parse_debug_frame(blob.data.clone(), blob.address, self.text_address, self.endian)
                {
                    Ok(table) => tables.push(table),
                    Err(err) => debug!(".debug_frame unusable: {err}"),
                }
            }
            if let Some(blob) = &self.eh_frame {
                match frames::CfiTable::parse_eh_frame(
                    blob.data.clone(),
                    blob.address,
                    self.text_address,
                    self.got_address,
                    self.endian,
                ) {
                    Ok(table) => tables.push(table),
                    Err(err) => debug!(".eh_frame unusable: {err}"),
                }
            }
            tables
        })
    }

    /// Whether any CFI table is present at all.
    pub fn has_cfi(&self) -> bool
    {
        !self.tables().is_empty()
    }

    /// Run the CFI program for `pc` and return the resulting row, or
    /// `None` when no FDE in any table covers it.
    pub fn row_for_pc(&self, pc: u64) -> Result<Option<CfiRow>>
    {
        for table in self.tables() {
            if let Some(row) = table.row_for_pc(pc)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Evaluate a CFI expression from `row`'s table against a register
    /// file, reading memory through `space` when the expression asks.
    pub fn eval_expression(
        &self,
        row: &CfiRow,
        expr: gimli::UnwindExpression<usize>,
        regs: &RegisterFile,
        space: &dyn Reader,
        cfa: Option<u64>,
    ) -> Result<u64>
    {
        let table = self
            .tables()
            .iter()
            .find(|t| t.id() == row.table)
            .expect("row came from these tables");
        table.eval_expression(expr, row.encoding, regs, space, cfa, self.endian)
    }

    fn addr2line(&self) -> Option<&Context<OwnedReader>>
    {
        self.context
            .get_or_init(|| {
                let dwarf = Dwarf::load(|id| Ok::<_, gimli::Error>(self.section_reader(id)));
                match dwarf.and_then(Context::from_dwarf) {
                    Ok(ctx) => Some(ctx),
                    Err(err) => {
                        debug!("no line/name context: {err}");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Innermost subprogram (or inlined subroutine) name covering `probe`,
    /// from the `.debug_info` walk. Used when symbol tables are stripped.
    pub fn find_function(&self, probe: u64) -> Option<String>
    {
        let ctx = self.addr2line()?;
        let mut frames = ctx.find_frames(probe).skip_all_loads().ok()?;
        while let Ok(Some(frame)) = frames.next() {
            if let Some(function) = frame.function.as_ref() {
                if let Ok(raw) = function.raw_name() {
                    return Some(raw.into_owned());
                }
            }
        }
        None
    }

    /// Source file/line for `probe` from the line program: the row with
    /// the greatest address not exceeding it.
    pub fn find_location(&self, probe: u64) -> Option<SourceLocation>
    {
        let ctx = self.addr2line()?;
        let location = ctx.find_location(probe).ok()??;
        location.file.map(|file| SourceLocation {
            file: file.to_string(),
            line: location.line,
            column: location.column,
        })
    }
}

impl std::fmt::Debug for DwarfContext
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("DwarfContext")
            .field("sections", &self.sections.len())
            .field("eh_frame", &self.eh_frame.is_some())
            .field("debug_frame", &self.debug_frame.is_some())
            .finish()
    }
}
