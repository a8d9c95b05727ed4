//! Call-frame-information tables.
//!
//! Each table (`.debug_frame`, `.eh_frame`) is swept once at build time to
//! collect the `[initial_location, initial_location + address_range)`
//! interval of every FDE into a sorted index; CIEs are parsed once during
//! that sweep and shared by the FDEs that name them. A PC lookup binary
//! searches the index, then runs the CIE initial instructions followed by
//! the FDE instructions up to the row covering the PC.

use gimli::{
    BaseAddresses, CieOrFde, DebugFrame, EhFrame, Encoding, EvaluationResult, FrameDescriptionEntry, Location, Register,
    RunTimeEndian, UnwindContext, UnwindExpression, UnwindSection, UnwindTableRow, Value,
};
use tracing::debug;

use super::OwnedReader;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::RegisterFile;

/// Which table a row came from; expression payloads must be resolved
/// against the same section that produced the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableId
{
    DebugFrame,
    EhFrame,
}

/// One resolved CFI row, plus what the unwinder needs to apply it.
#[derive(Debug, Clone)]
pub struct CfiRow
{
    pub table: TableId,
    pub encoding: Encoding,
    /// The CIE's return-address register.
    pub ra: Register,
    pub row: UnwindTableRow<usize>,
}

enum TableKind
{
    Debug(DebugFrame<OwnedReader>),
    Eh(EhFrame<OwnedReader>),
}

struct FdeRange
{
    start: u64,
    end: u64,
    fde: FrameDescriptionEntry<OwnedReader>,
}

pub(super) struct CfiTable
{
    kind: TableKind,
    bases: BaseAddresses,
    index: Vec<FdeRange>,
}

impl CfiTable
{
    pub(super) fn parse_debug_frame(
        data: std::sync::Arc<[u8]>,
        address: u64,
        text: u64,
        endian: RunTimeEndian,
    ) -> Result<Self>
    {
        let mut section = DebugFrame::from(OwnedReader::new(data, endian));
        section.set_address_size(8);
        let bases = BaseAddresses::default().set_eh_frame(address).set_text(text);
        let index = build_index(&section, &bases)?;
        Ok(Self {
            kind: TableKind::Debug(section),
            bases,
            index,
        })
    }

    pub(super) fn parse_eh_frame(
        data: std::sync::Arc<[u8]>,
        address: u64,
        text: u64,
        got: u64,
        endian: RunTimeEndian,
    ) -> Result<Self>
    {
        let mut section = EhFrame::from(OwnedReader::new(data, endian));
        section.set_address_size(8);
        let bases = BaseAddresses::default().set_eh_frame(address).set_text(text).set_got(got);
        let index = build_index(&section, &bases)?;
        Ok(Self {
            kind: TableKind::Eh(section),
            bases,
            index,
        })
    }

    pub(super) fn id(&self) -> TableId
    {
        match self.kind {
            TableKind::Debug(_) => TableId::DebugFrame,
            TableKind::Eh(_) => TableId::EhFrame,
        }
    }

    /// Run the CFI program for `pc`. `Ok(None)` when no FDE covers it.
    pub(super) fn row_for_pc(&self, pc: u64) -> Result<Option<CfiRow>>
    {
        let i = self.index.partition_point(|range| range.start <= pc);
        if i == 0 {
            return Ok(None);
        }
        let entry = &self.index[i - 1];
        if pc >= entry.end {
            return Ok(None);
        }

        let mut ctx: UnwindContext<usize> = UnwindContext::new();
        let row = match &self.kind {
            TableKind::Debug(section) => entry.fde.unwind_info_for_address(section, &self.bases, &mut ctx, pc)?.clone(),
            TableKind::Eh(section) => entry.fde.unwind_info_for_address(section, &self.bases, &mut ctx, pc)?.clone(),
        };
        Ok(Some(CfiRow {
            table: self.id(),
            encoding: entry.fde.cie().encoding(),
            ra: entry.fde.cie().return_address_register(),
            row,
        }))
    }

    /// Evaluate a CFI expression. Supports the subset CFI emits: register
    /// reads, memory loads through the target address space, and
    /// CFA-relative arithmetic.
    pub(super) fn eval_expression(
        &self,
        expr: UnwindExpression<usize>,
        encoding: Encoding,
        regs: &RegisterFile,
        space: &dyn Reader,
        cfa: Option<u64>,
        endian: RunTimeEndian,
    ) -> Result<u64>
    {
        let expression = match &self.kind {
            TableKind::Debug(section) => expr.get(section)?,
            TableKind::Eh(section) => expr.get(section)?,
        };

        let mut eval = expression.evaluation(encoding);
        let mut state = eval.evaluate()?;
        loop {
            match state {
                EvaluationResult::Complete => break,
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = regs
                        .get(register)
                        .ok_or_else(|| Error::BadDwarf(format!("expression reads unknown register {}", register.0)))?;
                    state = eval.resume_with_register(Value::Generic(value))?;
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let value = read_word(space, address, size, endian)?;
                    state = eval.resume_with_memory(Value::Generic(value))?;
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    let cfa = cfa.ok_or_else(|| Error::BadDwarf("expression reads CFA before it is known".into()))?;
                    state = eval.resume_with_call_frame_cfa(cfa)?;
                }
                EvaluationResult::RequiresRelocatedAddress(address) => {
                    state = eval.resume_with_relocated_address(address)?;
                }
                other => {
                    return Err(Error::BadDwarf(format!("unsupported expression step: {other:?}")));
                }
            }
        }

        let pieces = eval.result();
        let piece = pieces.last().ok_or_else(|| Error::BadDwarf("empty expression result".into()))?;
        match &piece.location {
            Location::Address { address } => Ok(*address),
            Location::Value { value } => Ok(value.to_u64(u64::MAX)?),
            other => Err(Error::BadDwarf(format!("unsupported expression location: {other:?}"))),
        }
    }
}

fn read_word(space: &dyn Reader, address: u64, size: u8, endian: RunTimeEndian) -> Result<u64>
{
    let size = (size as usize).clamp(1, 8);
    let mut buf = [0u8; 8];
    space.read_exact_at(address, &mut buf[..size])?;
    let mut value = 0u64;
    match endian {
        RunTimeEndian::Little => {
            for (i, &b) in buf[..size].iter().enumerate() {
                value |= (b as u64) << (8 * i);
            }
        }
        RunTimeEndian::Big => {
            for &b in &buf[..size] {
                value = (value << 8) | b as u64;
            }
        }
    }
    Ok(value)
}

/// Sweep a table once, collecting every FDE keyed by its PC interval.
/// Overlapping ranges violate the shape of a sane table; the later entry
/// is dropped so lookups stay deterministic.
fn build_index<S>(section: &S, bases: &BaseAddresses) -> Result<Vec<FdeRange>>
where
    S: UnwindSection<OwnedReader>,
{
    let mut ranges = Vec::new();
    let mut entries = section.entries(bases);
    while let Some(entry) = entries.next()? {
        let CieOrFde::Fde(partial) = entry else {
            continue;
        };
        let fde = match partial.parse(S::cie_from_offset) {
            Ok(fde) => fde,
            Err(err) => {
                debug!("skipping malformed FDE: {err}");
                continue;
            }
        };
        let start = fde.initial_address();
        let end = start.wrapping_add(fde.len());
        ranges.push(FdeRange { start, end, fde });
    }

    ranges.sort_by_key(|range| range.start);
    let mut index: Vec<FdeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        if let Some(last) = index.last() {
            if range.start < last.end {
                debug!("dropping FDE overlapping {:#x}..{:#x}", last.start, last.end);
                continue;
            }
        }
        index.push(range);
    }
    Ok(index)
}
