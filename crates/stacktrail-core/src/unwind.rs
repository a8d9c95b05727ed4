//! # Stack Unwinding
//!
//! DWARF CFI driven unwinding over an abstract address space.
//!
//! Per frame: find the loaded object covering the PC, derelocate the PC
//! into the object, look up the CFI row, compute the CFA, and apply the
//! row's register rules to produce the caller's register file. The return
//! address register of the caller's file becomes the caller's PC.
//!
//! Frames come out as a lazy sequence, innermost first. The sequence ends
//! when the caller's PC is the zero sentinel, when no FDE covers it, or
//! when the CFA stops making progress (a cycle guard for corrupt stacks),
//! and is capped at the configured frame bound either way.

use std::collections::VecDeque;

use gimli::{CfaRule, RegisterRule};
use tracing::debug;

use crate::dwarf::CfiRow;
use crate::elf::defs::Encoding;
use crate::error::{Error, Result};
use crate::proc::{Process, Thread};
use crate::reader::Reader;
use crate::types::{Address, Frame, RegisterFile};

/// CFAs remembered by the cycle guard.
const CFA_HISTORY: usize = 4;

impl Process
{
    /// Unwind a thread's stack. Frames are produced lazily; callers may
    /// stop iterating at any point.
    pub fn unwind<'p>(&'p self, thread: &Thread) -> FrameIter<'p>
    {
        FrameIter {
            process: self,
            regs: Some(thread.regs.clone()),
            first: true,
            emitted: 0,
            max_frames: self.options().max_frames,
            recent_cfas: VecDeque::with_capacity(CFA_HISTORY),
        }
    }
}

/// Lazy frame sequence for one thread. See [`Process::unwind`].
pub struct FrameIter<'p>
{
    process: &'p Process,
    regs: Option<RegisterFile>,
    first: bool,
    emitted: usize,
    max_frames: usize,
    recent_cfas: VecDeque<u64>,
}

impl Iterator for FrameIter<'_>
{
    type Item = Frame;

    fn next(&mut self) -> Option<Frame>
    {
        let regs = self.regs.take()?;
        if self.emitted >= self.max_frames || regs.pc() == 0 {
            return None;
        }

        let pc = regs.pc();
        let frame = Frame {
            pc: Address::from(pc),
            sp: Address::from(regs.sp().unwrap_or(0)),
            fp: regs.fp().map(Address::from),
            symbol: self.process.symbolicate(pc),
        };
        self.emitted += 1;

        match self.step(&regs) {
            Ok(Some(next)) => self.regs = Some(next),
            Ok(None) => {}
            Err(err) => debug!("unwind stops at {pc:#x}: {err}"),
        }
        self.first = false;
        Some(frame)
    }
}

impl FrameIter<'_>
{
    /// One unwind step: current register file in, caller's out.
    /// `Ok(None)` ends the sequence cleanly.
    fn step(&mut self, regs: &RegisterFile) -> Result<Option<RegisterFile>>
    {
        let pc = regs.pc();
        // A return address points one past its call site; looking up the
        // preceding byte keeps us inside the calling function's FDE when
        // the call was the last instruction.
        let lookup_pc = if self.first { pc } else { pc.saturating_sub(1) };

        let Some(object) = self.process.object_for_address(lookup_pc) else {
            return Ok(None);
        };
        let local = object.to_local(lookup_pc).ok_or(Error::Unmapped(lookup_pc))?;
        let Some(row) = object.dwarf().row_for_pc(local)? else {
            return Err(Error::NoFde(pc));
        };

        let space = self.process.io().as_ref();
        let dwarf = object.dwarf();
        let enc = object.object.encoding();

        let cfa = match row.row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = regs
                    .get(*register)
                    .ok_or_else(|| Error::BadDwarf(format!("CFA needs unknown register {}", register.0)))?;
                (base as i64).wrapping_add(*offset) as u64
            }
            CfaRule::Expression(expr) => dwarf.eval_expression(&row, expr.clone(), regs, space, None)?,
        };

        if self.recent_cfas.contains(&cfa) {
            debug!("repeated CFA {cfa:#x}, stopping");
            return Ok(None);
        }
        if self.recent_cfas.len() == CFA_HISTORY {
            self.recent_cfas.pop_front();
        }
        self.recent_cfas.push_back(cfa);

        // Registers without an explicit rule keep their values; the stack
        // pointer of the caller is the CFA by definition.
        let mut next = regs.clone();
        for (register, rule) in row.row.registers() {
            match apply_rule(&row, *register, rule, regs, cfa, space, enc, dwarf)? {
                Some(value) => next.set(*register, value),
                None => next.clear(*register),
            }
        }
        if let Some(sp) = regs.machine().sp_register() {
            next.set(sp, cfa);
        }

        let ret = next.get(row.ra).unwrap_or(0);
        if ret == 0 {
            return Ok(None);
        }
        next.set_pc(ret);
        Ok(Some(next))
    }
}

/// Evaluate one register rule against the callee's register file.
/// `Ok(None)` means the register is undefined in the caller.
#[allow(clippy::too_many_arguments)]
fn apply_rule(
    row: &CfiRow,
    register: gimli::Register,
    rule: &RegisterRule<usize>,
    regs: &RegisterFile,
    cfa: u64,
    space: &dyn Reader,
    enc: Encoding,
    dwarf: &crate::dwarf::DwarfContext,
) -> Result<Option<u64>>
{
    match rule {
        RegisterRule::Undefined => Ok(None),
        RegisterRule::SameValue => Ok(regs.get(register)),
        RegisterRule::Offset(offset) => {
            let addr = (cfa as i64).wrapping_add(*offset) as u64;
            read_pointer(space, addr, enc).map(Some)
        }
        RegisterRule::ValOffset(offset) => Ok(Some((cfa as i64).wrapping_add(*offset) as u64)),
        RegisterRule::Register(source) => Ok(regs.get(*source)),
        RegisterRule::Expression(expr) => {
            let addr = dwarf.eval_expression(row, expr.clone(), regs, space, Some(cfa))?;
            read_pointer(space, addr, enc).map(Some)
        }
        RegisterRule::ValExpression(expr) => dwarf.eval_expression(row, expr.clone(), regs, space, Some(cfa)).map(Some),
        _ => Ok(None),
    }
}

fn read_pointer(space: &dyn Reader, addr: u64, enc: Encoding) -> Result<u64>
{
    let size = enc.word_size();
    let mut buf = [0u8; 8];
    space.read_exact_at(addr, &mut buf[..size])?;
    let mut v = [0u8; 8];
    if enc.little {
        v[..size].copy_from_slice(&buf[..size]);
        Ok(u64::from_le_bytes(v))
    } else {
        v[8 - size..].copy_from_slice(&buf[..size]);
        Ok(u64::from_be_bytes(v))
    }
}
