//! Core-image provider: an address space synthesized from `PT_LOAD`
//! segments, plus thread and mapping recovery from the core's notes.

use std::sync::Arc;

use gimli::Register;
use tracing::{debug, trace};

use super::Thread;
use crate::elf::defs::{Encoding, Note, NT_FILE, NT_PRSTATUS};
use crate::elf::ElfObject;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::types::{Machine, RegisterFile, ThreadId};

/// Address-space reader over a core image.
///
/// A read at virtual address `va` finds the `PT_LOAD` segment containing
/// `va` and serves bytes from `p_offset + (va - p_vaddr)`; bytes past
/// `p_filesz` but within `p_memsz` read as zero, and addresses outside
/// every segment fail with [`Error::Unmapped`].
pub(super) struct CoreReader
{
    core: Arc<ElfObject>,
}

impl CoreReader
{
    pub(super) fn new(core: Arc<ElfObject>) -> Self
    {
        Self { core }
    }
}

impl Reader for CoreReader
{
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<usize>
    {
        let mut done = 0;
        while done < dst.len() {
            let va = offset + done as u64;
            let Some(seg) = self.core.find_header_for_address(va) else {
                break;
            };
            let into_seg = va - seg.p_vaddr;
            let remaining = &mut dst[done..];
            if into_seg < seg.p_filesz {
                let avail = (seg.p_filesz - into_seg) as usize;
                let take = avail.min(remaining.len());
                self.core.io().read_exact_at(seg.p_offset + into_seg, &mut remaining[..take])?;
                done += take;
            } else {
                // Between p_filesz and p_memsz the kernel dropped an
                // all-zero page.
                let avail = (seg.p_memsz - into_seg) as usize;
                let take = avail.min(remaining.len());
                remaining[..take].iter_mut().for_each(|b| *b = 0);
                done += take;
            }
        }
        if done == 0 && !dst.is_empty() {
            return Err(Error::Unmapped(offset));
        }
        Ok(done)
    }

    fn describe(&self) -> String
    {
        format!("core {}", self.core.describe())
    }
}

/// Offset of `pr_pid` within a 64-bit `prstatus` descriptor.
const PR_PID_OFFSET: usize = 32;
/// Offset of `pr_reg` within a 64-bit `prstatus` descriptor.
const PR_REG_OFFSET: usize = 112;

/// Threads recovered from the core's `NT_PRSTATUS` notes, in note order.
pub(super) fn threads(core: &ElfObject) -> Vec<Thread>
{
    let machine = core.machine();
    let enc = core.encoding();
    let mut threads = Vec::new();
    let notes = match core.notes() {
        Ok(notes) => notes,
        Err(err) => {
            debug!("{}: cannot read notes: {err}", core.describe());
            return threads;
        }
    };
    for note in &notes {
        if note.n_type != NT_PRSTATUS {
            continue;
        }
        match parse_prstatus(&note.desc, machine, enc) {
            Some(thread) => {
                trace!("core thread {} pc {:#x}", thread.tid, thread.regs.pc());
                threads.push(thread);
            }
            None => debug!("{}: undecodable NT_PRSTATUS note", core.describe()),
        }
    }
    threads
}

fn parse_prstatus(desc: &[u8], machine: Machine, enc: Encoding) -> Option<Thread>
{
    if !enc.class64 {
        // 32-bit prstatus layouts are not carried; the thread is still
        // reported, without registers.
        return None;
    }
    let u32_at = |off: usize| -> Option<u32> {
        let b = desc.get(off..off + 4)?;
        let v = [b[0], b[1], b[2], b[3]];
        Some(if enc.little {
            u32::from_le_bytes(v)
        } else {
            u32::from_be_bytes(v)
        })
    };
    let u64_at = |off: usize| -> Option<u64> {
        let b = desc.get(off..off + 8)?;
        let mut v = [0u8; 8];
        v.copy_from_slice(b);
        Some(if enc.little {
            u64::from_le_bytes(v)
        } else {
            u64::from_be_bytes(v)
        })
    };

    let tid = u32_at(PR_PID_OFFSET)?;
    let mut regs = RegisterFile::new(machine);
    match machine {
        Machine::X86_64 => {
            // pr_reg holds user_regs_struct: r15 r14 r13 r12 rbp rbx r11
            // r10 r9 r8 rax rcx rdx rsi rdi orig_rax rip cs eflags rsp ...
            let gp = |i: usize| u64_at(PR_REG_OFFSET + i * 8);
            const TO_DWARF: [(usize, u16); 16] = [
                (10, 0), // rax
                (12, 1), // rdx
                (11, 2), // rcx
                (5, 3),  // rbx
                (13, 4), // rsi
                (14, 5), // rdi
                (4, 6),  // rbp
                (19, 7), // rsp
                (9, 8),  // r8
                (8, 9),  // r9
                (7, 10), // r10
                (6, 11), // r11
                (3, 12), // r12
                (2, 13), // r13
                (1, 14), // r14
                (0, 15), // r15
            ];
            for (slot, dwarf) in TO_DWARF {
                regs.set(Register(dwarf), gp(slot)?);
            }
            regs.set_pc(gp(16)?);
        }
        Machine::Aarch64 => {
            // pr_reg holds x0..x30, sp, pc, pstate; DWARF numbering is
            // the identity for x0..x30 with sp at 31.
            let gp = |i: usize| u64_at(PR_REG_OFFSET + i * 8);
            for i in 0..31u16 {
                regs.set(Register(i), gp(i as usize)?);
            }
            regs.set(Register(31), gp(31)?);
            regs.set_pc(gp(32)?);
        }
        Machine::Other(_) => return None,
    }

    Some(Thread {
        tid: ThreadId(tid),
        regs,
    })
}

/// One entry of the kernel's `NT_FILE` note.
#[derive(Debug, Clone)]
pub(super) struct FileMapping
{
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
}

/// Mappings recorded by the kernel in the core's `NT_FILE` note, if any.
pub(super) fn file_mappings(core: &ElfObject) -> Vec<FileMapping>
{
    let enc = core.encoding();
    let Ok(notes) = core.notes() else {
        return Vec::new();
    };
    notes
        .iter()
        .filter(|note| note.n_type == NT_FILE)
        .flat_map(|note| parse_nt_file(note, enc))
        .collect()
}

fn parse_nt_file(note: &Note, enc: Encoding) -> Vec<FileMapping>
{
    let mut out = Vec::new();
    let word = |off: usize| -> Option<u64> {
        let size = enc.word_size();
        let b = note.desc.get(off..off + size)?;
        let mut v = [0u8; 8];
        if enc.little {
            v[..size].copy_from_slice(b);
            Some(u64::from_le_bytes(v))
        } else {
            v[8 - size..].copy_from_slice(b);
            Some(u64::from_be_bytes(v))
        }
    };
    let ws = enc.word_size();
    let Some(count) = word(0) else {
        return out;
    };
    let Some(page_size) = word(ws) else {
        return out;
    };
    let triples = 2 * ws;
    let names_off = triples + count as usize * 3 * ws;
    let mut name_pos = names_off;
    for i in 0..count as usize {
        let base = triples + i * 3 * ws;
        let (Some(start), Some(end), Some(pgoff)) = (word(base), word(base + ws), word(base + 2 * ws)) else {
            break;
        };
        let tail = &note.desc[name_pos.min(note.desc.len())..];
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let path = String::from_utf8_lossy(&tail[..len]).into_owned();
        name_pos += len + 1;
        out.push(FileMapping {
            start,
            end,
            file_offset: pgoff.wrapping_mul(page_size),
            path,
        });
    }
    out
}

/// Start address of the image whose backing file matches `path`, from the
/// `NT_FILE` note: the mapping of that file with file offset zero.
pub(super) fn image_base(core: &ElfObject, path: &str) -> Option<u64>
{
    file_mappings(core)
        .iter()
        .filter(|m| m.file_offset == 0 && (m.path == path || same_basename(&m.path, path)))
        .map(|m| m.start)
        .min()
}

fn same_basename(a: &str, b: &str) -> bool
{
    let tail = |s: &str| s.rsplit('/').next().map(str::to_string);
    tail(a).is_some() && tail(a) == tail(b)
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn nt_file_note_decodes()
    {
        // count=1, page_size=0x1000, one mapping of "/lib/x.so" at
        // 0x7000_0000..0x7000_4000, file offset page 2.
        let mut desc = Vec::new();
        for v in [1u64, 0x1000, 0x7000_0000, 0x7000_4000, 2] {
            desc.extend_from_slice(&v.to_le_bytes());
        }
        desc.extend_from_slice(b"/lib/x.so\0");
        let note = Note {
            name: "CORE".into(),
            n_type: NT_FILE,
            desc,
        };
        let enc = Encoding {
            class64: true,
            little: true,
        };
        let mappings = parse_nt_file(&note, enc);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].start, 0x7000_0000);
        assert_eq!(mappings[0].file_offset, 0x2000);
        assert_eq!(mappings[0].path, "/lib/x.so");
    }
}
