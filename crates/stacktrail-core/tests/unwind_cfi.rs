//! Drive the unwinder over a hand-assembled `.debug_frame` and a
//! synthetic core: three functions, each one page-less frame deep, with
//! the classic x86-64 rule (CFA = rsp + 8, return address at CFA - 8).

mod common;

use std::path::PathBuf;

use common::*;
use stacktrail_core::{Process, ProcessOptions};

const NT_PRSTATUS: u32 = 1;

const FUNC_A: u64 = 0x401000;
const FUNC_B: u64 = 0x401040;
const FUNC_C: u64 = 0x401080;
const FUNC_LEN: u64 = 0x40;

const STACK_VA: u64 = 0x7ff000;

fn unwind_exec() -> Vec<u8>
{
    let mut strtab = Strtab::new();
    let a_off = strtab.add("func_a");
    let b_off = strtab.add("func_b");
    let c_off = strtab.add("func_c");

    let mut symtab = sym64(0, 0, 0, 0, 0);
    symtab.extend_from_slice(&sym64(a_off, STT_FUNC_GLOBAL, 1, FUNC_A, FUNC_LEN));
    symtab.extend_from_slice(&sym64(b_off, STT_FUNC_GLOBAL, 1, FUNC_B, FUNC_LEN));
    symtab.extend_from_slice(&sym64(c_off, STT_FUNC_GLOBAL, 1, FUNC_C, FUNC_LEN));

    let frame = debug_frame_simple(&[(FUNC_A, FUNC_LEN), (FUNC_B, FUNC_LEN), (FUNC_C, FUNC_LEN)]);

    ElfBuilder::new(ET_EXEC)
        .segment(Segment {
            p_type: PT_LOAD,
            vaddr: 0x400000,
            memsz: 0x3000,
            data: Vec::new(),
        })
        .section(Section {
            name: ".text",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC,
            addr: 0x401000,
            link: 0,
            entsize: 0,
            data: vec![0x90; 0x100],
        })
        .section(Section {
            name: ".strtab",
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            link: 0,
            entsize: 0,
            data: strtab.bytes,
        })
        .section(Section {
            name: ".symtab",
            sh_type: SHT_SYMTAB,
            flags: 0,
            addr: 0,
            link: 2,
            entsize: 24,
            data: symtab,
        })
        .section(Section {
            name: ".debug_frame",
            sh_type: SHT_PROGBITS,
            flags: 0,
            addr: 0,
            link: 0,
            entsize: 0,
            data: frame,
        })
        .build()
}

fn unwind_core(pc: u64, stack_words: &[u64]) -> Vec<u8>
{
    let mut stack = Vec::new();
    for word in stack_words {
        stack.extend_from_slice(&word.to_le_bytes());
    }
    let prstatus = prstatus_x86_64(7, pc, STACK_VA, 0);
    ElfBuilder::new(ET_CORE)
        .segment(Segment {
            p_type: PT_NOTE,
            vaddr: 0,
            memsz: 0,
            data: note("CORE", NT_PRSTATUS, &prstatus),
        })
        .segment(Segment {
            p_type: PT_LOAD,
            vaddr: STACK_VA,
            memsz: stack.len() as u64,
            data: stack,
        })
        .build()
}

fn open(tag: &str, core_bytes: &[u8], max_frames: usize) -> Process
{
    let core = write_temp(&format!("{tag}-core"), core_bytes);
    let exec = write_temp(&format!("{tag}-exec"), &unwind_exec());
    let options = ProcessOptions {
        debug_prefix: PathBuf::from("/usr/lib/debug"),
        max_frames,
    };
    let mut process = Process::open_core_with(&core, Some(exec.as_path()), options).unwrap();
    process.load().unwrap();
    process
}

#[test]
fn unwind_walks_the_caller_chain()
{
    // Stopped in func_a, called by func_b, called by func_c, whose own
    // return slot holds the zero sentinel.
    let core = unwind_core(FUNC_A + 0x10, &[FUNC_B + 0x10, FUNC_C + 0x10, 0]);
    let process = open("chain", &core, 4096);
    let thread = process.threads()[0].clone();

    let frames: Vec<_> = process.unwind(&thread).collect();
    assert_eq!(frames.len(), 3);

    let pcs: Vec<u64> = frames.iter().map(|f| f.pc.value()).collect();
    assert_eq!(pcs, vec![FUNC_A + 0x10, FUNC_B + 0x10, FUNC_C + 0x10]);

    let names: Vec<String> = frames
        .iter()
        .map(|f| {
            f.symbol
                .as_ref()
                .and_then(|s| s.name.as_ref())
                .map(|n| n.display_name().to_string())
                .unwrap_or_else(|| "??".into())
        })
        .collect();
    assert_eq!(names, vec!["func_a", "func_b", "func_c"]);

    // The caller's stack pointer is the callee's CFA.
    assert_eq!(frames[1].sp.value(), STACK_VA + 8);
    assert_eq!(frames[2].sp.value(), STACK_VA + 16);
}

#[test]
fn recursion_unwinds_one_frame_per_return_slot()
{
    let mut stack = vec![FUNC_A + 0x10; 50];
    stack.push(0);
    let core = unwind_core(FUNC_A + 0x10, &stack);
    let process = open("recursion", &core, 4096);
    let thread = process.threads()[0].clone();

    let frames: Vec<_> = process.unwind(&thread).collect();
    assert_eq!(frames.len(), 51);
    assert!(frames.iter().all(|f| {
        f.symbol
            .as_ref()
            .and_then(|s| s.name.as_ref())
            .map(|n| n.display_name() == "func_a")
            .unwrap_or(false)
    }));
}

#[test]
fn frame_cap_bounds_runaway_stacks()
{
    // No terminator anywhere: every slot loops back into func_a.
    let stack = vec![FUNC_A + 0x10; 512];
    let core = unwind_core(FUNC_A + 0x10, &stack);
    let process = open("cap", &core, 16);
    let thread = process.threads()[0].clone();

    assert_eq!(process.unwind(&thread).count(), 16);
}

#[test]
fn missing_fde_truncates_after_the_current_frame()
{
    // PC inside the mapped text but past every FDE range.
    let core = unwind_core(0x4010f0, &[FUNC_B + 0x10, 0]);
    let process = open("nofde", &core, 4096);
    let thread = process.threads()[0].clone();

    let frames: Vec<_> = process.unwind(&thread).collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pc.value(), 0x4010f0);
}

#[test]
fn unmapped_pc_yields_a_bare_frame()
{
    let core = unwind_core(0x900000, &[0]);
    let process = open("unmapped", &core, 4096);
    let thread = process.threads()[0].clone();

    let frames: Vec<_> = process.unwind(&thread).collect();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].symbol.is_none());
}
