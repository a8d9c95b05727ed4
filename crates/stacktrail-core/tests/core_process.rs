//! Core provider: synthesized address space, thread notes, and the vtable
//! scanner end to end.

mod common;

use common::*;
use stacktrail_core::scan::{scan_vtables, ScanConfig};
use stacktrail_core::{Error, Process};

const NT_PRSTATUS: u32 = 1;

const DATA_VA: u64 = 0x500000;
const VTBL_ADDR: u64 = 0x402000;
const VTBL_SIZE: u64 = 0x18;

/// Executable contributing `_ZTV1C` (with pointers in the core) and
/// `_ZTV1D` (without any).
fn scan_exec() -> Vec<u8>
{
    let mut dynstr = Strtab::new();
    let d_c = dynstr.add("_ZTV1C");
    let d_d = dynstr.add("_ZTV1D");

    let mut dynsym = sym64(0, 0, 0, 0, 0);
    dynsym.extend_from_slice(&sym64(d_c, STT_OBJECT_GLOBAL, 2, VTBL_ADDR, VTBL_SIZE));
    dynsym.extend_from_slice(&sym64(d_d, STT_OBJECT_GLOBAL, 2, 0x402020, 0x8));

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
            data: vec![0x90; 0x40],
        })
        .section(Section {
            name: ".data",
            sh_type: SHT_PROGBITS,
            flags: SHF_ALLOC,
            addr: 0x402000,
            link: 0,
            entsize: 0,
            data: vec![0; 0x40],
        })
        .section(Section {
            name: ".dynstr",
            sh_type: SHT_STRTAB,
            flags: 0,
            addr: 0,
            link: 0,
            entsize: 0,
            data: dynstr.bytes,
        })
        .section(Section {
            name: ".dynsym",
            sh_type: SHT_DYNSYM,
            flags: 0,
            addr: 0,
            link: 3,
            entsize: 24,
            data: dynsym,
        })
        .build()
}

/// Data segment of the core: seven pointers into `_ZTV1C`, three words in
/// `[0x1000, 0x2000)`, decoys, and one `hello` literal.
fn core_data() -> Vec<u8>
{
    let words: [u64; 15] = [
        0x402010,     // hit 1
        0x11223344,   // noise
        0x402010,     // hit 2
        0x402018,     // one past the vtable: no hit
        0x402010,     // hit 3
        0x402010,     // hit 4
        0x402010,     // hit 5
        0x402010,     // hit 6
        0x402010,     // hit 7
        0x401fff,     // below every listed symbol
        0x1000,       // range hit (aligned)
        0x1ffc,       // range hit (aligned)
        0x1004,       // range hit (aligned)
        0x1ffe,       // in range but not 4-byte aligned
        0x2000,       // one past the range
    ];
    let mut data = Vec::new();
    for word in words {
        data.extend_from_slice(&word.to_le_bytes());
    }
    data.extend_from_slice(b"hello\0\0\0");
    data
}

fn sample_core() -> Vec<u8>
{
    let prstatus = prstatus_x86_64(4242, 0x12345, 0x7ff000, 0);
    ElfBuilder::new(ET_CORE)
        .segment(Segment {
            p_type: PT_NOTE,
            vaddr: 0,
            memsz: 0,
            data: note("CORE", NT_PRSTATUS, &prstatus),
        })
        .segment(Segment {
            p_type: PT_LOAD,
            vaddr: DATA_VA,
            memsz: core_data().len() as u64 + 0x100,
            data: core_data(),
        })
        .build()
}

fn open_sample(tag: &str) -> Process
{
    let core = write_temp(&format!("{tag}-core"), &sample_core());
    let exec = write_temp(&format!("{tag}-exec"), &scan_exec());
    let mut process = Process::open_core(&core, Some(exec.as_path())).unwrap();
    process.load().unwrap();
    process
}

#[test]
fn address_space_reads_follow_segments()
{
    let process = open_sample("addrspace");
    let io = process.io();
    let data = core_data();

    let mut buf = [0u8; 16];
    io.read_exact_at(DATA_VA, &mut buf).unwrap();
    assert_eq!(&buf, &data[..16]);

    // Crossing p_filesz into p_memsz reads zeros.
    let filesz = data.len() as u64;
    let mut buf = [0u8; 16];
    io.read_exact_at(DATA_VA + filesz - 8, &mut buf).unwrap();
    assert_eq!(&buf[..8], &data[data.len() - 8..]);
    assert_eq!(&buf[8..], &[0u8; 8]);

    // Outside every segment fails.
    let mut buf = [0u8; 8];
    assert!(matches!(io.read_at(0x900000, &mut buf), Err(Error::Unmapped(0x900000))));

    // A read running off the end of the segment comes back short.
    let seg_end = DATA_VA + filesz + 0x100;
    let mut buf = [0u8; 64];
    let got = io.read_at(seg_end - 8, &mut buf).unwrap();
    assert_eq!(got, 8);
}

#[test]
fn threads_come_from_prstatus_notes()
{
    let process = open_sample("threads");
    let threads = process.threads();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].tid.0, 4242);
    assert_eq!(threads[0].regs.pc(), 0x12345);
    assert_eq!(threads[0].regs.sp(), Some(0x7ff000));
}

#[test]
fn scanner_counts_vtable_pointers()
{
    let process = open_sample("scan");
    let report = scan_vtables(&process, &ScanConfig::default()).unwrap();

    assert_eq!(report.rows.len(), 1, "zero-count rows must be suppressed");
    assert_eq!(report.rows[0].name, "_ZTV1C");
    assert_eq!(report.rows[0].count, 7);
    assert_eq!(report.rows[0].address, VTBL_ADDR);
    assert!(report.needle_hits.is_empty());
    assert!(report.range_hits.is_empty());
}

#[test]
fn scanner_records_hit_addresses_on_request()
{
    let process = open_sample("scan-addrs");
    let config = ScanConfig {
        show_addresses: true,
        ..ScanConfig::default()
    };
    let report = scan_vtables(&process, &config).unwrap();
    assert_eq!(report.addresses.len(), 7);
    assert!(report.addresses.iter().all(|hit| hit.symbol == "_ZTV1C" && hit.offset == 0x10));
    assert_eq!(report.addresses[0].location, DATA_VA);
}

#[test]
fn scanner_finds_literal_needle_once()
{
    let process = open_sample("scan-needle");
    let config = ScanConfig {
        needle: Some(b"hello".to_vec()),
        ..ScanConfig::default()
    };
    let report = scan_vtables(&process, &config).unwrap();
    assert_eq!(report.needle_hits, vec![DATA_VA + 15 * 8]);
    assert!(report.rows.is_empty());
}

#[test]
fn scanner_reports_words_pointing_into_range()
{
    let process = open_sample("scan-range");
    let config = ScanConfig {
        range: Some((0x1000, 0x2000)),
        ..ScanConfig::default()
    };
    let report = scan_vtables(&process, &config).unwrap();
    assert_eq!(report.range_hits.len(), 3);
    assert_eq!(
        report.range_hits,
        vec![DATA_VA + 10 * 8, DATA_VA + 11 * 8, DATA_VA + 12 * 8]
    );
}

#[test]
fn scanner_output_is_deterministic()
{
    let process = open_sample("scan-det");
    let config = ScanConfig {
        show_addresses: true,
        ..ScanConfig::default()
    };
    let first = format!("{:?}", scan_vtables(&process, &config).unwrap());
    let second = format!("{:?}", scan_vtables(&process, &config).unwrap());
    assert_eq!(first, second);
}

#[test]
fn glob_patterns_limit_the_symbol_set()
{
    let process = open_sample("scan-pattern");
    let config = ScanConfig {
        patterns: vec!["_ZTV1D".to_string()],
        ..ScanConfig::default()
    };
    let report = scan_vtables(&process, &config).unwrap();
    assert!(report.rows.is_empty(), "no pointers into _ZTV1D exist");
}
