//! Synthetic 64-bit little-endian ELF images for the integration tests.
//!
//! The builder lays pieces out naively — header, segment bytes, section
//! bytes, string table, program headers, section headers — which is all
//! the parser needs; nothing here aims to be runnable.

#![allow(dead_code)]

use std::path::PathBuf;

use stacktrail_core::elf::elf_hash;

pub const ET_EXEC: u16 = 2;
pub const ET_CORE: u16 = 4;
pub const EM_X86_64: u16 = 62;

pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;
pub const PT_NOTE: u32 = 4;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_HASH: u32 = 5;
pub const SHT_DYNSYM: u32 = 11;

pub const SHF_ALLOC: u64 = 0x2;

pub const STT_OBJECT_GLOBAL: u8 = 0x11;
pub const STT_FUNC_GLOBAL: u8 = 0x12;

pub struct Section
{
    pub name: &'static str,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub link: u32,
    pub entsize: u64,
    pub data: Vec<u8>,
}

pub struct Segment
{
    pub p_type: u32,
    pub vaddr: u64,
    pub memsz: u64,
    pub data: Vec<u8>,
}

pub struct ElfBuilder
{
    e_type: u16,
    sections: Vec<Section>,
    segments: Vec<Segment>,
}

impl ElfBuilder
{
    pub fn new(e_type: u16) -> Self
    {
        Self {
            e_type,
            sections: Vec::new(),
            segments: Vec::new(),
        }
    }

    pub fn section(mut self, section: Section) -> Self
    {
        self.sections.push(section);
        self
    }

    pub fn segment(mut self, segment: Segment) -> Self
    {
        self.segments.push(segment);
        self
    }

    pub fn build(self) -> Vec<u8>
    {
        let mut out = vec![0u8; 64];

        let mut seg_offsets = Vec::new();
        for seg in &self.segments {
            seg_offsets.push(out.len() as u64);
            out.extend_from_slice(&seg.data);
        }

        let mut sec_offsets = Vec::new();
        for sec in &self.sections {
            sec_offsets.push(out.len() as u64);
            out.extend_from_slice(&sec.data);
        }

        // Section name string table, indexed last.
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for sec in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(sec.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        let shstrtab_off = out.len() as u64;
        let shstrtab_len = shstrtab.len() as u64;
        out.extend_from_slice(&shstrtab);

        let phoff = out.len() as u64;
        for (seg, &offset) in self.segments.iter().zip(&seg_offsets) {
            out.extend_from_slice(&seg.p_type.to_le_bytes());
            out.extend_from_slice(&6u32.to_le_bytes()); // p_flags rw
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes()); // p_paddr
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.max(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        }

        let shoff = out.len() as u64;
        // Null section 0.
        out.extend_from_slice(&[0u8; 64]);
        for (i, sec) in self.sections.iter().enumerate() {
            push_shdr(
                &mut out,
                name_offsets[i],
                sec.sh_type,
                sec.flags,
                sec.addr,
                sec_offsets[i],
                sec.data.len() as u64,
                sec.link,
                sec.entsize,
            );
        }
        push_shdr(
            &mut out,
            shstrtab_name_off,
            SHT_STRTAB,
            0,
            0,
            shstrtab_off,
            shstrtab_len,
            0,
            0,
        );

        let shnum = self.sections.len() as u16 + 2;
        let shstrndx = shnum - 1;

        // File header.
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
        out[24..32].copy_from_slice(&0u64.to_le_bytes()); // e_entry
        out[32..40].copy_from_slice(&phoff.to_le_bytes());
        out[40..48].copy_from_slice(&shoff.to_le_bytes());
        out[48..52].copy_from_slice(&0u32.to_le_bytes()); // e_flags
        out[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
        out[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        out[56..58].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
        out[60..62].copy_from_slice(&shnum.to_le_bytes());
        out[62..64].copy_from_slice(&shstrndx.to_le_bytes());
        out
    }
}

#[allow(clippy::too_many_arguments)]
fn push_shdr(out: &mut Vec<u8>, name: u32, sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64, link: u32, entsize: u64)
{
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&sh_type.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&link.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
    out.extend_from_slice(&8u64.to_le_bytes()); // sh_addralign
    out.extend_from_slice(&entsize.to_le_bytes());
}

/// A growing string table; offset 0 is the empty name.
pub struct Strtab
{
    pub bytes: Vec<u8>,
}

impl Strtab
{
    pub fn new() -> Self
    {
        Self { bytes: vec![0] }
    }

    pub fn add(&mut self, name: &str) -> u32
    {
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        off
    }
}

/// One 64-bit symbol-table entry.
pub fn sym64(name_off: u32, info: u8, shndx: u16, value: u64, size: u64) -> Vec<u8>
{
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&name_off.to_le_bytes());
    out.push(info);
    out.push(0); // st_other
    out.extend_from_slice(&shndx.to_le_bytes());
    out.extend_from_slice(&value.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out
}

/// Classic SysV hash section over symbol names in table order (index 0 is
/// the null symbol and stays unhashed).
pub fn build_hash(names: &[&str], nbucket: u32) -> Vec<u8>
{
    let nchain = names.len() as u32;
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; nchain as usize];
    for (i, name) in names.iter().enumerate().skip(1) {
        let b = (elf_hash(name) % nbucket) as usize;
        chains[i] = buckets[b];
        buckets[b] = i as u32;
    }
    let mut out = Vec::new();
    out.extend_from_slice(&nbucket.to_le_bytes());
    out.extend_from_slice(&nchain.to_le_bytes());
    for word in buckets.iter().chain(chains.iter()) {
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// One note record, 4-byte aligned as cores lay them out.
pub fn note(name: &str, n_type: u32, desc: &[u8]) -> Vec<u8>
{
    let align = |n: usize| (n + 3) & !3;
    let mut out = Vec::new();
    out.extend_from_slice(&((name.len() + 1) as u32).to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&n_type.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.resize(12 + align(name.len() + 1), 0);
    out.extend_from_slice(desc);
    let len = out.len();
    out.resize(len + align(desc.len()) - desc.len(), 0);
    out
}

/// An x86-64 `prstatus` descriptor with the registers the tests need.
pub fn prstatus_x86_64(pid: u32, rip: u64, rsp: u64, rbp: u64) -> Vec<u8>
{
    let mut desc = vec![0u8; 336];
    desc[32..36].copy_from_slice(&pid.to_le_bytes());
    let reg = |desc: &mut Vec<u8>, index: usize, value: u64| {
        let off = 112 + index * 8;
        desc[off..off + 8].copy_from_slice(&value.to_le_bytes());
    };
    reg(&mut desc, 4, rbp); // rbp
    reg(&mut desc, 16, rip); // rip
    reg(&mut desc, 19, rsp); // rsp
    desc
}

fn uleb(mut value: u64, out: &mut Vec<u8>)
{
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// A `.debug_frame` with one version-4 CIE (CFA = rsp + 8, return address
/// saved at CFA - 8) and one empty-program FDE per `(start, len)` range.
/// This is the frame layout of an x86-64 function that has pushed nothing.
pub fn debug_frame_simple(ranges: &[(u64, u64)]) -> Vec<u8>
{
    let mut cie = Vec::new();
    cie.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // CIE id
    cie.push(4); // version
    cie.push(0); // augmentation ""
    cie.push(8); // address size
    cie.push(0); // segment selector size
    uleb(1, &mut cie); // code alignment
    cie.push(0x78); // data alignment -8 (sleb)
    uleb(16, &mut cie); // return address register
    cie.extend_from_slice(&[0x0c, 0x07, 0x08]); // DW_CFA_def_cfa rsp, 8
    cie.extend_from_slice(&[0x90, 0x01]); // DW_CFA_offset r16, cfa-8

    let mut out = Vec::new();
    out.extend_from_slice(&(cie.len() as u32).to_le_bytes());
    out.extend_from_slice(&cie);

    for &(start, len) in ranges {
        let mut fde = Vec::new();
        fde.extend_from_slice(&0u32.to_le_bytes()); // CIE pointer (offset 0)
        fde.extend_from_slice(&start.to_le_bytes());
        fde.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(fde.len() as u32).to_le_bytes());
        out.extend_from_slice(&fde);
    }
    out
}

/// Write an image under the system temp directory and return its path.
pub fn write_temp(name: &str, bytes: &[u8]) -> PathBuf
{
    let dir = std::env::temp_dir().join("stacktrail-tests");
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join(format!("{}-{name}", std::process::id()));
    std::fs::write(&path, bytes).expect("write temp image");
    path
}
