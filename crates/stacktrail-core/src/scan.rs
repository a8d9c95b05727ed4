//! # VTable Scanner
//!
//! Sweeps the file-backed memory of a core image for pointer values that
//! land inside symbols matching a set of glob patterns — by default the
//! vtables GCC emits as `_ZTV*` — and histograms the hits. Since every
//! polymorphic C++ object starts with a vtable pointer, the histogram
//! approximates the live-object count per class.
//!
//! Two side modes reuse the same sweep: a literal-needle search (`-S`) and
//! a search for pointers into a fixed `[min, max)` range (`-f`/`-e`).

use tracing::debug;

use crate::elf::defs::PT_LOAD;
use crate::error::{Error, Result};
use crate::proc::Process;

/// Default pattern: GCC/Itanium vtable symbols.
pub const DEFAULT_PATTERN: &str = "_ZTV*";

const PAGE_SIZE: usize = 4096;

/// What to sweep for.
#[derive(Debug, Clone)]
pub struct ScanConfig
{
    /// Glob patterns selecting the symbols to count hits against.
    pub patterns: Vec<String>,
    /// Literal byte string to search for instead of pointer sweeping.
    pub needle: Option<Vec<u8>>,
    /// `[min, max)` range: report words that point into it.
    pub range: Option<(u64, u64)>,
    /// Record the address of every individual hit.
    pub show_addresses: bool,
}

impl Default for ScanConfig
{
    fn default() -> Self
    {
        Self {
            patterns: vec![DEFAULT_PATTERN.to_string()],
            needle: None,
            range: None,
            show_addresses: false,
        }
    }
}

/// One output row: a matched symbol and its hit count.
#[derive(Debug, Clone)]
pub struct CountRow
{
    pub name: String,
    pub object: String,
    /// Relocated address of the symbol in the process.
    pub address: u64,
    pub size: u64,
    pub count: u64,
}

/// A single recorded hit (with `show_addresses`).
#[derive(Debug, Clone)]
pub struct HitAddress
{
    pub symbol: String,
    /// Offset of the pointed-to word from the symbol's start.
    pub offset: u64,
    /// Address of the word holding the pointer.
    pub location: u64,
}

/// Everything a sweep produced.
#[derive(Debug, Default)]
pub struct ScanReport
{
    /// Symbols with at least one hit, ordered by count descending (ties
    /// by address ascending, so output is deterministic).
    pub rows: Vec<CountRow>,
    /// Individual hit locations, when requested.
    pub addresses: Vec<HitAddress>,
    /// Addresses of needle matches (`-S`).
    pub needle_hits: Vec<u64>,
    /// Addresses of words pointing into the configured range (`-f`/`-e`).
    pub range_hits: Vec<u64>,
}

#[derive(Debug, PartialEq)]
struct ListedSymbol
{
    address: u64,
    size: u64,
    name: String,
    object: String,
    count: u64,
}

/// Sweep a core process. Needs a core image: the sweep walks `PT_LOAD`
/// file-backed bytes, which a live target does not expose.
pub fn scan_vtables(process: &Process, config: &ScanConfig) -> Result<ScanReport>
{
    let core = process
        .core()
        .ok_or_else(|| Error::Unsupported("vtable scanning needs a core image".into()))?
        .clone();
    let enc = core.encoding();
    let word_size = enc.word_size();

    let mut listed = collect_symbols(process, &config.patterns)?;
    listed.sort_by(|l, r| l.address.cmp(&r.address));

    let mut report = ScanReport::default();
    let mut file_bytes = 0u64;
    let mut mem_bytes = 0u64;
    let io = process.io();

    for seg in core.segments() {
        if seg.p_type != PT_LOAD {
            continue;
        }
        file_bytes += seg.p_filesz;
        mem_bytes += seg.p_memsz;
        debug!(
            "scan {:#x} to {:#x} (filesz {:#x}, memsz {:#x})",
            seg.p_vaddr,
            seg.p_vaddr + seg.p_memsz,
            seg.p_filesz,
            seg.p_memsz
        );

        if let Some(needle) = &config.needle {
            search_needle(io.as_ref(), seg.p_vaddr, seg.p_filesz, needle, &mut report.needle_hits);
            continue;
        }

        // Word-aligned pointer sweep over the file-backed bytes.
        let mut page = vec![0u8; PAGE_SIZE];
        let mut loc = seg.p_vaddr;
        let seg_end = seg.p_vaddr + seg.p_filesz;
        while loc < seg_end {
            let want = ((seg_end - loc) as usize).min(PAGE_SIZE);
            let got = match io.read_at(loc, &mut page[..want]) {
                Ok(got) => got,
                Err(err) => {
                    debug!("sweep skips {loc:#x}: {err}");
                    break;
                }
            };
            if got == 0 {
                break;
            }
            for i in 0..got / word_size {
                let word = decode_word(&page[i * word_size..(i + 1) * word_size], enc.little);
                let holder = loc + (i * word_size) as u64;
                if let Some((min, max)) = config.range {
                    if word >= min && word < max && word % 4 == 0 {
                        report.range_hits.push(holder);
                    }
                } else if let Some(symbol) = bisect(&mut listed, word) {
                    symbol.count += 1;
                    if config.show_addresses {
                        report.addresses.push(HitAddress {
                            symbol: symbol.name.clone(),
                            offset: word - symbol.address,
                            location: holder,
                        });
                    }
                }
            }
            loc += got as u64;
        }
    }
    debug!("core file contains {file_bytes:#x} out of {mem_bytes:#x} bytes of memory");

    listed.sort_by(|l, r| r.count.cmp(&l.count).then(l.address.cmp(&r.address)));
    report.rows = listed
        .into_iter()
        .filter(|symbol| symbol.count != 0)
        .map(|symbol| CountRow {
            name: symbol.name,
            object: symbol.object,
            address: symbol.address,
            size: symbol.size,
            count: symbol.count,
        })
        .collect();
    Ok(report)
}

/// Pattern-matching symbols of every loaded object, `.dynsym` and
/// `.symtab` both, relocated to process addresses.
fn collect_symbols(process: &Process, patterns: &[String]) -> Result<Vec<ListedSymbol>>
{
    let mut listed: Vec<ListedSymbol> = Vec::new();
    for loaded in process.objects() {
        let mut count = 0usize;
        for table in [".dynsym", ".symtab"] {
            let Some(iter) = loaded.object.symbols(table)? else {
                continue;
            };
            for (sym, name) in iter {
                if name.is_empty() || !patterns.iter().any(|pattern| glob_match(pattern, &name)) {
                    continue;
                }
                let address = sym.st_value.wrapping_add(loaded.reloc);
                if listed
                    .iter()
                    .any(|existing| existing.address == address && existing.name == name)
                {
                    continue;
                }
                listed.push(ListedSymbol {
                    address,
                    size: sym.st_size,
                    name,
                    object: loaded.name.clone(),
                    count: 0,
                });
                count += 1;
            }
        }
        debug!("found {count} symbols in {}", loaded.name);
    }
    Ok(listed)
}

/// Greatest listed symbol with `address <= word`, if the word falls inside
/// its sized range.
fn bisect(listed: &mut [ListedSymbol], word: u64) -> Option<&mut ListedSymbol>
{
    let i = listed.partition_point(|symbol| symbol.address <= word);
    if i == 0 {
        return None;
    }
    let candidate = &mut listed[i - 1];
    if candidate.address + candidate.size > word {
        Some(candidate)
    } else {
        None
    }
}

/// Bytewise needle search across `[start, start + filesz - len)`.
fn search_needle(io: &dyn crate::reader::Reader, start: u64, filesz: u64, needle: &[u8], hits: &mut Vec<u64>)
{
    if needle.is_empty() || filesz < needle.len() as u64 {
        return;
    }
    let overlap = needle.len() - 1;
    let mut buf = vec![0u8; PAGE_SIZE + overlap];
    let end = start + filesz;
    // Window starts run over [start, start + filesz - len).
    let last_start = end - needle.len() as u64;
    let mut loc = start;
    while loc < end {
        let want = ((end - loc) as usize).min(buf.len());
        let got = match io.read_at(loc, &mut buf[..want]) {
            Ok(got) if got >= needle.len() => got,
            _ => break,
        };
        let window = &buf[..got];
        for (i, candidate) in window.windows(needle.len()).enumerate() {
            if loc + (i as u64) >= last_start {
                break;
            }
            if candidate == needle {
                hits.push(loc + i as u64);
            }
        }
        if got < want {
            break;
        }
        // Step back so matches straddling the buffer edge are seen once.
        loc += (got - overlap) as u64;
    }
    hits.dedup();
}

/// Shell-style `*` glob, the only metacharacter vtable patterns need.
pub fn glob_match(pattern: &str, name: &str) -> bool
{
    fn matches(p: &[u8], n: &[u8]) -> bool
    {
        match p.split_first() {
            None => n.is_empty(),
            Some((b'*', rest)) => (0..=n.len()).any(|i| matches(rest, &n[i..])),
            Some((&c, rest)) => n.split_first().map(|(&first, tail)| first == c && matches(rest, tail)).unwrap_or(false),
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

fn decode_word(bytes: &[u8], little: bool) -> u64
{
    let mut v = [0u8; 8];
    if little {
        v[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(v)
    } else {
        v[8 - bytes.len()..].copy_from_slice(bytes);
        u64::from_be_bytes(v)
    }
}
