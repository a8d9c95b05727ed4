//! Symbol tables: iteration, the classic hash accelerator, lookups.

use std::sync::Arc;

use tracing::trace;

use super::defs::{Encoding, Symbol, SHF_ALLOC, SHN_LORESERVE, SHT_NOBITS, STN_UNDEF, STT_NOTYPE};
use super::ElfObject;
use crate::error::{Error, Result};

/// Result of an address lookup.
#[derive(Debug, Clone)]
pub struct SymbolMatch
{
    pub symbol: Symbol,
    pub name: String,
    /// `true` when the address lies inside the symbol's sized range;
    /// `false` for a size-zero "stub" fallback.
    pub exact: bool,
}

/// Cursor over one symbol table and its string table.
///
/// Yields `(entry, name)` pairs in table order. The table and string bytes
/// are snapshotted up front, so iteration never mutates the owning object
/// and string reads cannot escape the string section.
pub struct SymbolIter
{
    syms: Arc<[u8]>,
    strs: Arc<[u8]>,
    enc: Encoding,
    stride: usize,
    count: usize,
    index: usize,
}

impl SymbolIter
{
    pub(super) fn new(object: &ElfObject, symtab_index: usize) -> Result<Self>
    {
        let enc = object.header.encoding;
        let shdr = object.sections[symtab_index];
        let syms = object.section_data(symtab_index)?;
        let strs = match object.sections.get(shdr.sh_link as usize) {
            Some(_) => object.section_data(shdr.sh_link as usize)?,
            None => Arc::from(Vec::new()),
        };
        let entsize = Symbol::entry_size(enc);
        let declared = shdr.sh_entsize as usize;
        let stride = if declared >= entsize { declared } else { entsize };
        let count = syms.len() / stride;
        Ok(Self {
            syms,
            strs,
            enc,
            stride,
            count,
            index: 0,
        })
    }
}

impl Iterator for SymbolIter
{
    type Item = (Symbol, String);

    fn next(&mut self) -> Option<Self::Item>
    {
        if self.index >= self.count {
            return None;
        }
        let entsize = Symbol::entry_size(self.enc);
        let off = self.index * self.stride;
        self.index += 1;
        let sym = Symbol::parse(&self.syms[off..off + entsize], self.enc).ok()?;
        let name = string_at(&self.strs, sym.st_name);
        Some((sym, name))
    }
}

/// The classic SysV `.hash` accelerator over `.dynsym`.
///
/// The bucket/chain words and the symbol/string bytes are read into memory
/// once at parse time; probes never go back to the backing reader.
pub(super) struct SymHash
{
    nbucket: u32,
    buckets: Vec<u32>,
    chains: Vec<u32>,
    syms: Arc<[u8]>,
    strs: Arc<[u8]>,
    enc: Encoding,
}

impl SymHash
{
    pub(super) fn parse(object: &ElfObject, hash_index: usize) -> Result<Self>
    {
        let enc = object.header.encoding;
        let data = object.section_data(hash_index)?;
        let words: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| {
                let v = [c[0], c[1], c[2], c[3]];
                if enc.little {
                    u32::from_le_bytes(v)
                } else {
                    u32::from_be_bytes(v)
                }
            })
            .collect();
        if words.len() < 2 {
            return Err(Error::TruncatedSection(format!("{}: .hash", object.describe())));
        }
        let nbucket = words[0];
        let nchain = words[1];
        let need = 2 + nbucket as usize + nchain as usize;
        if words.len() < need || nbucket == 0 {
            return Err(Error::TruncatedSection(format!("{}: .hash", object.describe())));
        }
        let buckets = words[2..2 + nbucket as usize].to_vec();
        let chains = words[2 + nbucket as usize..need].to_vec();

        let symtab_index = object.sections[hash_index].sh_link as usize;
        let symtab = object
            .sections
            .get(symtab_index)
            .copied()
            .ok_or_else(|| Error::TruncatedSection(format!("{}: .hash link", object.describe())))?;
        let syms = object.section_data(symtab_index)?;
        let strs = match object.sections.get(symtab.sh_link as usize) {
            Some(_) => object.section_data(symtab.sh_link as usize)?,
            None => Arc::from(Vec::new()),
        };
        Ok(Self {
            nbucket,
            buckets,
            chains,
            syms,
            strs,
            enc,
        })
    }

    pub(super) fn find(&self, name: &str) -> Option<(Symbol, String)>
    {
        let entsize = Symbol::entry_size(self.enc);
        let bucket = (elf_hash(name) % self.nbucket) as usize;
        let mut index = self.buckets[bucket];
        let mut steps = 0u32;
        while index != STN_UNDEF {
            // A malformed chain could cycle; nchain bounds any honest walk.
            steps += 1;
            if steps > self.chains.len() as u32 {
                return None;
            }
            let off = index as usize * entsize;
            if off + entsize > self.syms.len() {
                return None;
            }
            let sym = Symbol::parse(&self.syms[off..off + entsize], self.enc).ok()?;
            let candidate = string_at(&self.strs, sym.st_name);
            if candidate == name {
                return Some((sym, candidate));
            }
            index = *self.chains.get(index as usize)?;
        }
        None
    }
}

fn string_at(strs: &[u8], st_name: u32) -> String
{
    let start = st_name as usize;
    if start >= strs.len() {
        return String::new();
    }
    let tail = &strs[start..];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}

/// Culled from the System V Application Binary Interface.
pub fn elf_hash(name: &str) -> u32
{
    let mut h: u32 = 0;
    for &byte in name.as_bytes() {
        h = (h << 4).wrapping_add(byte as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

impl ElfObject
{
    /// Iterate a named symbol table (`.dynsym`, `.symtab`, ...).
    ///
    /// Returns `None` when the table is absent or carries no bits.
    pub fn symbols(&self, table: &str) -> Result<Option<SymbolIter>>
    {
        let Some(section) = self.get_section(table, None) else {
            return Ok(None);
        };
        if section.header().sh_type == SHT_NOBITS {
            return Ok(None);
        }
        SymbolIter::new(section.object, section.index).map(Some)
    }

    /// Locate a named symbol.
    ///
    /// The hash accelerator is probed first when present; it only covers
    /// the dynamic table, so `.dynsym` and `.symtab` are still scanned
    /// linearly afterwards for locals and for images without `.hash`.
    pub fn find_symbol_by_name(&self, name: &str) -> Result<Option<(Symbol, String)>>
    {
        if let Some(hash) = &self.hash {
            if let Some(found) = hash.find(name) {
                return Ok(Some(found));
            }
        }
        for table in [".dynsym", ".symtab"] {
            if let Some(iter) = self.symbols(table)? {
                for (sym, candidate) in iter {
                    if candidate == name {
                        return Ok(Some((sym, candidate)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Find the symbol that represents a particular address.
    ///
    /// If no symbol's sized range includes the target we accept the symbol
    /// with the highest value not above it, which matches the dynamic
    /// "stubs" in code. A side effect is a few false positives: a
    /// stripped, dynamically linked executable will typically report
    /// functions as `_init`, because it is the only symbol in the image
    /// and it has no size.
    pub fn find_symbol_by_address(&self, addr: u64, kind: Option<u8>) -> Result<Option<SymbolMatch>>
    {
        let mut stub: Option<SymbolMatch> = None;
        let mut lowest = 0u64;

        for table in [".symtab", ".dynsym"] {
            let Some(section) = self.get_section(table, None) else {
                continue;
            };
            if section.header().sh_type == SHT_NOBITS {
                continue;
            }
            let owner = section.object;
            for (sym, name) in SymbolIter::new(owner, section.index)? {
                if sym.st_shndx >= SHN_LORESERVE || (sym.st_shndx as usize) >= owner.sections.len() {
                    continue;
                }
                let shdr = &owner.sections[sym.st_shndx as usize];
                if shdr.sh_flags & SHF_ALLOC == 0 {
                    continue;
                }
                if let Some(kind) = kind {
                    if kind != STT_NOTYPE && sym.kind() != kind {
                        continue;
                    }
                }
                if sym.st_value > addr {
                    continue;
                }
                if sym.st_size != 0 {
                    if sym.st_value + sym.st_size > addr {
                        trace!("{addr:#x}: exact symbol {name}");
                        return Ok(Some(SymbolMatch {
                            symbol: sym,
                            name,
                            exact: true,
                        }));
                    }
                } else if lowest < sym.st_value {
                    lowest = sym.st_value;
                    stub = Some(SymbolMatch {
                        symbol: sym,
                        name,
                        exact: false,
                    });
                }
            }
        }
        Ok(stub)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn sysv_hash_small_inputs()
    {
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("a"), 97);
        assert_eq!(elf_hash("ab"), (97 << 4) + 98);
    }

    #[test]
    fn sysv_hash_spreads()
    {
        let names = ["main", "_init", "_ZTV1C", "printf", "pause"];
        let mut hashes: Vec<u32> = names.iter().map(|n| elf_hash(n)).collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(hashes.len(), names.len());
    }
}
