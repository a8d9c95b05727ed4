//! Loaded-object discovery through the runtime linker's rendezvous.
//!
//! The executable's `PT_DYNAMIC` segment carries a `DT_DEBUG` tag whose
//! value the linker points at its `r_debug` structure at startup; from
//! there the link-map list enumerates every object in the process with its
//! load base and path. All of it is read through the target address space,
//! since the values only exist at runtime.

use tracing::{debug, trace};

use crate::elf::defs::{Encoding, DT_DEBUG, DT_NULL};
use crate::elf::ElfObject;
use crate::error::Result;
use crate::reader::Reader;

/// One link-map entry: load base and path of a shared object.
#[derive(Debug, Clone)]
pub(super) struct MapEntry
{
    pub l_addr: u64,
    pub name: String,
}

/// Dynamic entries scanned before giving up on `DT_DEBUG`.
const MAX_DYNAMIC_ENTRIES: usize = 1024;
/// Link-map entries walked before assuming a corrupt list.
const MAX_LINK_MAP_ENTRIES: usize = 4096;

fn read_word(space: &dyn Reader, va: u64, enc: Encoding) -> Result<u64>
{
    let size = enc.word_size();
    let mut buf = [0u8; 8];
    space.read_exact_at(va, &mut buf[..size])?;
    let mut v = [0u8; 8];
    if enc.little {
        v[..size].copy_from_slice(&buf[..size]);
        Ok(u64::from_le_bytes(v))
    } else {
        v[8 - size..].copy_from_slice(&buf[..size]);
        Ok(u64::from_be_bytes(v))
    }
}

/// Walk the rendezvous of `exec` (loaded at bias `exec_bias`) through
/// `space`. Returns the link-map entries in list order; the caller opens
/// and attaches them.
pub(super) fn discover(exec: &ElfObject, exec_bias: u64, space: &dyn Reader) -> Result<Vec<MapEntry>>
{
    let enc = exec.encoding();
    let ws = enc.word_size() as u64;
    let Some(dynamic) = exec.dynamic_segment() else {
        debug!("{}: no PT_DYNAMIC, statically linked?", exec.describe());
        return Ok(Vec::new());
    };

    // Find DT_DEBUG among the in-memory dynamic entries; the on-disk copy
    // holds a zero that the linker fills in at startup.
    let mut r_debug = 0u64;
    let mut entry_va = dynamic.p_vaddr.wrapping_add(exec_bias);
    for _ in 0..MAX_DYNAMIC_ENTRIES {
        let tag = read_word(space, entry_va, enc)? as i64;
        let value = read_word(space, entry_va + ws, enc)?;
        if tag == DT_NULL {
            break;
        }
        if tag == DT_DEBUG {
            r_debug = value;
            break;
        }
        entry_va += ws * 2;
    }
    if r_debug == 0 {
        debug!("{}: no rendezvous (DT_DEBUG unset)", exec.describe());
        return Ok(Vec::new());
    }

    // r_debug: int r_version, then the r_map pointer at the next word.
    let mut map = read_word(space, r_debug + ws, enc)?;
    let mut entries = Vec::new();
    for _ in 0..MAX_LINK_MAP_ENTRIES {
        if map == 0 {
            return Ok(entries);
        }
        // link_map: l_addr, l_name, l_ld, l_next, l_prev.
        let l_addr = read_word(space, map, enc)?;
        let l_name = read_word(space, map + ws, enc)?;
        let l_next = read_word(space, map + ws * 3, enc)?;
        let name = if l_name == 0 {
            String::new()
        } else {
            space.read_string_at(l_name).unwrap_or_default()
        };
        trace!("link map entry {name} at {l_addr:#x}");
        entries.push(MapEntry { l_addr, name });
        map = l_next;
    }
    debug!("link map of {} truncated at {MAX_LINK_MAP_ENTRIES} entries", exec.describe());
    Ok(entries)
}
