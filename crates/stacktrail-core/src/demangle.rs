//! Symbol demangling helpers.
//!
//! Frame names pass through `rustc-demangle`, which understands both the
//! legacy `_ZN...` and the v0 `_R...` schemes. C++ Itanium names (vtables
//! included) stay raw; the scanner reports them as the compiler spelled
//! them, which is what one greps a binary for anyway.

use rustc_demangle::try_demangle;

use crate::types::SymbolName;

/// Wrap a raw symbol string, attaching a demangled form when the mangling
/// is recognised.
pub(crate) fn make_symbol_name(raw: String) -> SymbolName
{
    let demangled = try_demangle(&raw).ok().map(|d| d.to_string());
    SymbolName { raw, demangled }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn plain_c_symbols_stay_raw()
    {
        let name = make_symbol_name("pause".into());
        assert_eq!(name.display_name(), "pause");
        assert!(name.demangled.is_none());
    }

    #[test]
    fn legacy_rust_symbols_demangle()
    {
        let name = make_symbol_name("_ZN4core3ptr13drop_in_place17h1234567890abcdefE".into());
        assert!(name.demangled.is_some());
        assert!(name.display_name().contains("drop_in_place"));
    }
}
