//! Stack frame and symbol annotation types.

use std::fmt;

use super::Address;

/// Symbol name as found in the image, with a demangled form when one of the
/// demanglers recognises the mangling scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolName
{
    /// Raw (possibly mangled) name from the symbol or string table.
    pub raw: String,
    /// Demangled rendition, when available.
    pub demangled: Option<String>,
}

impl SymbolName
{
    pub fn display_name(&self) -> &str
    {
        self.demangled.as_deref().unwrap_or(&self.raw)
    }
}

impl fmt::Display for SymbolName
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(self.display_name())
    }
}

/// Source file/line/column resolved from the line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation
{
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

/// The `(object, symbol, offset, source-line)` annotation of a frame.
#[derive(Debug, Clone)]
pub struct ResolvedSymbol
{
    /// Describe-string of the loaded object containing the PC.
    pub object: String,
    /// Best-effort symbol; `None` renders as `??`.
    pub name: Option<SymbolName>,
    /// Offset of the PC from the symbol's start (0 when no symbol).
    pub offset: u64,
    /// Best-effort source location.
    pub location: Option<SourceLocation>,
}

/// One frame of an unwound call stack.
///
/// Frames are produced innermost first as a lazy sequence; see
/// [`crate::unwind::FrameIter`].
#[derive(Debug, Clone)]
pub struct Frame
{
    /// Program counter of this frame. For caller frames this is the return
    /// address, i.e. one past the call site.
    pub pc: Address,
    /// Stack pointer on entry to this frame.
    pub sp: Address,
    /// Frame pointer, where the CFI reveals one.
    pub fp: Option<Address>,
    /// Symbolic annotation, when any loaded object covers the PC.
    pub symbol: Option<ResolvedSymbol>,
}
