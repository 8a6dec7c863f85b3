//! Source locations and the source map.
//!
//! The back end tracks the original source location of each lowered
//! construct and stamps every bytecode instruction with the location that
//! was on top of the location stack when it was emitted. After linking, the
//! collected annotations are rendered as a text source map with one line per
//! 1-indexed instruction position.

use core::fmt;
use std::sync::Arc;

/// A source location: file, 1-based line and column.
///
/// The default location uses an empty file name and zeroed coordinates and
/// stands for "unknown"; it is attached to instructions that have no source
/// counterpart, such as linker-synthesized prologue code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loc {
    /// Name of the source file.
    pub file: Arc<str>,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub col: u32,
}

impl Loc {
    /// Create a new source location.
    pub fn new(file: impl Into<Arc<str>>, line: u32, col: u32) -> Self {
        Self {
            file: file.into(),
            line,
            col,
        }
    }

    /// The unknown location.
    pub fn unknown() -> Self {
        Self {
            file: Arc::from(""),
            line: 0,
            col: 0,
        }
    }

    /// Is this the unknown location?
    pub fn is_unknown(&self) -> bool {
        self.file.is_empty() && self.line == 0 && self.col == 0
    }
}

impl Default for Loc {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "@-")
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.col)
        }
    }
}

/// Accumulates one source-map entry per emitted bytecode instruction.
///
/// Instruction positions are 1-indexed in the rendered text; instructions
/// with no source annotation produce an empty line.
#[derive(Default)]
pub struct SourceMapBuilder {
    entries: Vec<Option<(Loc, String)>>,
}

impl SourceMapBuilder {
    /// Create an empty source map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the annotation for the next emitted instruction.
    pub fn push(&mut self, loc: &Loc, function: &str) {
        if loc.is_unknown() {
            self.entries.push(None);
        } else {
            self.entries.push(Some((loc.clone(), function.to_string())));
        }
    }

    /// Number of instructions recorded so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no instructions have been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the source map as text: `<file>,<line>,<col>,<function>` per
    /// instruction position, empty lines for unannotated positions.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                Some((loc, function)) => {
                    out.push_str(&format!("{},{},{},{}\n", loc.file, loc.line, loc.col, function));
                }
                None => out.push('\n'),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Loc::unknown().to_string(), "@-");
        assert_eq!(Loc::new("main.sb", 3, 7).to_string(), "main.sb:3:7");
    }

    #[test]
    fn render_skips_unannotated_positions() {
        let mut map = SourceMapBuilder::new();
        map.push(&Loc::unknown(), "main");
        map.push(&Loc::new("a.sb", 1, 2), "main");
        map.push(&Loc::unknown(), "main");
        assert_eq!(map.render(), "\na.sb,1,2,main\n\n");
    }
}
