//! Result and error types representing the outcome of compiling a program.

use crate::srcmap::Loc;
use thiserror::Error;

/// An error produced while generating bytecode.
///
/// The back end recovers from nothing: the first error aborts the current
/// compilation and is propagated to the caller. Errors that originate inside
/// a function body carry the source location that was active on the
/// source-map stack when the offending construct was lowered.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// An operand does not fit the opcode family it is used with.
    ///
    /// The type checker should have rejected the program before it reached
    /// the back end; this error re-asserts the rules the instruction set
    /// cares about, e.g. loading a function address into an 8-bit register.
    #[error("type error at {loc}: {message}")]
    Type {
        /// Explanation of the broken rule.
        message: String,
        /// Where the offending construct was written.
        loc: Loc,
    },

    /// A name or value could not be resolved to a unique meaning: duplicate
    /// enum values, a struct deconstruction that exhausts all fields, or a
    /// duplicate global registration.
    #[error("resolution error at {loc}: {message}")]
    Resolution {
        /// Explanation of the conflict.
        message: String,
        /// Where the offending construct was written.
        loc: Loc,
    },

    /// Register allocation failed even after spilling everything that can
    /// be spilled.
    #[error("function `{0}` is too complex: out of registers and spill candidates")]
    FunctionTooComplex(String),

    /// An internal invariant of the instruction encoder was broken, e.g. an
    /// operand count mismatch against the opcode schema or an immediate
    /// that does not fit its declared width.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A label site was never given a resolved offset by the time the
    /// linker ran its patch pass.
    #[error("unresolved label `{0}` after linking")]
    UnresolvedLabel(String),

    /// The image or source map could not be written out.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` that uses [`CodegenError`].
pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    /// Shorthand for a [`CodegenError::Type`] error.
    pub fn ty(message: impl Into<String>, loc: &Loc) -> Self {
        Self::Type {
            message: message.into(),
            loc: loc.clone(),
        }
    }

    /// Shorthand for a [`CodegenError::Resolution`] error.
    pub fn resolution(message: impl Into<String>, loc: &Loc) -> Self {
        Self::Resolution {
            message: message.into(),
            loc: loc.clone(),
        }
    }
}
