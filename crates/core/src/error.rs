use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the discovery and decoding engine.
///
/// Most of these are per-candidate conditions: the drivers log them and move
/// on to the next candidate. Only `PatternMatchFailure`, `MissingInputFile`
/// and `Rule` end a run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The address is not inside any known function.
    #[error("No function at 0x{0:X}")]
    NoFunction(u64),

    /// Byte extraction was requested before the string size was computed.
    #[error("Size was never calculated")]
    SizeUnknown,

    /// No terminator was found after the string start.
    #[error("No terminator found after 0x{0:X}")]
    TerminatorNotFound(u64),

    /// The host could not read the requested byte range.
    #[error("Unable to read {len} bytes at 0x{address:X}")]
    Unreadable { address: u64, len: usize },

    /// The rule did not match the binary at all.
    #[error("The provided rule failed to match")]
    PatternMatchFailure,

    /// The operation has no meaning for this kind of string (e.g. stack strings).
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The input file recorded by the host could not be located.
    #[error("Unable to locate the input file: {0}")]
    MissingInputFile(PathBuf),

    /// The rule text could not be compiled.
    #[error("Rule error: {0}")]
    Rule(String),

    /// The binary image could not be loaded or scanned.
    #[error("Image error: {0}")]
    Image(String),
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
