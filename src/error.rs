//! Error kinds surfaced at the tool boundary.
//!
//! Inside the engine most failures are modelled as data instead: undefined instructions,
//! unknown branch targets and orphaned pending jumps all flow through the normal types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoverError {
    /// Only the ARM instruction set is accepted.
    #[error("unsupported instruction set: {0}")]
    UnsupportedInstructionSet(String),

    /// A disassembly line or corruption descriptor entry could not be understood.
    #[error("malformed input at line {line}: {reason}")]
    MalformedInput { line: usize, reason: String },

    /// An internal invariant was violated. Debug builds assert instead; release builds
    /// clamp where possible and only surface this when no clamp exists.
    #[error("impossible state: {0}")]
    ImpossibleState(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed corruption descriptor: {0}")]
    Descriptor(#[from] serde_json::Error),
}
