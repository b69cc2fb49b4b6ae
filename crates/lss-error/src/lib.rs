#![forbid(unsafe_code)]
//! Error types for LSS.
//!
//! Defines `LssError` and a `Result<T>` alias used throughout the
//! workspace. Errors here are unrecoverable from the engine's point of
//! view: the file is the single source of truth and no operation is
//! retried. The front-end decides whether an error aborts the process
//! or is returned to the caller.

use lss_types::ParseError;
use thiserror::Error;

/// Unified error type for all LSS operations.
#[derive(Debug, Error)]
pub enum LssError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt metadata at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no valid metablock found")]
    NoValidMetablock,

    #[error("operation cancelled")]
    Cancelled,

    #[error("no space left in file for {0}")]
    NoSpace(&'static str),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Result alias using `LssError`.
pub type Result<T> = std::result::Result<T, LssError>;
