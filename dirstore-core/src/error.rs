//! Error types shared by the dirstore crates.

use thiserror::Error;

/// Errors produced by core types and store implementations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A name string could not be parsed or normalized.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// A serialized value could not be decoded.
    #[error("corrupt value: {0}")]
    CorruptValue(String),

    /// Store-level failure (engine or I/O inside the backend).
    #[error("store error: {0}")]
    Store(String),

    /// Raw I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
