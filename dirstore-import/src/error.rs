//! Import error taxonomy.
//!
//! Per-entry problems (duplicates, missing parents, malformed entries) are
//! *not* errors: they become rejection counts and the import continues.
//! Everything here is non-recoverable for the run as a whole.

use thiserror::Error;

/// Errors that terminate an import.
#[derive(Error, Debug)]
pub enum ImportError {
    /// Bad configuration, detected before Phase 1 starts.
    #[error("invalid import configuration: {0}")]
    Config(String),

    /// Insufficient memory or temp-space to run at all.
    #[error("insufficient resources: {0}")]
    Resource(String),

    /// Engine failure in the target or source store.
    #[error("store error: {0}")]
    Store(#[from] dirstore_core::CoreError),

    /// I/O failure on spill files.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The import was cancelled externally.
    #[error("import cancelled")]
    Cancelled,

    /// A worker or merge thread panicked.
    #[error("import task panicked: {0}")]
    TaskPanicked(String),
}

/// Result type for import operations.
pub type Result<T> = std::result::Result<T, ImportError>;
