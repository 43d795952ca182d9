//! Import configuration.

use crate::error::{ImportError, Result};
use dirstore_core::Dn;
use std::path::PathBuf;
use std::time::Duration;

/// Minimum memory the import refuses to start below.
pub const MIN_IMPORT_MEMORY: u64 = 16 * MB;

/// Sort-buffer size clamp.
pub const MIN_BUFFER_SIZE: usize = 100 * 1024;
pub const MAX_BUFFER_SIZE: usize = 48 * MB as usize;

/// Store-cache sizing bounds.
pub const MIN_STORE_CACHE: u64 = 16 * MB;
pub const MAX_STORE_CACHE: u64 = 128 * MB;

/// Upper bound on the store's transaction-log buffer.
pub const MAX_LOG_BUFFER: u64 = 100 * MB;

/// Phase-2 read-ahead cache floor.
pub const MIN_READ_AHEAD_CACHE: usize = 4096;

/// Share of the memory budget granted to each phase.
pub const PHASE_ONE_MEM_PCT: u64 = 45;
pub const PHASE_TWO_MEM_PCT: u64 = 50;

/// Interval between progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Memory budget assumed when none is configured.
pub const DEFAULT_MEMORY_BUDGET: u64 = 512 * MB;

const MB: u64 = 1024 * 1024;

/// Configuration for one bulk import run.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Worker thread count. `None` means twice the available cores.
    pub thread_count: Option<usize>,

    /// Directory for per-index spill files. Created (and emptied) up front,
    /// removed on success.
    pub temp_dir: PathBuf,

    /// Skip parent-existence and duplicate checks during Phase 1; the
    /// naming merger reconstructs parent/child relationships in Phase 2.
    pub skip_name_validation: bool,

    /// Keep existing container contents instead of rebuilding.
    pub append_to_existing: bool,

    /// With `append_to_existing`: entries whose name already exists replace
    /// the old entry (old index keys are deleted, the EntryID is reused).
    pub replace_existing_entries: bool,

    /// Clear every target container before importing.
    pub clear_backend: bool,

    /// Base names to rebuild from the entry stream; everything outside them
    /// is migrated from the existing store.
    pub include_branches: Vec<Dn>,

    /// Base names excluded from the rebuild; survivors under them are
    /// migrated from the existing store.
    pub exclude_branches: Vec<Dn>,

    /// When set, Phase 2 carves its per-merger read-ahead caches out of a
    /// single slab of this many bytes instead of allocating per merger.
    pub direct_buffer_size: Option<usize>,

    /// Total memory budget the planner divides between sort buffers, the
    /// store cache, and the log buffer.
    pub memory_budget_bytes: u64,

    /// Progress report interval.
    pub progress_interval: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            temp_dir: std::env::temp_dir().join("dirstore-import"),
            skip_name_validation: false,
            append_to_existing: false,
            replace_existing_entries: false,
            clear_backend: false,
            include_branches: Vec::new(),
            exclude_branches: Vec::new(),
            direct_buffer_size: None,
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            progress_interval: PROGRESS_INTERVAL,
        }
    }
}

impl ImportConfig {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    pub fn with_skip_name_validation(mut self, skip: bool) -> Self {
        self.skip_name_validation = skip;
        self
    }

    pub fn with_append(mut self, append: bool, replace_existing: bool) -> Self {
        self.append_to_existing = append;
        self.replace_existing_entries = replace_existing;
        self
    }

    pub fn with_clear_backend(mut self, clear: bool) -> Self {
        self.clear_backend = clear;
        self
    }

    pub fn with_include_branches(mut self, branches: Vec<Dn>) -> Self {
        self.include_branches = branches;
        self
    }

    pub fn with_exclude_branches(mut self, branches: Vec<Dn>) -> Self {
        self.exclude_branches = branches;
        self
    }

    pub fn with_direct_buffer_size(mut self, bytes: usize) -> Self {
        self.direct_buffer_size = Some(bytes);
        self
    }

    pub fn with_memory_budget_bytes(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Worker count after applying the auto default.
    pub fn effective_thread_count(&self) -> usize {
        match self.thread_count {
            Some(n) => n,
            None => {
                2 * std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            }
        }
    }

    /// Reject contradictory configurations before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == Some(0) {
            return Err(ImportError::Config("thread count must be at least 1".into()));
        }
        if self.replace_existing_entries && !self.append_to_existing {
            return Err(ImportError::Config(
                "replace-existing-entries requires append-to-existing".into(),
            ));
        }
        if self.skip_name_validation && self.append_to_existing {
            return Err(ImportError::Config(
                "skip-name-validation cannot be combined with append-to-existing: \
                 merge-time reconstruction would overwrite posting lists it never saw"
                    .into(),
            ));
        }
        if self.append_to_existing && !self.include_branches.is_empty() {
            return Err(ImportError::Config(
                "include-branches cannot be combined with append-to-existing".into(),
            ));
        }
        for exc in &self.exclude_branches {
            if self.include_branches.iter().any(|inc| inc == exc) {
                return Err(ImportError::Config(format!(
                    "branch {} is both included and excluded",
                    exc
                )));
            }
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(ImportError::Config("temp directory not set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(ImportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = ImportConfig::default().with_thread_count(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replace_requires_append() {
        let mut config = ImportConfig::default();
        config.replace_existing_entries = true;
        assert!(config.validate().is_err());
        config.append_to_existing = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_skip_validation_append_conflict() {
        let config = ImportConfig::default()
            .with_skip_name_validation(true)
            .with_append(true, false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overlapping_include_exclude_rejected() {
        let branch = Dn::parse("ou=a,o=x").unwrap();
        let config = ImportConfig::default()
            .with_include_branches(vec![branch.clone()])
            .with_exclude_branches(vec![branch]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_thread_count() {
        assert_eq!(
            ImportConfig::default()
                .with_thread_count(3)
                .effective_thread_count(),
            3
        );
        assert!(ImportConfig::default().effective_thread_count() >= 2);
    }
}
