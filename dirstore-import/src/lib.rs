//! # dirstore-import
//!
//! Two-phase bulk import engine for the dirstore directory backend.
//! Rebuilding a backend through the transactional write path is orders of
//! magnitude too slow for snapshot files with millions of entries; this
//! crate reshapes the problem as an external merge-sort followed by a
//! bulk load of sorted runs into each index.
//!
//! **Phase 1** — worker threads parse entries off the shared source,
//! derive the keys for every index (naming, children, subtree, and the
//! per-attribute equality/presence/substring/ordering/approximate
//! indexes), and append records into bounded sort buffers. Full buffers
//! are sorted by an executor pool and drained by per-index spill writers
//! into sorted run files.
//!
//! **Phase 2** — each index's runs are k-way merged; duplicate keys
//! aggregate into posting lists (spilling to the UNDEFINED marker past
//! the index entry limit) and are bulk-inserted into the store. When
//! Phase 1 skipped name validation, a specialised naming merger
//! reconstructs the parent/child posting lists from the sorted name
//! order.
//!
//! Imported indexes stay marked not-trusted until the run commits; a
//! crashed or cancelled import is restarted from scratch.
//!
//! ```no_run
//! use dirstore_core::{AttributeIndexSpec, Dn, IndexerRegistry};
//! use dirstore_import::{ImportConfig, Importer, VecEntrySource};
//! use dirstore_memory::MemoryBackend;
//!
//! # fn main() -> dirstore_import::Result<()> {
//! let mut registry = IndexerRegistry::new();
//! registry.register("cn", AttributeIndexSpec::eq_presence());
//!
//! let backend = MemoryBackend::new();
//! backend.create_suffix(&Dn::parse("o=example").unwrap(), &registry)?;
//!
//! let source = VecEntrySource::new(entries_from_somewhere());
//! let importer = Importer::new(ImportConfig::new("/tmp/import-tmp"))?;
//! let summary = importer.run(&backend, &source, &registry)?;
//! println!("loaded {} entries", summary.entries_loaded);
//! # Ok(())
//! # }
//! # fn entries_from_somewhere() -> Vec<dirstore_core::Entry> { Vec::new() }
//! ```

pub mod config;
pub mod dn_merge;
pub mod error;
pub mod importer;
pub mod memory;
pub mod merge;
pub mod migrate;
pub mod progress;
pub mod run_file;
pub mod sort_buffer;
pub mod sorter;
pub mod source;
pub mod spill;
pub mod stats;
pub mod suffix;
pub mod worker;

pub use config::ImportConfig;
pub use error::{ImportError, Result};
pub use importer::{ImportSummary, Importer};
pub use source::{EntrySource, VecEntrySource};
pub use stats::ImportStats;
