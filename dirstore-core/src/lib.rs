//! # dirstore-core
//!
//! Shared vocabulary for the dirstore directory backend:
//!
//! - Hierarchical entry names ([`Dn`]) and the sorted-name key encoding
//! - Entries and entry identities ([`Entry`], [`EntryId`])
//! - Index identification ([`IndexKey`], [`IndexKind`])
//! - Posting lists ([`IdSet`]) with the defined/undefined spill rule
//! - The attribute indexer registry ([`IndexerRegistry`])
//! - The key-value store contracts consumed by the bulk importer
//!   ([`Backend`], [`Container`], [`IndexStore`])

pub mod backend;
pub mod dn;
pub mod entry;
pub mod error;
pub mod idset;
pub mod index;
pub mod schema;

pub use backend::{Backend, BackendStats, Container, IndexCursor, IndexStore};
pub use dn::Dn;
pub use entry::{Entry, EntryId};
pub use error::{CoreError, Result};
pub use idset::IdSet;
pub use index::{IndexKey, IndexKind};
pub use schema::{AttributeIndexSpec, IndexerRegistry, PRESENCE_KEY};
