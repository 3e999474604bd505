//! # Source metadata caching for quarry
//!
//! Reading metadata out of a data source — schemas, tables, columns, row
//! counts — is slow: it means opening a connection or ingesting a file, and
//! the same entities are requested over and over while rendering query
//! results or diffing sources. This crate caches that metadata for the
//! duration of a run.
//!
//! [`MetadataCache`] composes three fill-once caches from
//! [`quarry_cache`], one per entity type, in front of a single
//! [`MetadataBackend`]. Filling a source's metadata propagates the tables it
//! already contains into the per-table and table-name caches, so drilling
//! into a source after inspecting it costs no further round-trips. For
//! operations that need two entities at once (diffing two tables or two
//! sources), the `*_pair` methods fetch both concurrently when neither is
//! cached, under a shared cancellation scope.
//!
//! Nothing here expires or evicts on its own: this is a per-run memoization
//! layer, cleared as a whole via [`MetadataCache::clear`].

mod backend;
mod cache;
mod types;


pub use backend::MetadataBackend;
pub use cache::MetadataCache;
pub use types::{ColumnMetadata, SourceHandle, SourceMetadata, TableMetadata, TableRef};
