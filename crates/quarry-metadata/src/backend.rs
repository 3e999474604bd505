use std::sync::Arc;

use async_trait::async_trait;
use quarry_cache::CacheEntry;
use tokio_util::sync::CancellationToken;

use crate::types::{SourceHandle, SourceMetadata, TableMetadata, TableRef};

/// The slow backing metadata source the cache sits in front of.
///
/// Implementations own connections, drivers, and file readers; all of that is
/// opaque here. Methods must tolerate concurrent invocation for distinct
/// keys — the cache guarantees each key is fetched at most once. A method
/// noticing that `token` fired is expected to return promptly, typically with
/// [`CacheError::Canceled`](quarry_cache::CacheError::Canceled).
///
/// A missing entity is reported as
/// [`CacheError::NotFound`](quarry_cache::CacheError::NotFound), which the
/// cache stores as an ordinary, valid outcome.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Reads the full metadata for the source identified by `handle`.
    async fn source_metadata(
        &self,
        token: &CancellationToken,
        handle: &SourceHandle,
    ) -> CacheEntry<Arc<SourceMetadata>>;

    /// Reads the metadata for a single table.
    async fn table_metadata(
        &self,
        token: &CancellationToken,
        table: &TableRef,
    ) -> CacheEntry<Arc<TableMetadata>>;

    /// Lists the table names in the source identified by `handle`.
    async fn table_names(
        &self,
        token: &CancellationToken,
        handle: &SourceHandle,
    ) -> CacheEntry<Arc<Vec<String>>>;
}
