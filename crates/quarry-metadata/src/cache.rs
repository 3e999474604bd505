use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_cache::{Cache, CacheBuilder, CacheEntry, CacheError, EventHook};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::backend::MetadataBackend;
use crate::types::{SourceHandle, SourceMetadata, TableMetadata, TableRef};

/// Seeds the finer-grained caches when a source's metadata is filled.
///
/// A [`SourceMetadata`] already contains the metadata of every table in the
/// source, so a single source fetch can satisfy later per-table and
/// table-name lookups without further round-trips. Priming never overwrites:
/// a table entry that was already fetched directly keeps its original result.
/// Failed fills are not propagated.
struct PropagateSourceFill {
    table_meta: Arc<Cache<TableRef, Arc<TableMetadata>>>,
    table_names: Arc<Cache<SourceHandle, Arc<Vec<String>>>>,
}

#[async_trait]
impl EventHook<SourceHandle, Arc<SourceMetadata>> for PropagateSourceFill {
    async fn on_event(
        &self,
        token: &CancellationToken,
        _cache: &Cache<SourceHandle, Arc<SourceMetadata>>,
        handle: &SourceHandle,
        entry: Option<&CacheEntry<Arc<SourceMetadata>>>,
    ) {
        let Some(Ok(source)) = entry else { return };

        for table in &source.tables {
            let tbl = TableRef::new(handle.clone(), table.name.clone());
            self.table_meta
                .set(token, &tbl, Ok(Arc::new(table.clone())))
                .await;
        }
        self.table_names
            .set(token, handle, Ok(Arc::new(source.table_names())))
            .await;
    }
}

/// A composite cache over the metadata of a collection of sources.
///
/// One fill-once cache per entity type — source metadata, table metadata, and
/// table-name lists — all backed by the same [`MetadataBackend`]. Filling a
/// source's entry propagates its tables into the sibling caches, so the
/// common "inspect a source, then drill into its tables" flow costs a single
/// backend round-trip.
///
/// All returned values are shared references into the cache; callers that
/// need to mutate a result must clone it first.
#[derive(Debug)]
pub struct MetadataCache {
    source_meta: Arc<Cache<SourceHandle, Arc<SourceMetadata>>>,
    table_meta: Arc<Cache<TableRef, Arc<TableMetadata>>>,
    table_names: Arc<Cache<SourceHandle, Arc<Vec<String>>>>,
}

impl MetadataCache {
    /// Wraps `backend` with a caching layer.
    pub fn new(backend: Arc<dyn MetadataBackend>) -> Self {
        let table_meta = Arc::new(
            CacheBuilder::new()
                .name("table-meta")
                .log(Level::TRACE, &[])
                .build({
                    let backend = Arc::clone(&backend);
                    move |token, table: TableRef| {
                        let backend = Arc::clone(&backend);
                        Box::pin(async move { backend.table_metadata(&token, &table).await })
                    }
                }),
        );

        let table_names = Arc::new(
            CacheBuilder::new()
                .name("table-names")
                .log(Level::TRACE, &[])
                .build({
                    let backend = Arc::clone(&backend);
                    move |token, handle: SourceHandle| {
                        let backend = Arc::clone(&backend);
                        Box::pin(async move { backend.table_names(&token, &handle).await })
                    }
                }),
        );

        let source_meta = Arc::new(
            CacheBuilder::new()
                .name("source-meta")
                .log(Level::TRACE, &[])
                .on_fill(PropagateSourceFill {
                    table_meta: Arc::clone(&table_meta),
                    table_names: Arc::clone(&table_names),
                })
                .build({
                    let backend = Arc::clone(&backend);
                    move |token, handle: SourceHandle| {
                        let backend = Arc::clone(&backend);
                        Box::pin(async move { backend.source_metadata(&token, &handle).await })
                    }
                }),
        );

        MetadataCache {
            source_meta,
            table_meta,
            table_names,
        }
    }

    /// Returns the metadata for the source identified by `handle`.
    pub async fn source_meta(
        &self,
        token: &CancellationToken,
        handle: &SourceHandle,
    ) -> CacheEntry<Arc<SourceMetadata>> {
        self.source_meta.get(token, handle).await
    }

    /// Returns the metadata for `table`.
    pub async fn table_meta(
        &self,
        token: &CancellationToken,
        table: &TableRef,
    ) -> CacheEntry<Arc<TableMetadata>> {
        self.table_meta.get(token, table).await
    }

    /// Returns the table names for the source identified by `handle`.
    pub async fn table_names(
        &self,
        token: &CancellationToken,
        handle: &SourceHandle,
    ) -> CacheEntry<Arc<Vec<String>>> {
        self.table_names.get(token, handle).await
    }

    /// Returns the metadata for `tbl1` and `tbl2`, fetching concurrently
    /// when neither is resident.
    pub async fn table_meta_pair(
        &self,
        token: &CancellationToken,
        tbl1: &TableRef,
        tbl2: &TableRef,
    ) -> Result<(Arc<TableMetadata>, Arc<TableMetadata>), CacheError> {
        tbl1.validate()?;
        tbl2.validate()?;
        pair_get(&self.table_meta, token, tbl1, tbl2).await
    }

    /// Returns the metadata for the sources identified by `h1` and `h2`,
    /// fetching concurrently when neither is resident.
    pub async fn source_meta_pair(
        &self,
        token: &CancellationToken,
        h1: &SourceHandle,
        h2: &SourceHandle,
    ) -> Result<(Arc<SourceMetadata>, Arc<SourceMetadata>), CacheError> {
        h1.validate()?;
        h2.validate()?;
        pair_get(&self.source_meta, token, h1, h2).await
    }

    /// Clears all cached metadata. Entries filled afterwards are fetched
    /// afresh from the backend.
    pub async fn clear(&self, token: &CancellationToken) {
        self.table_meta.clear(token).await;
        self.table_names.clear(token).await;
        self.source_meta.clear(token).await;
    }
}

/// Fetches a pair of keys from one cache.
///
/// If at least one key is resident there is no need for a parallel scope:
/// the resident one returns quickly from the cache, and the other does the
/// long fetch from the backend. If neither is resident, both are fetched
/// concurrently under a child cancellation scope; the first branch to fail
/// cancels the scope so the sibling stops promptly.
async fn pair_get<K, V>(
    cache: &Cache<K, V>,
    token: &CancellationToken,
    key1: &K,
    key2: &K,
) -> Result<(V, V), CacheError>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    if cache.has(key1) || cache.has(key2) {
        let first = cache.get(token, key1).await;
        let second = cache.get(token, key2).await;
        return zip(first, second);
    }

    let scope = token.child_token();
    let (first, second) = tokio::join!(
        cancel_on_err(&scope, cache.get(&scope, key1)),
        cancel_on_err(&scope, cache.get(&scope, key2)),
    );
    zip(first, second)
}

async fn cancel_on_err<V>(
    scope: &CancellationToken,
    get: impl Future<Output = CacheEntry<V>>,
) -> CacheEntry<V> {
    let entry = get.await;
    if entry.is_err() {
        scope.cancel();
    }
    entry
}

fn zip<V>(first: CacheEntry<V>, second: CacheEntry<V>) -> Result<(V, V), CacheError> {
    match (first, second) {
        (Ok(v1), Ok(v2)) => Ok((v1, v2)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        // The branch that genuinely failed leads; the sibling's induced
        // cancellation is secondary.
        (Err(CacheError::Canceled), Err(e2)) if e2 != CacheError::Canceled => {
            Err(e2.combine(CacheError::Canceled))
        }
        (Err(e1), Err(e2)) => Err(e1.combine(e2)),
    }
}
