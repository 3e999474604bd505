use thiserror::Error;

/// An error associated with a cache entry.
///
/// This error enum is intended for storing in cache entries: whatever the
/// backing fetch produced is kept verbatim and replayed on every subsequent
/// [`Cache::get`](crate::Cache::get) for that key, until the entry is
/// evicted. The only variant that is never stored is
/// [`InvalidInput`](Self::InvalidInput), which is raised synchronously before
/// any fetch is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backing entity does not exist.
    ///
    /// This is an ordinary, valid, cached outcome. It is not a cache fault
    /// and is not retried.
    #[error("not found")]
    NotFound,

    /// The fetch was interrupted because the caller's cancellation token
    /// fired.
    ///
    /// Like any other fetch outcome this is stored in the entry and replayed
    /// until the key is deleted. Callers that consider a cancellation
    /// transient must [`delete`](crate::Cache::delete) the key before
    /// retrying.
    #[error("operation canceled")]
    Canceled,

    /// The backing fetch failed.
    ///
    /// The attached string carries the backing error's message.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A malformed key identity was passed to a composite operation.
    ///
    /// This variant is raised before any fetch is attempted and is never
    /// stored in a cache entry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Two independent fetch branches failed.
    ///
    /// Produced by pairwise fetches so that neither underlying cause is
    /// discarded.
    #[error("{0}; {1}")]
    Combined(Box<CacheError>, Box<CacheError>),
}

impl CacheError {
    /// Combines `self` with a second independent error, preserving both.
    pub fn combine(self, other: CacheError) -> CacheError {
        CacheError::Combined(Box::new(self), Box::new(other))
    }
}

/// An entry in a cache, containing either `Ok(V)` or the error the backing
/// fetch produced for the key.
///
/// An errorful entry is a valid, resident entry: it counts as a hit and is
/// replayed as-is until eviction.
pub type CacheEntry<V> = Result<V, CacheError>;
