use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::error::{CacheEntry, CacheError};
use crate::event::{Event, EventHook, Op, QueuePolicy, Sink, log_event};

/// The backing-fetch contract.
///
/// Invoked by [`Cache::get`] to fill an unpopulated entry. The cache
/// guarantees the fetch is invoked at most once per key; it must tolerate
/// concurrent invocation for distinct keys. The token is the one passed to
/// the triggering `get` call; a fetch noticing cancellation is expected to
/// return promptly with an error.
pub type FetchFn<K, V> =
    Box<dyn Fn(CancellationToken, K) -> BoxFuture<'static, CacheEntry<V>> + Send + Sync>;

/// Per-key fill state.
///
/// The [`OnceCell`] is the fill guard: unused while the slot is empty,
/// claimed while a fetch is in flight, and immutable once resolved. A slot
/// detached from the table by eviction keeps functioning for callers that
/// already hold it.
struct Slot<V> {
    cell: OnceCell<CacheEntry<V>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Slot {
            cell: OnceCell::new(),
        }
    }
}

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_name() -> String {
    format!("cache-{}", NAME_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// A concurrency-safe, in-memory, on-demand cache with fill-once, read-many
/// semantics.
///
/// A given entry is populated only once, either implicitly via [`Cache::get`]
/// invoking the fetch fn, or externally via [`Cache::set`]. If multiple
/// callers request the same absent key concurrently, exactly one of them runs
/// the fetch; the others wait and observe the identical result. An entry can
/// be removed via [`Cache::delete`] or [`Cache::clear`], after which it may
/// be populated afresh.
///
/// An entry consists not only of the key and value, but also of any error
/// produced while filling it; see [`CacheEntry`].
///
/// Construct instances via [`CacheBuilder`].
pub struct Cache<K, V> {
    name: Arc<str>,
    entries: Mutex<HashMap<K, Arc<Slot<V>>>>,
    fetch: FetchFn<K, V>,
    on_hit: Vec<Sink<K, V>>,
    on_miss: Vec<Sink<K, V>>,
    on_fill: Vec<Sink<K, V>>,
    on_evict: Vec<Sink<K, V>>,
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V> Cache<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The cache's name, as set via [`CacheBuilder::name`], useful for
    /// logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of entries in the cache, filled or filling.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reports whether an entry exists for `key`, without blocking and
    /// without triggering a fetch.
    ///
    /// A `true` result only guarantees that an entry slot exists; the entry
    /// may still be filling. A caller that needs the value must still call
    /// [`get`](Cache::get), which is low-latency once the entry is filled.
    pub fn has(&self, key: &K) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Returns the value (and fill error) for `key`, fetching it first if
    /// absent.
    ///
    /// If there is no entry for the key, the fetch fn is invoked and its
    /// result stored; concurrent callers for the same key wait for that
    /// single fetch and observe the identical result. The claiming caller
    /// emits [`Op::Miss`] before the fetch and [`Op::Fill`] after it; every
    /// other caller emits [`Op::Hit`]. The triggering call blocks until all
    /// relevant hooks return.
    ///
    /// The fetch result is permanent for the key until eviction — including
    /// errors, and including [`CacheError::Canceled`] when `token` fires
    /// mid-fetch. `get` never retries; callers that want a fresh fetch must
    /// [`delete`](Cache::delete) the key first.
    pub async fn get(&self, token: &CancellationToken, key: &K) -> CacheEntry<V> {
        let slot = self.slot(key);

        let mut claimed = false;
        let entry = slot
            .cell
            .get_or_init(|| {
                claimed = true;
                async move {
                    self.emit(Op::Miss, token, key, None).await;

                    let fetch = (self.fetch)(token.clone(), key.clone());
                    tokio::select! {
                        biased;
                        entry = fetch => entry,
                        _ = token.cancelled() => Err(CacheError::Canceled),
                    }
                }
            })
            .await
            .clone();

        if claimed {
            self.emit(Op::Fill, token, key, Some(&entry)).await;
        } else {
            self.emit(Op::Hit, token, key, Some(&entry)).await;
        }

        entry
    }

    /// Primes the entry for `key` with an externally supplied result.
    ///
    /// If no entry exists, this claims the fill guard directly, as if a fetch
    /// had already completed, and emits [`Op::Fill`]. If an entry already
    /// exists — filled or filling — the call is a no-op and the original
    /// result prevails.
    pub async fn set(&self, token: &CancellationToken, key: &K, entry: CacheEntry<V>) {
        let slot = self.slot(key);
        if slot.cell.set(entry.clone()).is_ok() {
            self.emit(Op::Fill, token, key, Some(&entry)).await;
        }
    }

    /// Removes the entry for `key`, if present, emitting [`Op::Evict`] with
    /// the entry's last known result.
    ///
    /// An in-flight fetch for the key is not canceled: it completes against
    /// the detached entry and still notifies fill hooks, and callers already
    /// waiting on it observe its result. A later `get` for the key starts a
    /// fresh fetch.
    pub async fn delete(&self, token: &CancellationToken, key: &K) {
        let slot = { self.entries.lock().unwrap().remove(key) };
        if let Some(slot) = slot {
            self.emit(Op::Evict, token, key, slot.cell.get()).await;
        }
    }

    /// Removes all entries, emitting one [`Op::Evict`] per entry. The order
    /// across entries is unspecified.
    pub async fn clear(&self, token: &CancellationToken) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().collect()
        };
        for (key, slot) in drained {
            self.emit(Op::Evict, token, &key, slot.cell.get()).await;
        }
    }

    /// Fetches or creates the slot for `key`.
    ///
    /// This is the only place the table lock is taken, and it is released
    /// before any fetch or hook runs, so hooks may re-enter this cache or a
    /// sibling without deadlocking.
    fn slot(&self, key: &K) -> Arc<Slot<V>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.get(key) {
            return Arc::clone(slot);
        }
        let slot = Arc::new(Slot::new());
        entries.insert(key.clone(), Arc::clone(&slot));
        slot
    }

    /// Delivers one transition to every sink registered for `op`, in
    /// registration order.
    async fn emit(&self, op: Op, token: &CancellationToken, key: &K, entry: Option<&CacheEntry<V>>) {
        let sinks = match op {
            Op::Hit => &self.on_hit,
            Op::Miss => &self.on_miss,
            Op::Fill => &self.on_fill,
            Op::Evict => &self.on_evict,
        };

        for sink in sinks {
            match sink {
                Sink::Hook(hook) => hook.on_event(token, self, key, entry).await,
                Sink::Queue { tx, policy } => {
                    let event = self.snapshot(op, key, entry);
                    match policy {
                        QueuePolicy::Block => {
                            let _ = tx.send(event).await;
                        }
                        QueuePolicy::Drop => {
                            let _ = tx.try_send(event);
                        }
                    }
                }
                Sink::Log { level } => log_event(*level, &self.snapshot(op, key, entry)),
            }
        }
    }

    fn snapshot(&self, op: Op, key: &K, entry: Option<&CacheEntry<V>>) -> Event<K, V> {
        Event {
            cache: Arc::clone(&self.name),
            op,
            key: key.clone(),
            entry: entry.cloned(),
        }
    }
}

/// Builder for [`Cache`] instances.
///
/// Hook, queue, and log-sink registration order is fixed here and determines
/// invocation order; it cannot be changed after [`build`](CacheBuilder::build).
pub struct CacheBuilder<K, V> {
    name: Option<String>,
    on_hit: Vec<Sink<K, V>>,
    on_miss: Vec<Sink<K, V>>,
    on_fill: Vec<Sink<K, V>>,
    on_evict: Vec<Sink<K, V>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a builder with no name and no sinks.
    pub fn new() -> Self {
        CacheBuilder {
            name: None,
            on_hit: Vec::new(),
            on_miss: Vec::new(),
            on_fill: Vec::new(),
            on_evict: Vec::new(),
        }
    }

    /// Sets the cache's name. If unset, a name such as `cache-3` is
    /// generated.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Registers a hook invoked when an entry is populated, whether
    /// on-demand via [`Cache::get`] or externally via [`Cache::set`].
    pub fn on_fill(mut self, hook: impl EventHook<K, V> + 'static) -> Self {
        self.on_fill.push(Sink::Hook(Box::new(hook)));
        self
    }

    /// Registers a hook invoked when an entry is evicted via
    /// [`Cache::delete`] or [`Cache::clear`].
    pub fn on_evict(mut self, hook: impl EventHook<K, V> + 'static) -> Self {
        self.on_evict.push(Sink::Hook(Box::new(hook)));
        self
    }

    /// Registers a hook invoked when [`Cache::get`] finds an existing entry.
    pub fn on_hit(mut self, hook: impl EventHook<K, V> + 'static) -> Self {
        self.on_hit.push(Sink::Hook(Box::new(hook)));
        self
    }

    /// Registers a hook invoked when [`Cache::get`] finds no entry, just
    /// before the fetch runs.
    pub fn on_miss(mut self, hook: impl EventHook<K, V> + 'static) -> Self {
        self.on_miss.push(Sink::Hook(Box::new(hook)));
        self
    }

    /// Registers an asynchronous event queue for the given ops, or for all
    /// ops if `ops` is empty.
    ///
    /// With [`QueuePolicy::Block`], the cache call that triggered the event
    /// waits for queue space; with [`QueuePolicy::Drop`], the event is
    /// discarded if the queue is full. Use an unbuffered-small channel and
    /// `Block` to stop the consumer from falling behind.
    pub fn event_queue(
        mut self,
        tx: mpsc::Sender<Event<K, V>>,
        policy: QueuePolicy,
        ops: &[Op],
    ) -> Self {
        for op in expand(ops) {
            self.sinks_mut(op).push(Sink::Queue {
                tx: tx.clone(),
                policy,
            });
        }
        self
    }

    /// Registers a structured-log sink that records each event for the given
    /// ops (all ops if `ops` is empty) at `level`.
    pub fn log(mut self, level: Level, ops: &[Op]) -> Self {
        for op in expand(ops) {
            self.sinks_mut(op).push(Sink::Log { level });
        }
        self
    }

    /// Builds the cache around `fetch`, the backing-fetch contract described
    /// by [`FetchFn`].
    pub fn build<F>(self, fetch: F) -> Cache<K, V>
    where
        F: Fn(CancellationToken, K) -> BoxFuture<'static, CacheEntry<V>> + Send + Sync + 'static,
    {
        Cache {
            name: self.name.unwrap_or_else(next_name).into(),
            entries: Mutex::new(HashMap::new()),
            fetch: Box::new(fetch),
            on_hit: self.on_hit,
            on_miss: self.on_miss,
            on_fill: self.on_fill,
            on_evict: self.on_evict,
        }
    }

    fn sinks_mut(&mut self, op: Op) -> &mut Vec<Sink<K, V>> {
        match op {
            Op::Hit => &mut self.on_hit,
            Op::Miss => &mut self.on_miss,
            Op::Fill => &mut self.on_fill,
            Op::Evict => &mut self.on_evict,
        }
    }
}

impl<K, V> Default for CacheBuilder<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn expand(ops: &[Op]) -> Vec<Op> {
    let ops = if ops.is_empty() { &Op::ALL[..] } else { ops };
    let mut out = Vec::with_capacity(ops.len());
    for &op in ops {
        if !out.contains(&op) {
            out.push(op);
        }
    }
    out
}
