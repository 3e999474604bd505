use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::cache::Cache;
use crate::error::{CacheEntry, CacheError};

/// The four observable cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// An entry already existed for the key. Note that the entry may hold an
    /// error; an errorful entry is a valid hit.
    Hit,
    /// No entry existed for the key. Always immediately followed by an
    /// [`Op::Fill`] from the same caller.
    Miss,
    /// An entry was populated, either by a fetch or by an external
    /// [`Cache::set`]. Emitted for errorful fills too.
    Fill,
    /// An entry was removed.
    Evict,
}

impl Op {
    /// All operations, in lifecycle order.
    pub const ALL: [Op; 4] = [Op::Hit, Op::Miss, Op::Fill, Op::Evict];

    /// The lowercase name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Hit => "hit",
            Op::Miss => "miss",
            Op::Fill => "fill",
            Op::Evict => "evict",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable snapshot of a cache transition, as delivered to event queues
/// and the log sink.
///
/// Events are not retained after delivery; the cache keeps no event history.
#[derive(Debug, Clone)]
pub struct Event<K, V> {
    /// Name of the cache that emitted the event.
    pub cache: Arc<str>,
    /// The operation that occurred.
    pub op: Op,
    /// The key the operation applies to.
    pub key: K,
    /// The entry at the time of the event. `None` for a [`Op::Miss`], and for
    /// an [`Op::Evict`] of an entry that was never filled.
    pub entry: Option<CacheEntry<V>>,
}

impl<K, V> Event<K, V> {
    /// The entry value, if the entry was filled successfully.
    pub fn value(&self) -> Option<&V> {
        self.entry.as_ref().and_then(|e| e.as_ref().ok())
    }

    /// The entry error, if the entry was filled with an error.
    pub fn err(&self) -> Option<&CacheError> {
        self.entry.as_ref().and_then(|e| e.as_ref().err())
    }
}

impl<K: fmt::Debug, V> fmt::Display for Event<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{:?}]", self.cache, self.op, self.key)?;
        if let Some(err) = self.err() {
            write!(f, "[! {err}]")?;
        }
        Ok(())
    }
}

/// A synchronous callback invoked when a cache operation fires.
///
/// Hooks registered at construction are invoked in registration order; the
/// triggering cache call blocks until every relevant hook returns. The
/// originating [`Cache`] is passed explicitly, so a hook running inside one
/// cache can call into the same or a sibling cache. That reentrancy is safe:
/// the cache never holds its table lock while hooks run.
///
/// `entry` is `None` for [`Op::Miss`] (the value is not yet known) and for an
/// [`Op::Evict`] of a never-filled entry.
#[async_trait]
pub trait EventHook<K, V>: Send + Sync {
    /// Handles one cache transition.
    async fn on_event(
        &self,
        token: &CancellationToken,
        cache: &Cache<K, V>,
        key: &K,
        entry: Option<&CacheEntry<V>>,
    );
}

/// Delivery policy for an event queue registered via
/// [`CacheBuilder::event_queue`](crate::CacheBuilder::event_queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// The triggering cache call waits for queue space.
    Block,
    /// The event is discarded if the queue is full.
    Drop,
}

/// A registered event consumer. One list per [`Op`] is fixed at construction.
pub(crate) enum Sink<K, V> {
    /// A synchronous callback.
    Hook(Box<dyn EventHook<K, V>>),
    /// An asynchronous event queue.
    Queue {
        tx: mpsc::Sender<Event<K, V>>,
        policy: QueuePolicy,
    },
    /// A structured-log subscriber. Built on the same dispatch path as the
    /// other sinks, not a privileged one.
    Log { level: Level },
}

impl<K, V> fmt::Debug for Sink<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Hook(_) => f.write_str("Hook"),
            Sink::Queue { policy, .. } => f.debug_struct("Queue").field("policy", policy).finish(),
            Sink::Log { level } => f.debug_struct("Log").field("level", level).finish(),
        }
    }
}

/// Logs a single event at the given level.
///
/// The entry value is deliberately not logged; keys and errors are.
pub(crate) fn log_event<K: fmt::Debug, V>(level: Level, event: &Event<K, V>) {
    macro_rules! emit {
        ($lvl:expr) => {
            match event.err() {
                Some(err) => tracing::event!(
                    $lvl,
                    cache = %event.cache,
                    op = %event.op,
                    key = ?event.key,
                    error = %err,
                    "cache event"
                ),
                None => tracing::event!(
                    $lvl,
                    cache = %event.cache,
                    op = %event.op,
                    key = ?event.key,
                    "cache event"
                ),
            }
        };
    }
    if level == Level::TRACE {
        emit!(Level::TRACE);
    } else if level == Level::DEBUG {
        emit!(Level::DEBUG);
    } else if level == Level::INFO {
        emit!(Level::INFO);
    } else if level == Level::WARN {
        emit!(Level::WARN);
    } else {
        emit!(Level::ERROR);
    }
}

/// Logs events from `rx` until the channel closes or `token` is canceled.
///
/// It is common to spawn a task to handle the logging:
///
/// ```ignore
/// let (tx, rx) = tokio::sync::mpsc::channel(64);
/// let cache = CacheBuilder::new()
///     .event_queue(tx, QueuePolicy::Block, &[])
///     .build(fetch);
///
/// tokio::spawn(drain_events(rx, Level::DEBUG, token.clone()));
/// ```
pub async fn drain_events<K, V>(
    mut rx: mpsc::Receiver<Event<K, V>>,
    level: Level,
    token: CancellationToken,
) where
    K: fmt::Debug,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => log_event(level, &event),
                None => return,
            },
        }
    }
}
