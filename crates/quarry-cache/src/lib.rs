//! # Fill-once caching primitives for quarry
//!
//! This crate contains a strongly-typed, concurrency-safe, in-memory,
//! on-demand [`Cache`] focused on fill-once, read-many ergonomics, plus an
//! event mechanism useful for linked cache propagation, logging, and metrics.
//!
//! ## The fill-once guarantee
//!
//! A cache entry is populated only once, either on-demand via [`Cache::get`]
//! invoking the backing fetch, or externally via [`Cache::set`]. When several
//! callers ask for the same absent key concurrently, exactly one of them runs
//! the fetch; the rest wait on the entry's fill guard and then observe the
//! identical result. Distinct keys fill with full parallelism: each entry
//! carries its own guard, and the table lock is held only to look up or
//! create the entry slot, never across a fetch.
//!
//! Errors are part of an entry. Whatever the fetch returned — including
//! [`CacheError::NotFound`] for entities that simply do not exist — is stored
//! and replayed identically on every subsequent `get`, until the entry is
//! removed via [`Cache::delete`] or [`Cache::clear`]. The cache never
//! retries.
//!
//! ## Events
//!
//! Four operations are observable: [`Op::Hit`], [`Op::Miss`], [`Op::Fill`],
//! and [`Op::Evict`]. For a single key's lifecycle, miss strictly precedes
//! fill, which strictly precedes any later evict. Each operation can be
//! delivered three ways, all registered at construction on [`CacheBuilder`]:
//!
//! - synchronous [`EventHook`]s, invoked in registration order while the
//!   triggering call waits — intended for propagation between linked caches
//!   and for cheap metrics;
//! - an asynchronous [`Event`] queue with a blocking or dropping
//!   [`QueuePolicy`] — intended for logging and tracing where backpressure on
//!   the cache is undesirable;
//! - a [`tracing`] log sink, built on the same dispatch path as the other
//!   two.
//!
//! Hooks receive the originating cache as an explicit parameter and may call
//! back into it, or into a sibling cache. The cache releases its table lock
//! before invoking any user code, so such reentrancy cannot deadlock; this is
//! the invariant that makes fill propagation between linked caches safe.

#![warn(missing_docs)]

mod cache;
mod error;
mod event;

#[cfg(test)]
mod tests;

pub use cache::{Cache, CacheBuilder, FetchFn};
pub use error::{CacheEntry, CacheError};
pub use event::{Event, EventHook, Op, QueuePolicy, drain_events};
