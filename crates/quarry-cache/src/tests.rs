use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;

use crate::{Cache, CacheBuilder, CacheEntry, CacheError, EventHook, Op, QueuePolicy};

/// Sets up the test logger so that console output is captured by the test
/// runner.
fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("quarry_cache=trace"))
        .with_target(false)
        .with_test_writer()
        .try_init()
        .ok();
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// Builds a cache over `usize` keys whose fetch returns the key rendered as
/// a string for even keys and an error for odd keys, counting per-key fetch
/// invocations.
fn even_odd_cache(calls: Arc<Vec<AtomicUsize>>) -> Cache<usize, String> {
    CacheBuilder::new().name("even-odd").build(move |_token, key: usize| {
        calls[key].fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if key % 2 == 0 {
                Ok(key.to_string())
            } else {
                Err(CacheError::Fetch(format!("odd key {key}")))
            }
        })
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight() {
    setup();
    const KEYS: usize = 100;
    const CALLERS: usize = 10;

    let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..KEYS).map(|_| AtomicUsize::new(0)).collect());
    let cache = Arc::new(even_odd_cache(calls.clone()));

    let mut tasks = Vec::with_capacity(KEYS * CALLERS);
    for i in 0..KEYS * CALLERS {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let key = i % KEYS;
            (key, cache.get(&token(), &key).await)
        }));
    }

    for task in tasks {
        let (key, entry) = task.await.unwrap();
        if key % 2 == 0 {
            assert_eq!(entry, Ok(key.to_string()));
        } else {
            assert_eq!(entry, Err(CacheError::Fetch(format!("odd key {key}"))));
        }
    }

    for (key, count) in calls.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "fetch ran twice for {key}");
    }
    assert_eq!(cache.len(), KEYS);
}

#[tokio::test]
async fn has_never_fetches() {
    setup();
    let calls = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let cache = even_odd_cache(Arc::clone(&calls));
    let token = token();

    assert!(!cache.has(&2));
    assert_eq!(calls[2].load(Ordering::SeqCst), 0);

    cache.get(&token, &2).await.unwrap();
    assert!(cache.has(&2));
    assert!(!cache.has(&3));

    cache.set(&token, &3, Ok("three".into())).await;
    assert!(cache.has(&3));
    assert_eq!(calls[3].load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn set_is_sticky_once() {
    setup();
    let calls = Arc::new((0..2).map(|_| AtomicUsize::new(0)).collect());
    let cache = even_odd_cache(Arc::clone(&calls));
    let token = token();

    cache.set(&token, &0, Ok("a".into())).await;
    cache
        .set(&token, &0, Err(CacheError::Fetch("late".into())))
        .await;

    assert_eq!(cache.get(&token, &0).await, Ok("a".to_string()));
    assert_eq!(calls[0].load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn eviction_reenables_fill() {
    setup();
    let calls = Arc::new((0..8).map(|_| AtomicUsize::new(0)).collect());
    let cache = even_odd_cache(Arc::clone(&calls));
    let token = token();

    cache.set(&token, &6, Ok("seven".into())).await;
    assert_eq!(cache.get(&token, &6).await, Ok("seven".to_string()));
    assert_eq!(calls[6].load(Ordering::SeqCst), 0);

    cache.delete(&token, &6).await;
    assert!(!cache.has(&6));

    assert_eq!(cache.get(&token, &6).await, Ok("6".to_string()));
    assert_eq!(calls[6].load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_evicts_everything() {
    setup();
    let calls = Arc::new((0..6).map(|_| AtomicUsize::new(0)).collect());
    let (tx, mut rx) = mpsc::channel(16);
    let cache = CacheBuilder::new()
        .name("clearing")
        .event_queue(tx, QueuePolicy::Block, &[Op::Evict])
        .build({
            let calls: Arc<Vec<AtomicUsize>> = Arc::clone(&calls);
            move |_token, key: usize| {
                calls[key].fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(key.to_string()) })
            }
        });
    let token = token();

    for key in 0..3 {
        cache.get(&token, &key).await.unwrap();
    }
    assert_eq!(cache.len(), 3);

    cache.clear(&token).await;
    assert!(cache.is_empty());
    for _ in 0..3 {
        assert_eq!(rx.recv().await.unwrap().op, Op::Evict);
    }

    cache.get(&token, &1).await.unwrap();
    assert_eq!(calls[1].load(Ordering::SeqCst), 2);
}

/// On filling `base`, primes `derived` on the same cache. Exercises hook
/// reentrancy: the hook runs inside the triggering `get` and calls back into
/// the cache that invoked it.
struct PrimeDerived;

#[async_trait]
impl EventHook<String, String> for PrimeDerived {
    async fn on_event(
        &self,
        token: &CancellationToken,
        cache: &Cache<String, String>,
        key: &String,
        entry: Option<&CacheEntry<String>>,
    ) {
        if key == "base" {
            if let Some(Ok(val)) = entry {
                assert!(cache.has(key));
                let derived = format!("{val}-derived");
                cache.set(token, &"derived".to_string(), Ok(derived)).await;
            }
        }
    }
}

#[tokio::test]
async fn fill_hook_reenters_cache() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = CacheBuilder::new()
        .name("reentrant")
        .on_fill(PrimeDerived)
        .build({
            let calls = calls.clone();
            move |_token, key: String| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok(key.to_uppercase()) })
            }
        });
    let token = token();

    assert_eq!(cache.get(&token, &"base".to_string()).await.unwrap(), "BASE");

    // The hook already primed "derived"; this must be a hit, not a fetch.
    assert_eq!(
        cache.get(&token, &"derived".to_string()).await.unwrap(),
        "BASE-derived"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn event_order_per_key() {
    setup();
    let (tx, mut rx) = mpsc::channel(8);
    let cache = CacheBuilder::new()
        .name("events")
        .event_queue(tx, QueuePolicy::Block, &[])
        .build(|_token, key: usize| Box::pin(async move { Ok(key.to_string()) }));
    let token = token();

    cache.get(&token, &1).await.unwrap();
    let miss = rx.recv().await.unwrap();
    assert_eq!((miss.op, miss.key), (Op::Miss, 1));
    assert!(miss.entry.is_none());

    let fill = rx.recv().await.unwrap();
    assert_eq!((fill.op, fill.key), (Op::Fill, 1));
    assert_eq!(fill.value(), Some(&"1".to_string()));
    assert_eq!(format!("{fill}"), "events.fill[1]");

    cache.get(&token, &1).await.unwrap();
    let hit = rx.recv().await.unwrap();
    assert_eq!((hit.op, hit.key), (Op::Hit, 1));

    cache.delete(&token, &1).await;
    let evict = rx.recv().await.unwrap();
    assert_eq!((evict.op, evict.key), (Op::Evict, 1));
    assert_eq!(evict.value(), Some(&"1".to_string()));
}

#[tokio::test]
async fn queue_drop_policy_discards_overflow() {
    setup();
    let (tx, mut rx) = mpsc::channel(1);
    let cache = CacheBuilder::new()
        .name("droppy")
        .event_queue(tx, QueuePolicy::Drop, &[])
        .build(|_token, key: usize| Box::pin(async move { Ok(key.to_string()) }));
    let token = token();

    // Nobody drains the queue: only the first event fits, the rest are
    // discarded, and cache operations are unaffected.
    assert_eq!(cache.get(&token, &1).await, Ok("1".to_string()));
    assert_eq!(cache.get(&token, &1).await, Ok("1".to_string()));

    assert_eq!(rx.try_recv().unwrap().op, Op::Miss);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn fill_completes_after_evict() {
    setup();
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::channel(16);
    let cache = Arc::new(
        CacheBuilder::new()
            .name("overlap")
            .event_queue(tx, QueuePolicy::Block, &[])
            .build({
                let gate = gate.clone();
                let calls = calls.clone();
                move |_token, key: usize| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let gate = gate.clone();
                    Box::pin(async move {
                        let _permit = gate.acquire().await.unwrap();
                        Ok(key.to_string())
                    })
                }
            }),
    );
    let token = token();

    let task = tokio::spawn({
        let cache = cache.clone();
        let token = token.clone();
        async move { cache.get(&token, &7).await }
    });

    // The claimant has emitted its miss and is now blocked in the fetch.
    assert_eq!(rx.recv().await.unwrap().op, Op::Miss);

    // Evicting mid-fetch detaches the entry; the evict carries no result
    // because the entry was never filled.
    cache.delete(&token, &7).await;
    let evict = rx.recv().await.unwrap();
    assert_eq!(evict.op, Op::Evict);
    assert!(evict.entry.is_none());

    // The in-flight fill still completes and still notifies.
    gate.add_permits(1);
    assert_eq!(task.await.unwrap(), Ok("7".to_string()));
    assert_eq!(rx.recv().await.unwrap().op, Op::Fill);

    // The key is gone from the table, so a fresh get fetches anew.
    assert_eq!(cache.get(&token, &7).await, Ok("7".to_string()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn canceled_fetch_is_cached() {
    setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::channel(8);
    let cache = Arc::new(
        CacheBuilder::new()
            .name("canceled")
            .event_queue(tx, QueuePolicy::Block, &[Op::Miss])
            .build({
                let calls = calls.clone();
                move |_token, _key: usize| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Box::pin(std::future::pending::<CacheEntry<String>>())
                }
            }),
    );
    let token = CancellationToken::new();

    let task = tokio::spawn({
        let cache = cache.clone();
        let token = token.clone();
        async move { cache.get(&token, &1).await }
    });

    assert_eq!(rx.recv().await.unwrap().op, Op::Miss);
    token.cancel();
    assert_eq!(task.await.unwrap(), Err(CacheError::Canceled));

    // The cancellation poisoned the key: a fresh token still observes the
    // stored error, without a second fetch.
    let fresh = CancellationToken::new();
    assert_eq!(cache.get(&fresh, &1).await, Err(CacheError::Canceled));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Deleting the key re-enables a real fetch.
    cache.delete(&fresh, &1).await;
    let task = tokio::spawn({
        let cache = cache.clone();
        let token = fresh.clone();
        async move { cache.get(&token, &1).await }
    });
    assert_eq!(rx.recv().await.unwrap().op, Op::Miss);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    fresh.cancel();
    assert_eq!(task.await.unwrap(), Err(CacheError::Canceled));
}

#[tokio::test]
async fn named_and_generated_names() {
    setup();
    let named: Cache<usize, String> = CacheBuilder::new()
        .name("explicit")
        .build(|_token, key: usize| Box::pin(async move { Ok(key.to_string()) }));
    assert_eq!(named.name(), "explicit");

    let anon: Cache<usize, String> =
        CacheBuilder::new().build(|_token, key: usize| Box::pin(async move { Ok(key.to_string()) }));
    assert!(anon.name().starts_with("cache-"));
}
