//! Entity Cache Deterministic Simulation Tests
//!
//! Random store/delete/get sequences against a fault-injecting store, checked after
//! every step through a second cache reading the same data without faults. A failed
//! batch must apply nothing, and a successful one must apply everything.

use lms_cache::cache::{
    BookCache, CacheStats, EntityCache, EntityCacheOptions, Fallback, MembershipFilter, TtlPolicy,
};
use lms_cache::clock::SimulatedClock;
use lms_cache::context::RequestContext;
use lms_cache::keys::KeyEncoder;
use lms_cache::model::Book;
use lms_cache::store::{InMemoryStore, SharedStore, SimulatedStore, SimulatedStoreConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const FILTER: &str = "books:isbn";

fn book_cache(store: SharedStore, seed: u64) -> BookCache {
    let stats = CacheStats::new();
    let filter = MembershipFilter::new(
        store.clone(),
        FILTER,
        10_000,
        0.01,
        Fallback::AssumePresent,
        stats.clone(),
    );
    let options = EntityCacheOptions {
        primary_ttl: TtlPolicy::new(Duration::from_secs(3600), Duration::from_secs(3600)),
        secondary_ttl: TtlPolicy::new(Duration::from_secs(4 * 3600), Duration::from_secs(4 * 3600)),
        existence_fallback: Fallback::AssumePresent,
        seed: Some(seed),
    };
    EntityCache::new(store, KeyEncoder::default(), filter, options, stats)
}

fn book(id: u64, version: u64) -> Book {
    let mut book = Book::new(format!("Title v{version}"), "Author", format!("isbn-{id}"))
        .with_copies(version as i64);
    book.id = id;
    book
}

struct CacheDstResult {
    seed: u64,
    ops: usize,
    store_failures: usize,
    violations: Vec<String>,
}

async fn run_seed(seed: u64, ops: usize, config: SimulatedStoreConfig) -> CacheDstResult {
    let memory = InMemoryStore::new(Arc::new(SimulatedClock::new(0)));
    let chaotic: SharedStore = Arc::new(SimulatedStore::new(memory.clone(), seed, config));
    let cache = book_cache(chaotic, seed);
    let oracle = book_cache(Arc::new(memory), seed);

    let ctx = RequestContext::background();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut model: HashMap<u64, Book> = HashMap::new();
    let mut registered: HashSet<String> = HashSet::new();
    let mut result = CacheDstResult {
        seed,
        ops,
        store_failures: 0,
        violations: Vec::new(),
    };

    for step in 0..ops {
        let id = rng.gen_range(1..=8u64);
        match rng.gen_range(0..10) {
            0..=4 => {
                let entity = book(id, step as u64);
                match cache.store(&ctx, &entity).await {
                    Ok(()) => {
                        registered.insert(entity.isbn.clone());
                        model.insert(id, entity);
                    }
                    Err(_) => result.store_failures += 1,
                }
            }
            5..=6 => {
                if cache.delete(&ctx, id).await.is_ok() {
                    model.remove(&id);
                }
            }
            _ => {
                // A faulty read is a miss, never a wrong answer
                if let Some(found) = cache.get(&ctx, id).await {
                    if model.get(&id) != Some(&found) {
                        result.violations.push(format!("step {step}: stale read of {id}"));
                    }
                }
            }
        }

        let actual = oracle.get(&ctx, id).await;
        if actual.as_ref() != model.get(&id) {
            let expected = model.get(&id);
            result
                .violations
                .push(format!("step {step}: book {id} is {actual:?}, expected {expected:?}"));
        }
        let copies = oracle.available_copies(&ctx, &format!("isbn-{id}")).await;
        if let Some(expected) = model.get(&id) {
            if copies != Some(expected.available_copies) {
                result.violations.push(format!("step {step}: copy count of {id} is {copies:?}"));
            }
        }
    }

    for isbn in &registered {
        if oracle.is_unique(&ctx, isbn).await {
            result.violations.push(format!("registered isbn {isbn} reported unique"));
        }
    }
    result
}

#[tokio::test]
async fn test_cache_dst_50_seeds_no_faults() {
    for seed in 0..50 {
        let result = run_seed(seed, 200, SimulatedStoreConfig::no_faults()).await;
        assert_eq!(result.store_failures, 0);
        assert!(result.violations.is_empty(), "seed {}: {:?}", result.seed, result.violations);
    }
}

#[tokio::test]
async fn test_cache_dst_50_seeds_high_chaos() {
    let mut failures = 0;
    for seed in 1000..1050 {
        let result = run_seed(seed, 300, SimulatedStoreConfig::high_chaos()).await;
        assert!(
            result.violations.is_empty(),
            "seed {} ({} ops): {:?}",
            result.seed,
            result.ops,
            result.violations
        );
        failures += result.store_failures;
    }
    assert!(failures > 0, "high chaos should have failed some writes");
}

#[tokio::test]
async fn test_filter_false_positive_rate() {
    let store: SharedStore = Arc::new(InMemoryStore::new(Arc::new(SimulatedClock::new(0))));
    let filter = MembershipFilter::new(
        store,
        "members:email",
        10_000,
        0.01,
        Fallback::AssumePresent,
        CacheStats::new(),
    );
    let ctx = RequestContext::background();
    filter.reserve(&ctx).await.unwrap();

    for i in 0..10_000 {
        filter.register(&ctx, &format!("member-{i}@example.org")).await.unwrap();
    }
    for i in 0..10_000 {
        assert!(!filter.is_unique(&ctx, &format!("member-{i}@example.org")).await);
    }

    let mut false_positives = 0;
    for i in 0..10_000 {
        if !filter.is_unique(&ctx, &format!("stranger-{i}@example.org")).await {
            false_positives += 1;
        }
    }
    // 1% target, with slack for sampling noise
    assert!(false_positives <= 200, "{false_positives} false positives out of 10000");
}

#[tokio::test]
async fn test_deleted_book_keeps_isbn_taken() {
    let store: SharedStore = Arc::new(InMemoryStore::new(Arc::new(SimulatedClock::new(0))));
    let cache = book_cache(store, 1);
    let ctx = RequestContext::background();

    let mut entity = Book::new("Dune", "Frank Herbert", "978-0441013593").with_copies(3);
    entity.id = 42;
    cache.store(&ctx, &entity).await.unwrap();
    assert!(cache.exists(&ctx, 42).await);

    assert!(cache.delete(&ctx, 42).await.unwrap());
    assert!(!cache.exists(&ctx, 42).await);
    assert!(cache.get(&ctx, 42).await.is_none());
    assert!(!cache.is_unique(&ctx, "978-0441013593").await);
}

#[tokio::test]
async fn test_outage_reports_not_unique_and_exists() {
    let sim = SimulatedStore::new(
        InMemoryStore::new(Arc::new(SimulatedClock::new(0))),
        7,
        SimulatedStoreConfig::no_faults(),
    );
    sim.set_outage(true);
    let cache = book_cache(Arc::new(sim.clone()), 7);
    let ctx = RequestContext::background();

    assert!(!cache.is_unique(&ctx, "ISBN123").await);
    assert!(cache.exists(&ctx, 1).await);
    assert!(cache.get(&ctx, 1).await.is_none());
    assert!(cache.stats().snapshot().degraded >= 3);
    assert!(sim.stats().outage_rejections >= 3);
}
