//! Cache-aside entity cache
//!
//! `EntityCache<E>` fronts the source of truth for one entity kind. Reads never fail:
//! any store or decode problem is logged, counted and reported as a miss. Writes
//! put the payload, the optional secondary record and the membership-filter entry in
//! one atomic batch.

mod background;
mod book;
mod filter;
mod member;

pub use background::BackgroundRunner;
pub use book::BookCache;
pub use filter::{Membership, MembershipFilter};
pub use member::MemberCache;

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::keys::KeyEncoder;
use crate::model::Entity;
use crate::store::{Batch, SharedStore};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An entity the cache knows how to serialize and index
pub trait CachedEntity: Entity + Serialize + DeserializeOwned {
    /// Extra record written next to the payload, keyed by natural key
    fn secondary_record(&self) -> Option<(&str, Bytes)> {
        None
    }
}

/// Answer to give when a check cannot reach the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Fallback {
    /// Report the key as present; the caller confirms with the source of truth
    #[default]
    AssumePresent,
    AssumeAbsent,
}

impl Fallback {
    pub fn assumes_present(self) -> bool {
        matches!(self, Fallback::AssumePresent)
    }
}

/// Base lifetime plus a random offset in `[0, jitter / 2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub base: Duration,
    pub jitter: Duration,
}

impl TtlPolicy {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        TtlPolicy { base, jitter }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rng.gen_range(0..=jitter_ms) / 2)
    }

    /// Upper bound of `sample`
    pub fn max(&self) -> Duration {
        self.base + self.jitter / 2
    }
}

/// Cache counters, shared by every cache and the background runner
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
    decode_failures: AtomicU64,
    writes: AtomicU64,
    background_failed: AtomicU64,
    background_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Lookups answered without the store (error, timeout, fallback)
    pub degraded: u64,
    pub decode_failures: u64,
    pub writes: u64,
    pub background_failed: u64,
    pub background_dropped: u64,
}

impl CacheStats {
    pub fn new() -> Arc<Self> {
        Arc::new(CacheStats::default())
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_degraded(&self) {
        Self::bump(&self.degraded);
    }

    pub(crate) fn record_background_failed(&self) {
        Self::bump(&self.background_failed);
    }

    pub(crate) fn record_background_dropped(&self) {
        Self::bump(&self.background_dropped);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            background_failed: self.background_failed.load(Ordering::Relaxed),
            background_dropped: self.background_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Everything an `EntityCache` needs besides the store
#[derive(Debug, Clone)]
pub struct EntityCacheOptions {
    pub primary_ttl: TtlPolicy,
    pub secondary_ttl: TtlPolicy,
    pub existence_fallback: Fallback,
    /// Seed for TTL jitter; None seeds from the OS
    pub seed: Option<u64>,
}

pub struct EntityCache<E: CachedEntity> {
    store: SharedStore,
    keys: KeyEncoder,
    filter: MembershipFilter,
    options: EntityCacheOptions,
    rng: Arc<Mutex<ChaCha8Rng>>,
    stats: Arc<CacheStats>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: CachedEntity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        EntityCache {
            store: self.store.clone(),
            keys: self.keys.clone(),
            filter: self.filter.clone(),
            options: self.options.clone(),
            rng: self.rng.clone(),
            stats: self.stats.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: CachedEntity> EntityCache<E> {
    pub fn new(
        store: SharedStore,
        keys: KeyEncoder,
        filter: MembershipFilter,
        options: EntityCacheOptions,
        stats: Arc<CacheStats>,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        EntityCache {
            store,
            keys,
            filter,
            options,
            rng: Arc::new(Mutex::new(rng)),
            stats,
            _entity: PhantomData,
        }
    }

    pub fn filter(&self) -> &MembershipFilter {
        &self.filter
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn key(&self, id: u64) -> String {
        self.keys.entity(E::KIND, id)
    }

    fn sample_ttls(&self) -> (Duration, Duration) {
        let mut rng = self.rng.lock();
        let primary = self.options.primary_ttl.sample(&mut *rng);
        let secondary = self.options.secondary_ttl.sample(&mut *rng);
        (primary, secondary)
    }

    /// Cached entity, or None on miss, store error or undecodable payload.
    pub async fn get(&self, ctx: &RequestContext, id: u64) -> Option<E> {
        let key = self.key(id);
        let bytes = match ctx.run(self.store.get(&key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                CacheStats::bump(&self.stats.misses);
                return None;
            }
            Err(e) => {
                self.stats.record_degraded();
                warn!(
                    entity = %E::KIND,
                    id,
                    key = %key,
                    error = %e,
                    "cache lookup failed, treating as miss"
                );
                return None;
            }
        };

        match serde_json::from_slice::<E>(&bytes) {
            Ok(entity) => {
                CacheStats::bump(&self.stats.hits);
                Some(entity)
            }
            Err(e) => {
                CacheStats::bump(&self.stats.decode_failures);
                warn!(
                    entity = %E::KIND,
                    id,
                    key = %key,
                    error = %e,
                    "cached payload undecodable, treating as miss"
                );
                None
            }
        }
    }

    /// Write payload, secondary record and filter entry as one batch.
    pub async fn store(&self, ctx: &RequestContext, entity: &E) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(entity)?;
        let (primary_ttl, secondary_ttl) = self.sample_ttls();

        let mut batch = Batch::new();
        batch.set(self.key(entity.id()), payload, Some(primary_ttl));
        if let Some((natural_key, record)) = entity.secondary_record() {
            batch.set(self.keys.natural(E::KIND, natural_key), record, Some(secondary_ttl));
        }
        if let Some(natural_key) = entity.natural_key() {
            self.filter.register_in(&mut batch, natural_key);
        }

        ctx.run(self.store.execute(batch)).await?;
        CacheStats::bump(&self.stats.writes);
        debug!(
            entity = %E::KIND,
            id = entity.id(),
            ttl_ms = primary_ttl.as_millis() as u64,
            "cached entity"
        );
        Ok(())
    }

    /// Remove the primary entry. The filter entry stays.
    pub async fn delete(&self, ctx: &RequestContext, id: u64) -> Result<bool, StoreError> {
        ctx.run(self.store.delete(&self.key(id))).await
    }

    /// Whether the primary entry is cached. Store errors follow the existence fallback.
    pub async fn exists(&self, ctx: &RequestContext, id: u64) -> bool {
        match ctx.run(self.store.exists(&self.key(id))).await {
            Ok(found) => found,
            Err(e) => {
                self.stats.record_degraded();
                let assumed = self.options.existence_fallback.assumes_present();
                warn!(
                    entity = %E::KIND,
                    id,
                    error = %e,
                    assumed,
                    "existence check failed, using fallback"
                );
                assumed
            }
        }
    }

    /// Whether no entity with this natural key was ever registered.
    pub async fn is_unique(&self, ctx: &RequestContext, natural_key: &str) -> bool {
        self.filter.is_unique(ctx, natural_key).await
    }

    pub async fn check_natural_key(&self, ctx: &RequestContext, natural_key: &str) -> Membership {
        self.filter.check(ctx, natural_key).await
    }
}
