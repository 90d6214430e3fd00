//! Membership filter over the store's probabilistic set
//!
//! Entries are only ever added. A positive answer may be a false positive; a negative
//! answer is exact. When the store cannot answer, `is_unique` follows the configured
//! fallback, which by default reports the key as taken.

use super::{CacheStats, Fallback};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::store::{Batch, SharedStore, Slot};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a filter lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Definitely never registered
    Absent,
    /// Registered, or a false positive
    MaybePresent,
    /// The store could not be consulted
    Unknown,
}

#[derive(Clone)]
pub struct MembershipFilter {
    store: SharedStore,
    name: String,
    capacity: u64,
    error_rate: f64,
    fallback: Fallback,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for MembershipFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipFilter")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("error_rate", &self.error_rate)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl MembershipFilter {
    pub fn new(
        store: SharedStore,
        name: impl Into<String>,
        capacity: u64,
        error_rate: f64,
        fallback: Fallback,
        stats: Arc<CacheStats>,
    ) -> Self {
        MembershipFilter {
            store,
            name: name.into(),
            capacity,
            error_rate,
            fallback,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback(&self) -> Fallback {
        self.fallback
    }

    /// Create the filter with its configured sizing. An existing filter is left as is.
    pub async fn reserve(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        let mut batch = Batch::new();
        batch.bf_reserve(self.name.as_str(), self.error_rate, self.capacity);

        match ctx.run(self.store.execute(batch)).await {
            Ok(_) => {
                debug!(
                    filter = %self.name,
                    capacity = self.capacity,
                    error_rate = self.error_rate,
                    "reserved membership filter"
                );
                Ok(())
            }
            Err(StoreError::KeyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn check(&self, ctx: &RequestContext, key: &str) -> Membership {
        match ctx.run(self.store.set_contains(&self.name, key)).await {
            Ok(true) => Membership::MaybePresent,
            Ok(false) => Membership::Absent,
            Err(e) => {
                self.stats.record_degraded();
                warn!(filter = %self.name, key, error = %e, "membership check failed");
                Membership::Unknown
            }
        }
    }

    /// True when `key` was never registered. Unknown answers follow the fallback.
    pub async fn is_unique(&self, ctx: &RequestContext, key: &str) -> bool {
        match self.check(ctx, key).await {
            Membership::Absent => true,
            Membership::MaybePresent => false,
            Membership::Unknown => !self.fallback.assumes_present(),
        }
    }

    pub async fn register(&self, ctx: &RequestContext, key: &str) -> Result<bool, StoreError> {
        ctx.run(self.store.add_to_set(&self.name, key)).await
    }

    /// Queue the registration onto a larger batch
    pub fn register_in(&self, batch: &mut Batch, key: &str) -> Slot<bool> {
        batch.bf_add(self.name.as_str(), key)
    }
}
