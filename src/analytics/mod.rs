//! Loan analytics: per-entity ranked counters over time buckets
//!
//! Each book has a counter set keyed by `year/month` of the loan date; each member has
//! one keyed by `isoYear/month/isoWeek`. Counters only grow. A redelivered task counts
//! again, so totals are at-least-once.

mod report;

pub use report::{AnalyticsReport, AnalyticsService};

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::keys::KeyEncoder;
use crate::model::EntityKind;
use crate::store::{Batch, SharedStore};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `2024/3`
pub fn book_month_label(at: &DateTime<Utc>) -> String {
    format!("{}/{}", at.year(), at.month())
}

/// `2024/3/11`: ISO week-numbering year, calendar month, ISO week
pub fn member_week_label(at: &DateTime<Utc>) -> String {
    let week = at.iso_week();
    format!("{}/{}/{}", week.year(), at.month(), week.week())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    pub label: String,
    pub count: u64,
}

/// Top buckets of one entity, highest count first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFrequencies {
    pub id: u64,
    pub buckets: Vec<BucketCount>,
}

impl EntityFrequencies {
    pub fn count(&self, label: &str) -> Option<u64> {
        self.buckets.iter().find(|b| b.label == label).map(|b| b.count)
    }
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    store: SharedStore,
    keys: KeyEncoder,
}

impl std::fmt::Debug for AnalyticsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsAggregator")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl AnalyticsAggregator {
    pub fn new(store: SharedStore, keys: KeyEncoder) -> Self {
        AnalyticsAggregator { store, keys }
    }

    pub fn bucket_key(&self, kind: EntityKind, id: u64) -> String {
        self.keys.analytics(kind, id)
    }

    /// Add one occurrence of `label` to the entity's counters. Returns the new count.
    pub async fn record_event(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        id: u64,
        label: &str,
    ) -> Result<u64, StoreError> {
        let key = self.bucket_key(kind, id);
        let score = ctx.run(self.store.increment_ranked(&key, label, 1.0)).await?;
        debug!(entity = %kind, id, label, count = score, "recorded analytics event");
        Ok(score as u64)
    }

    /// Book-monthly and member-weekly updates for one loan, run concurrently.
    pub async fn record_loan(
        &self,
        ctx: &RequestContext,
        book_id: u64,
        member_id: u64,
        loan_date: &DateTime<Utc>,
    ) -> (Result<u64, StoreError>, Result<u64, StoreError>) {
        let month = book_month_label(loan_date);
        let week = member_week_label(loan_date);
        tokio::join!(
            self.record_event(ctx, EntityKind::Book, book_id, &month),
            self.record_event(ctx, EntityKind::Member, member_id, &week),
        )
    }

    /// First `limit` buckets per id, highest count first, in one round trip.
    /// Ids without counters get an empty list.
    pub async fn query_top(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        ids: &[u64],
        limit: usize,
    ) -> Result<Vec<EntityFrequencies>, StoreError> {
        if limit == 0 || ids.is_empty() {
            return Ok(ids
                .iter()
                .map(|&id| EntityFrequencies {
                    id,
                    buckets: Vec::new(),
                })
                .collect());
        }

        let mut batch = Batch::new();
        let slots: Vec<_> = ids
            .iter()
            .map(|&id| {
                let stop = limit.saturating_sub(1).min(isize::MAX as usize) as isize;
                (id, batch.zrevrange_with_scores(self.bucket_key(kind, id), 0, stop))
            })
            .collect();

        let mut replies = ctx.run(self.store.execute(batch)).await?;
        slots
            .into_iter()
            .map(|(id, slot)| {
                let buckets = replies
                    .take(slot)?
                    .into_iter()
                    .map(|scored| BucketCount {
                        label: scored.member,
                        count: scored.score as u64,
                    })
                    .collect();
                Ok(EntityFrequencies { id, buckets })
            })
            .collect()
    }
}
