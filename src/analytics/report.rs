use super::{AnalyticsAggregator, EntityFrequencies};
use crate::cache::CacheStats;
use crate::context::RequestContext;
use crate::error::CatalogError;
use crate::model::{Book, Entity, EntityKind, Member};
use crate::repository::SharedRepository;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticsReport {
    pub kind: EntityKind,
    pub entries: Vec<EntityFrequencies>,
    /// Counters could not be read; every entry is empty
    pub degraded: bool,
}

impl AnalyticsReport {
    pub fn entry(&self, id: u64) -> Option<&EntityFrequencies> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Reports for the analytics endpoint.
///
/// Counter reads never fail a report: when the store cannot answer, each requested id
/// gets an empty bucket list and the report is flagged `degraded`. Only the source of
/// truth can fail `first_page_reports`.
pub struct AnalyticsService {
    aggregator: AnalyticsAggregator,
    books: SharedRepository<Book>,
    members: SharedRepository<Member>,
    top_limit: usize,
    stats: Arc<CacheStats>,
}

impl AnalyticsService {
    pub fn new(
        aggregator: AnalyticsAggregator,
        books: SharedRepository<Book>,
        members: SharedRepository<Member>,
        top_limit: usize,
    ) -> Self {
        AnalyticsService {
            aggregator,
            books,
            members,
            top_limit,
            stats: CacheStats::new(),
        }
    }

    /// Count degraded reads on shared counters instead of private ones
    pub fn with_stats(mut self, stats: Arc<CacheStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub async fn book_report(&self, ctx: &RequestContext, ids: &[u64]) -> AnalyticsReport {
        self.report(ctx, EntityKind::Book, ids).await
    }

    pub async fn member_report(&self, ctx: &RequestContext, ids: &[u64]) -> AnalyticsReport {
        self.report(ctx, EntityKind::Member, ids).await
    }

    async fn report(&self, ctx: &RequestContext, kind: EntityKind, ids: &[u64]) -> AnalyticsReport {
        match self.aggregator.query_top(ctx, kind, ids, self.top_limit).await {
            Ok(entries) => AnalyticsReport {
                kind,
                entries,
                degraded: false,
            },
            Err(e) => {
                self.stats.record_degraded();
                warn!(
                    entity = %kind,
                    ids = ids.len(),
                    error = %e,
                    "analytics counters unavailable"
                );
                AnalyticsReport {
                    kind,
                    entries: ids
                        .iter()
                        .map(|&id| EntityFrequencies {
                            id,
                            buckets: Vec::new(),
                        })
                        .collect(),
                    degraded: true,
                }
            }
        }
    }

    /// Book-monthly and member-weekly reports for the first page of each kind.
    pub async fn first_page_reports(
        &self,
        ctx: &RequestContext,
        page_size: usize,
    ) -> Result<(AnalyticsReport, AnalyticsReport), CatalogError> {
        let books = self.books.find_page(None, page_size).await?;
        let book_ids: Vec<u64> = books.items.iter().map(Entity::id).collect();

        let members = self.members.find_page(None, page_size).await?;
        let member_ids: Vec<u64> = members.items.iter().map(Entity::id).collect();

        Ok((
            self.book_report(ctx, &book_ids).await,
            self.member_report(ctx, &member_ids).await,
        ))
    }
}
