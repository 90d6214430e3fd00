//! Catalog operations over the cache, the source of truth and the task pipeline
//!
//! Reads go cache first and repopulate in the background on a miss. Writes go to the
//! source of truth first; cache population and invalidation follow as detached jobs.
//! Creates are guarded by the membership filter, with positive answers confirmed
//! against the source of truth.

use crate::cache::{
    BackgroundRunner, BookCache, CacheStats, CachedEntity, EntityCache, MemberCache, Membership,
    MembershipFilter,
};
use crate::config::CatalogConfig;
use crate::context::RequestContext;
use crate::error::{CatalogError, RepositoryError, StoreError};
use crate::model::{Book, Entity, EntityKind, Loan, Member};
use crate::pipeline::{AnalyticsTaskPayload, SharedBroker, TaskDistributor};
use crate::repository::SharedRepository;
use crate::store::SharedStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Sources of truth for every entity kind
#[derive(Clone)]
pub struct Repositories {
    pub books: SharedRepository<Book>,
    pub members: SharedRepository<Member>,
    pub loans: SharedRepository<Loan>,
}

pub struct CatalogService {
    books: BookCache,
    members: MemberCache,
    repos: Repositories,
    background: BackgroundRunner,
    distributor: TaskDistributor,
    stats: Arc<CacheStats>,
}

impl CatalogService {
    pub fn new(
        books: BookCache,
        members: MemberCache,
        repos: Repositories,
        background: BackgroundRunner,
        distributor: TaskDistributor,
        stats: Arc<CacheStats>,
    ) -> Self {
        CatalogService {
            books,
            members,
            repos,
            background,
            distributor,
            stats,
        }
    }

    /// Wire caches, filters and the distributor from configuration.
    pub fn from_config(
        config: &CatalogConfig,
        store: SharedStore,
        repos: Repositories,
        broker: SharedBroker,
    ) -> Self {
        let stats = CacheStats::new();
        let keys = config.analytics.key_encoder();
        let filter = |f: &crate::config::FilterConfig| {
            MembershipFilter::new(
                store.clone(),
                f.name.as_str(),
                f.capacity,
                f.error_rate,
                config.fallback.uniqueness,
                stats.clone(),
            )
        };

        let books = EntityCache::new(
            store.clone(),
            keys.clone(),
            filter(&config.filters.book),
            config.cache.book_options(config.fallback.existence),
            stats.clone(),
        );
        let members = EntityCache::new(
            store.clone(),
            keys,
            filter(&config.filters.member),
            config.cache.member_options(config.fallback.existence),
            stats.clone(),
        );

        CatalogService::new(
            books,
            members,
            repos,
            BackgroundRunner::new(config.background.max_in_flight, stats.clone()),
            TaskDistributor::new(broker, config.analytics.task.clone()),
            stats,
        )
    }

    pub fn books(&self) -> &BookCache {
        &self.books
    }

    pub fn members(&self) -> &MemberCache {
        &self.members
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn background(&self) -> &BackgroundRunner {
        &self.background
    }

    pub fn cache_stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Create both filters with their configured sizing (no-op if they exist).
    pub async fn reserve_filters(&self, ctx: &RequestContext) -> Result<(), StoreError> {
        self.books.filter().reserve(ctx).await?;
        self.members.filter().reserve(ctx).await
    }

    pub async fn get_book(&self, ctx: &RequestContext, id: u64) -> Result<Book, CatalogError> {
        self.read_through(ctx, &self.books, &self.repos.books, id).await
    }

    pub async fn get_member(&self, ctx: &RequestContext, id: u64) -> Result<Member, CatalogError> {
        self.read_through(ctx, &self.members, &self.repos.members, id).await
    }

    pub async fn create_book(
        &self,
        ctx: &RequestContext,
        book: Book,
    ) -> Result<Book, CatalogError> {
        self.create_guarded(ctx, &self.books, &self.repos.books, book).await
    }

    pub async fn create_member(
        &self,
        ctx: &RequestContext,
        member: Member,
    ) -> Result<Member, CatalogError> {
        self.create_guarded(ctx, &self.members, &self.repos.members, member).await
    }

    /// Add `delta` (possibly negative) to a book's available copies.
    pub async fn change_available_copies(
        &self,
        _ctx: &RequestContext,
        book_id: u64,
        delta: i64,
    ) -> Result<Book, CatalogError> {
        let mut book = self
            .repos
            .books
            .find_by_id(book_id)
            .await?
            .ok_or(CatalogError::NotFound {
                kind: EntityKind::Book,
                id: book_id,
            })?;

        book.available_copies = match book.available_copies.checked_add(delta) {
            Some(copies) if copies >= 0 => copies,
            _ => return Err(CatalogError::NoCopiesAvailable { book_id }),
        };
        let saved = self.repos.books.save(book).await?;
        self.populate_in_background("cache_book", &self.books, saved.clone());
        Ok(saved)
    }

    pub async fn delete_book(&self, _ctx: &RequestContext, id: u64) -> Result<(), CatalogError> {
        self.delete_entity(&self.books, &self.repos.books, id).await
    }

    pub async fn delete_member(&self, _ctx: &RequestContext, id: u64) -> Result<(), CatalogError> {
        self.delete_entity(&self.members, &self.repos.members, id).await
    }

    /// Take one copy of the book out and record the loan.
    pub async fn lend_book(
        &self,
        ctx: &RequestContext,
        book_id: u64,
        member_id: u64,
        loan_date: DateTime<Utc>,
    ) -> Result<Loan, CatalogError> {
        self.get_member(ctx, member_id).await?;
        self.change_available_copies(ctx, book_id, -1).await?;

        match self.repos.loans.create(Loan::new(book_id, member_id, loan_date)).await {
            Ok(loan) => {
                info!(loan_id = loan.id, book_id, member_id, "book lent");
                Ok(loan)
            }
            Err(e) => {
                if let Err(restore) = self.change_available_copies(ctx, book_id, 1).await {
                    error!(book_id, error = %restore, "failed to restore copy after loan failure");
                }
                Err(e.into())
            }
        }
    }

    /// Close the loan, return the copy and hand the loan to the analytics pipeline.
    ///
    /// The member is resolved before anything is written. If the copy cannot be returned
    /// the loan is reopened, so a failed call can be retried. The analytics task is
    /// enqueued once; a failed enqueue is logged and the loan still completes.
    pub async fn complete_loan(
        &self,
        ctx: &RequestContext,
        loan_id: u64,
        return_date: DateTime<Utc>,
    ) -> Result<Loan, CatalogError> {
        let mut loan = self
            .repos
            .loans
            .find_by_id(loan_id)
            .await?
            .ok_or(CatalogError::NotFound {
                kind: EntityKind::Loan,
                id: loan_id,
            })?;
        if loan.is_completed() {
            return Err(CatalogError::LoanAlreadyCompleted { loan_id });
        }

        let member = self.get_member(ctx, loan.member_id).await?;
        loan.return_date = Some(return_date);
        let loan = self.repos.loans.save(loan).await?;
        let book = match self.change_available_copies(ctx, loan.book_id, 1).await {
            Ok(book) => book,
            Err(e) => {
                let mut reopened = loan.clone();
                reopened.return_date = None;
                if let Err(restore) = self.repos.loans.save(reopened).await {
                    error!(loan_id, error = %restore, "failed to reopen loan after copy return");
                }
                return Err(e);
            }
        };

        let payload = AnalyticsTaskPayload {
            book,
            loan: loan.clone(),
            member,
        };
        if let Err(e) = self.distributor.distribute_analytics(ctx, &payload, None).await {
            error!(loan_id, error = %e, "failed to enqueue analytics task");
        }
        info!(loan_id, book_id = loan.book_id, member_id = loan.member_id, "loan completed");
        Ok(loan)
    }

    /// Stop background jobs once the running ones finish.
    pub async fn shutdown(&self) {
        self.background.drain().await;
    }

    async fn read_through<E: CachedEntity>(
        &self,
        ctx: &RequestContext,
        cache: &EntityCache<E>,
        repo: &SharedRepository<E>,
        id: u64,
    ) -> Result<E, CatalogError> {
        if let Some(entity) = cache.get(ctx, id).await {
            return Ok(entity);
        }

        let entity = repo
            .find_by_id(id)
            .await?
            .ok_or(CatalogError::NotFound { kind: E::KIND, id })?;
        self.populate_in_background(cache_job(E::KIND), cache, entity.clone());
        Ok(entity)
    }

    async fn create_guarded<E: CachedEntity>(
        &self,
        ctx: &RequestContext,
        cache: &EntityCache<E>,
        repo: &SharedRepository<E>,
        entity: E,
    ) -> Result<E, CatalogError> {
        let key = entity.natural_key().unwrap_or_default().to_string();
        let duplicate = || CatalogError::Duplicate {
            kind: E::KIND,
            key: key.clone(),
        };

        match cache.check_natural_key(ctx, &key).await {
            Membership::Absent => {}
            Membership::MaybePresent => {
                if repo.find_by_natural_key(&key).await?.is_some() {
                    return Err(duplicate());
                }
                debug!(entity = %E::KIND, key = %key, "membership filter false positive");
            }
            Membership::Unknown => {
                if cache.filter().fallback().assumes_present() {
                    warn!(entity = %E::KIND, key = %key, "uniqueness unknown, rejecting create");
                    return Err(duplicate());
                }
            }
        }

        let created = repo.create(entity).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => duplicate(),
            other => other.into(),
        })?;
        info!(entity = %E::KIND, id = created.id(), "created");
        self.populate_in_background(cache_job(E::KIND), cache, created.clone());
        Ok(created)
    }

    async fn delete_entity<E: CachedEntity>(
        &self,
        cache: &EntityCache<E>,
        repo: &SharedRepository<E>,
        id: u64,
    ) -> Result<(), CatalogError> {
        if !repo.delete(id).await? {
            return Err(CatalogError::NotFound { kind: E::KIND, id });
        }
        let cache = cache.clone();
        self.background.spawn("evict_entity", async move {
            cache.delete(&RequestContext::background(), id).await.map(|_| ())
        });
        Ok(())
    }

    fn populate_in_background<E: CachedEntity>(
        &self,
        job: &'static str,
        cache: &EntityCache<E>,
        entity: E,
    ) {
        let cache = cache.clone();
        self.background.spawn(job, async move {
            cache.store(&RequestContext::background(), &entity).await
        });
    }
}

fn cache_job(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Book => "cache_book",
        EntityKind::Member => "cache_member",
        EntityKind::Loan => "cache_loan",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::pipeline::{
        InMemoryBroker, TaskBroker, TaskState, CRITICAL_QUEUE, DEFAULT_QUEUE, LOW_QUEUE,
    };
    use crate::repository::{InMemoryRepository, Repository};
    use crate::store::{InMemoryStore, SimulatedStore, SimulatedStoreConfig};
    use chrono::TimeZone;

    struct Harness {
        service: CatalogService,
        store: SimulatedStore<InMemoryStore>,
        broker: Arc<InMemoryBroker>,
        clock: SimulatedClock,
    }

    fn harness() -> Harness {
        let clock = SimulatedClock::new(0);
        let store = SimulatedStore::new(
            InMemoryStore::new(Arc::new(clock.clone())),
            3,
            SimulatedStoreConfig::no_faults(),
        );
        let broker = Arc::new(InMemoryBroker::new(
            Arc::new(clock.clone()),
            [CRITICAL_QUEUE, DEFAULT_QUEUE, LOW_QUEUE],
            Default::default(),
        ));
        let repos = Repositories {
            books: Arc::new(InMemoryRepository::<Book>::new()),
            members: Arc::new(InMemoryRepository::<Member>::new()),
            loans: Arc::new(InMemoryRepository::<Loan>::new()),
        };
        let mut config = CatalogConfig::default();
        config.cache.seed = Some(1);
        let service =
            CatalogService::from_config(&config, Arc::new(store.clone()), repos, broker.clone());
        Harness {
            service,
            store,
            broker,
            clock,
        }
    }

    #[tokio::test]
    async fn test_read_through_populates_cache() {
        let h = harness();
        let ctx = RequestContext::background();
        let book = h
            .service
            .repositories()
            .books
            .create(Book::new("Dune", "Herbert", "isbn-1"))
            .await
            .unwrap();

        assert_eq!(h.service.get_book(&ctx, book.id).await.unwrap(), book);
        h.service.background().settle().await;
        assert!(h.service.books().exists(&ctx, book.id).await);
        assert_eq!(h.service.books().get(&ctx, book.id).await, Some(book.clone()));

        let err = h.service.get_book(&ctx, 999).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { id: 999, .. }));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_tolerates_false_positives() {
        let h = harness();
        let ctx = RequestContext::background();

        let created = h
            .service
            .create_member(&ctx, Member::new("Ada", "ada@example.org"))
            .await
            .unwrap();
        h.service.background().settle().await;
        let err = h
            .service
            .create_member(&ctx, Member::new("Ada L.", "ada@example.org"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate { kind: EntityKind::Member, .. }));

        // Registered in the filter but absent from the source of truth
        h.service.members().filter().register(&ctx, "ghost@example.org").await.unwrap();
        let ghost = h
            .service
            .create_member(&ctx, Member::new("Ghost", "ghost@example.org"))
            .await
            .unwrap();
        assert_ne!(ghost.id, created.id);
    }

    #[tokio::test]
    async fn test_create_during_outage_is_rejected() {
        let h = harness();
        let ctx = RequestContext::background();
        h.store.set_outage(true);

        let err = h
            .service
            .create_book(&ctx, Book::new("Dune", "Herbert", "ISBN123"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate { ref key, .. } if key == "ISBN123"));
        let stored = h.service.repositories().books.find_by_natural_key("ISBN123").await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_delete_evicts_but_keeps_filter_entry() {
        let h = harness();
        let ctx = RequestContext::background();
        let book = h
            .service
            .create_book(&ctx, Book::new("Dune", "Herbert", "isbn-9"))
            .await
            .unwrap();
        h.service.background().settle().await;
        assert!(h.service.books().exists(&ctx, book.id).await);

        h.service.delete_book(&ctx, book.id).await.unwrap();
        h.service.background().settle().await;
        assert!(!h.service.books().exists(&ctx, book.id).await);
        assert!(!h.service.books().is_unique(&ctx, "isbn-9").await);
        assert!(h.service.delete_book(&ctx, book.id).await.is_err());
    }

    #[tokio::test]
    async fn test_lend_and_complete_enqueue_analytics_once() {
        let h = harness();
        let ctx = RequestContext::background();
        let book = h
            .service
            .create_book(&ctx, Book::new("Dune", "Herbert", "isbn-1").with_copies(1))
            .await
            .unwrap();
        let member = h
            .service
            .create_member(&ctx, Member::new("Ada", "ada@example.org"))
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 14, 9, 0, 0).unwrap();

        let loan = h.service.lend_book(&ctx, book.id, member.id, at).await.unwrap();
        let err = h.service.lend_book(&ctx, book.id, member.id, at).await.unwrap_err();
        assert!(matches!(err, CatalogError::NoCopiesAvailable { .. }));

        let done = h.service.complete_loan(&ctx, loan.id, at).await.unwrap();
        assert!(done.is_completed());
        let again = h.service.complete_loan(&ctx, loan.id, at).await.unwrap_err();
        assert!(matches!(again, CatalogError::LoanAlreadyCompleted { .. }));

        let book = h.service.repositories().books.find_by_id(book.id).await.unwrap().unwrap();
        assert_eq!(book.available_copies, 1);

        // Analytics options delay the task by ten seconds on the critical queue
        h.clock.advance(std::time::Duration::from_secs(10));
        let depths = h.broker.queue_depths().await.unwrap();
        assert_eq!(depths.get(CRITICAL_QUEUE), Some(&1));
        let lease = h.broker.dequeue(&[CRITICAL_QUEUE.to_string()]).await.unwrap().unwrap();
        assert_eq!(lease.info.state, TaskState::Processing);
        let payload: AnalyticsTaskPayload = serde_json::from_slice(&lease.task.payload).unwrap();
        assert_eq!(payload.loan.id, loan.id);
        assert_eq!(payload.member.id, member.id);
    }

    #[tokio::test]
    async fn test_failed_completion_leaves_loan_open() {
        let h = harness();
        let ctx = RequestContext::background();
        let book = h
            .service
            .create_book(&ctx, Book::new("Dune", "Herbert", "isbn-1").with_copies(1))
            .await
            .unwrap();
        let member = h
            .service
            .create_member(&ctx, Member::new("Ada", "ada@example.org"))
            .await
            .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 14, 9, 0, 0).unwrap();
        let loan = h.service.lend_book(&ctx, book.id, member.id, at).await.unwrap();
        let loans = h.service.repositories().loans.clone();

        // Member gone: nothing is written
        h.service.delete_member(&ctx, member.id).await.unwrap();
        h.service.background().settle().await;
        let err = h.service.complete_loan(&ctx, loan.id, at).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { kind: EntityKind::Member, .. }));
        assert!(!loans.find_by_id(loan.id).await.unwrap().unwrap().is_completed());

        // Book gone: the loan save is undone
        let member = h
            .service
            .create_member(&ctx, Member::new("Ada", "ada2@example.org"))
            .await
            .unwrap();
        let mut reassigned = loans.find_by_id(loan.id).await.unwrap().unwrap();
        reassigned.member_id = member.id;
        loans.save(reassigned).await.unwrap();
        h.service.delete_book(&ctx, book.id).await.unwrap();
        let err = h.service.complete_loan(&ctx, loan.id, at).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { kind: EntityKind::Book, .. }));
        assert!(!loans.find_by_id(loan.id).await.unwrap().unwrap().is_completed());

        // Book back in the catalog: the retry goes through
        let restored = Book::new("Dune", "Herbert", "isbn-1").with_copies(0);
        let created = h.service.repositories().books.create(restored).await.unwrap();
        let mut loan_row = loans.find_by_id(loan.id).await.unwrap().unwrap();
        loan_row.book_id = created.id;
        loans.save(loan_row).await.unwrap();

        let done = h.service.complete_loan(&ctx, loan.id, at).await.unwrap();
        assert!(done.is_completed());
        let book = h.service.repositories().books.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(book.available_copies, 1);

        h.clock.advance(std::time::Duration::from_secs(10));
        let depths = h.broker.queue_depths().await.unwrap();
        assert_eq!(depths.get(CRITICAL_QUEUE), Some(&1));
    }

    #[tokio::test]
    async fn test_cache_outage_falls_back_to_source_of_truth() {
        let h = harness();
        let ctx = RequestContext::background();
        let member = h
            .service
            .create_member(&ctx, Member::new("Ada", "ada@example.org"))
            .await
            .unwrap();
        h.service.background().settle().await;
        assert!(h.store.inner().len() > 0);

        h.store.set_outage(true);
        assert_eq!(h.service.get_member(&ctx, member.id).await.unwrap(), member);
        h.service.background().settle().await;
        assert!(h.service.cache_stats().snapshot().background_failed >= 1);
    }
}
