//! Analytics Pipeline End-to-End Tests
//!
//! Loans flow from the catalog service through the broker and the worker pool into the
//! ranked counters, and come back out through the analytics reports.

use chrono::{TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use lms_cache::analytics::{AnalyticsAggregator, AnalyticsService};
use lms_cache::clock::{ProductionClock, SharedClock};
use lms_cache::config::CatalogConfig;
use lms_cache::context::RequestContext;
use lms_cache::error::{HandlerError, QueueError};
use lms_cache::model::{Book, EntityKind, Loan, Member};
use lms_cache::pipeline::{
    AnalyticsHandler, AnalyticsTaskPayload, HandlerRegistry, InMemoryBroker, RetryBackoff, Task,
    TaskBroker, TaskDistributor, TaskHandler, TaskOptions, TaskState, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, ANALYTICS_TASK, CRITICAL_QUEUE, DEFAULT_QUEUE, LOW_QUEUE,
};
use lms_cache::repository::InMemoryRepository;
use lms_cache::service::{CatalogService, Repositories};
use lms_cache::store::{InMemoryStore, SharedStore};
use std::sync::Arc;
use std::time::Duration;

fn broker(clock: SharedClock) -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(
        clock,
        [CRITICAL_QUEUE, DEFAULT_QUEUE, LOW_QUEUE],
        RetryBackoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
        },
    ))
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        concurrency: 4,
        poll_interval: Duration::from_millis(5),
        task_timeout: Duration::from_secs(5),
        seed: Some(11),
        ..WorkerPoolConfig::default()
    }
}

async fn wait_for(handle: &WorkerPoolHandle, done: impl Fn(u64, u64) -> bool) {
    for _ in 0..1_000 {
        let stats = handle.stats();
        if done(stats.completed, stats.failed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker pool stalled: {:?}", handle.stats());
}

#[tokio::test]
async fn test_loan_event_reaches_book_and_member_buckets() {
    let clock: SharedClock = Arc::new(ProductionClock);
    let store: SharedStore = Arc::new(InMemoryStore::new(clock.clone()));
    let broker = broker(clock);
    let aggregator = AnalyticsAggregator::new(store, Default::default());

    let mut handlers = HandlerRegistry::new();
    handlers.register(ANALYTICS_TASK, Arc::new(AnalyticsHandler::new(aggregator.clone())));
    let pool = WorkerPool::new(broker.clone(), handlers, pool_config()).start();

    let mut book = Book::new("Dune", "Frank Herbert", "978-0441013593");
    book.id = 7;
    let mut member = Member::new("Ada", "ada@example.org");
    member.id = 3;
    let loan = Loan::new(7, 3, Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap());

    let options = TaskOptions::default().queue(CRITICAL_QUEUE);
    let distributor = TaskDistributor::new(broker.clone(), options);
    let ctx = RequestContext::with_timeout(Duration::from_secs(1));
    distributor
        .distribute_analytics(&ctx, &AnalyticsTaskPayload { book, loan, member }, None)
        .await
        .unwrap();

    wait_for(&pool, |completed, _| completed == 1).await;
    let books = aggregator.query_top(&ctx, EntityKind::Book, &[7], 10).await.unwrap();
    assert_eq!(books[0].count("2024/3"), Some(1));
    let members = aggregator.query_top(&ctx, EntityKind::Member, &[3], 10).await.unwrap();
    assert_eq!(members[0].count("2024/3/11"), Some(1));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_payload_counts_every_delivery() {
    let clock: SharedClock = Arc::new(ProductionClock);
    let store: SharedStore = Arc::new(InMemoryStore::new(clock.clone()));
    let broker = broker(clock);
    let aggregator = AnalyticsAggregator::new(store, Default::default());

    let mut handlers = HandlerRegistry::new();
    handlers.register(ANALYTICS_TASK, Arc::new(AnalyticsHandler::new(aggregator.clone())));
    let pool = WorkerPool::new(broker.clone(), handlers, pool_config()).start();

    let mut book = Book::new("Dune", "Frank Herbert", "978-0441013593");
    book.id = 7;
    let mut member = Member::new("Ada", "ada@example.org");
    member.id = 3;
    let loan = Loan::new(7, 3, Utc.with_ymd_and_hms(2024, 3, 14, 12, 0, 0).unwrap());
    let payload = AnalyticsTaskPayload { book, loan, member };

    // The same logical event delivered three times
    let options = TaskOptions::default().queue(CRITICAL_QUEUE);
    let distributor = TaskDistributor::new(broker.clone(), options);
    let ctx = RequestContext::background();
    for _ in 0..3 {
        distributor.distribute_analytics(&ctx, &payload, None).await.unwrap();
    }

    wait_for(&pool, |completed, _| completed == 3).await;
    let books = aggregator.query_top(&ctx, EntityKind::Book, &[7], 10).await.unwrap();
    assert_eq!(books[0].count("2024/3"), Some(3));
    let members = aggregator.query_top(&ctx, EntityKind::Member, &[3], 10).await.unwrap();
    assert_eq!(members[0].count("2024/3/11"), Some(3));
    pool.shutdown().await;
}

struct AlwaysRetry;

impl TaskHandler for AlwaysRetry {
    fn handle<'a>(
        &'a self,
        _ctx: &'a RequestContext,
        _task: &'a Task,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        async { Err(HandlerError::Retry("downstream unavailable".into())) }.boxed()
    }
}

#[tokio::test]
async fn test_exhausted_retries_fail_without_blocking_other_tasks() {
    let clock: SharedClock = Arc::new(ProductionClock);
    let store: SharedStore = Arc::new(InMemoryStore::new(clock.clone()));
    let broker = broker(clock);
    let aggregator = AnalyticsAggregator::new(store, Default::default());

    let mut handlers = HandlerRegistry::new();
    handlers.register(ANALYTICS_TASK, Arc::new(AnalyticsHandler::new(aggregator)));
    handlers.register("task:flaky", Arc::new(AlwaysRetry));
    let pool = WorkerPool::new(broker.clone(), handlers, pool_config()).start();

    let flaky = broker
        .enqueue(
            Task::new("task:flaky", "{}"),
            TaskOptions::default().max_retry(2).queue(DEFAULT_QUEUE),
        )
        .await
        .unwrap();
    let malformed = broker
        .enqueue(Task::new(ANALYTICS_TASK, "not json"), TaskOptions::default().queue(LOW_QUEUE))
        .await
        .unwrap();

    let mut book = Book::new("Dune", "Frank Herbert", "978-0441013593");
    book.id = 1;
    let mut member = Member::new("Ada", "ada@example.org");
    member.id = 1;
    let payload = AnalyticsTaskPayload {
        book,
        loan: Loan::new(1, 1, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()),
        member,
    };
    let options = TaskOptions::default().queue(CRITICAL_QUEUE);
    let distributor = TaskDistributor::new(broker.clone(), options);
    let good = distributor
        .distribute_analytics(&RequestContext::background(), &payload, None)
        .await
        .unwrap();

    wait_for(&pool, |completed, failed| completed == 1 && failed == 2).await;
    let stats = pool.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.skipped, 1);

    let flaky = broker.task_info(flaky.id).await.unwrap();
    assert_eq!(flaky.state, TaskState::Failed);
    assert_eq!(flaky.retried, 2);
    assert_eq!(flaky.last_error.as_deref(), Some("downstream unavailable"));
    assert_eq!(broker.task_info(malformed.id).await.unwrap().state, TaskState::Failed);
    // Completed tasks are not retained by default
    assert!(matches!(broker.task_info(good.id).await, Err(QueueError::TaskNotFound(_))));

    let failed: Vec<u64> = broker.failed_tasks().await.unwrap().iter().map(|t| t.id).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&flaky.id) && failed.contains(&malformed.id));
    pool.shutdown().await;
}

#[tokio::test]
async fn test_completed_loans_show_up_in_reports() {
    let clock: SharedClock = Arc::new(ProductionClock);
    let store: SharedStore = Arc::new(InMemoryStore::new(clock.clone()));
    let broker = broker(clock);
    let repos = Repositories {
        books: Arc::new(InMemoryRepository::<Book>::new()),
        members: Arc::new(InMemoryRepository::<Member>::new()),
        loans: Arc::new(InMemoryRepository::<Loan>::new()),
    };

    let mut config = CatalogConfig::default();
    config.analytics.task = TaskOptions::default().queue(CRITICAL_QUEUE).max_retry(3);
    config.cache.seed = Some(5);
    let service =
        CatalogService::from_config(&config, store.clone(), repos.clone(), broker.clone());

    let aggregator = AnalyticsAggregator::new(store, config.analytics.key_encoder());
    let mut handlers = HandlerRegistry::new();
    handlers.register(ANALYTICS_TASK, Arc::new(AnalyticsHandler::new(aggregator.clone())));
    let pool = WorkerPool::new(broker.clone(), handlers, pool_config()).start();

    let ctx = RequestContext::background();
    service.reserve_filters(&ctx).await.unwrap();
    let book = service
        .create_book(&ctx, Book::new("Dune", "Frank Herbert", "978-0441013593").with_copies(2))
        .await
        .unwrap();
    let ada = service.create_member(&ctx, Member::new("Ada", "ada@example.org")).await.unwrap();
    let grace = service
        .create_member(&ctx, Member::new("Grace", "grace@example.org"))
        .await
        .unwrap();

    let march = Utc.with_ymd_and_hms(2024, 3, 14, 10, 0, 0).unwrap();
    let april = Utc.with_ymd_and_hms(2024, 4, 2, 10, 0, 0).unwrap();
    for (member, date) in [(&ada, march), (&grace, march), (&ada, april)] {
        let loan = service.lend_book(&ctx, book.id, member.id, date).await.unwrap();
        service.complete_loan(&ctx, loan.id, date).await.unwrap();
    }

    wait_for(&pool, |completed, _| completed == 3).await;
    let reports = AnalyticsService::new(aggregator, repos.books.clone(), repos.members.clone(), 10);
    let (books, members) = reports.first_page_reports(&ctx, 10).await.unwrap();

    let entry = books.entry(book.id).unwrap();
    assert_eq!(entry.buckets[0].label, "2024/3");
    assert_eq!(entry.count("2024/3"), Some(2));
    assert_eq!(entry.count("2024/4"), Some(1));
    assert_eq!(members.entry(ada.id).and_then(|e| e.count("2024/4/14")), Some(1));
    assert_eq!(members.entry(grace.id).and_then(|e| e.count("2024/3/11")), Some(1));

    pool.shutdown().await;
    service.shutdown().await;
}
