//! Catalog core demo
//!
//! Wires the cache, the task pipeline and in-memory sources of truth, runs one loan
//! through the analytics pipeline and logs the resulting reports.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | LMS_CONFIG | unset | TOML file loaded before the overlay |
//! | LMS_STORE__URL | unset | Redis URL; unset runs the in-memory store |
//! | LMS_LOG__LEVEL | info | Log filter (`RUST_LOG` wins) |
//! | LMS_LOG__JSON | false | JSON log lines |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use chrono::Utc;
use lms_cache::analytics::{AnalyticsAggregator, AnalyticsService};
use lms_cache::clock::{ProductionClock, SharedClock};
use lms_cache::config::CatalogConfig;
use lms_cache::context::RequestContext;
use lms_cache::error::StoreError;
use lms_cache::model::{Book, Loan, Member};
use lms_cache::pipeline::{
    AnalyticsHandler, HandlerRegistry, InMemoryBroker, TaskBroker, WorkerPool, ANALYTICS_TASK,
};
use lms_cache::repository::InMemoryRepository;
use lms_cache::service::{CatalogService, Repositories};
use lms_cache::store::{ExpiryReaper, InMemoryStore, SharedStore};
use lms_cache::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn open_store(
    config: &CatalogConfig,
    clock: SharedClock,
    shutdown: &CancellationToken,
) -> Result<SharedStore, StoreError> {
    #[cfg(feature = "redis-store")]
    {
        if let Some(url) = &config.store.url {
            let store = lms_cache::store::RedisStore::connect(url).await?;
            return Ok(Arc::new(store));
        }
    }
    #[cfg(not(feature = "redis-store"))]
    {
        if config.store.url.is_some() {
            warn!("store.url is set but redis support is not compiled in, using in-memory store");
        }
    }

    let store = InMemoryStore::new(clock);
    let reaper = ExpiryReaper::new(store.clone(), config.store.reaper_interval);
    tokio::spawn(reaper.run(shutdown.clone()));
    info!(
        reaper_interval_ms = config.store.reaper_interval.as_millis() as u64,
        "using in-memory store"
    );
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CatalogConfig::from_env()?;
    telemetry::init_tracing(&config.log);

    let clock: SharedClock = Arc::new(ProductionClock);
    let shutdown = CancellationToken::new();
    let store = open_store(&config, clock.clone(), &shutdown).await?;

    let broker = Arc::new(
        InMemoryBroker::new(clock, config.queue.queue_names(), config.queue.backoff())
            .with_retention(config.queue.retention()),
    );
    let repos = Repositories {
        books: Arc::new(InMemoryRepository::<Book>::new()),
        members: Arc::new(InMemoryRepository::<Member>::new()),
        loans: Arc::new(InMemoryRepository::<Loan>::new()),
    };
    let service =
        CatalogService::from_config(&config, store.clone(), repos.clone(), broker.clone());

    let ctx = RequestContext::background();
    if let Err(e) = service.reserve_filters(&ctx).await {
        warn!(error = %e, "could not reserve membership filters, created on first use");
    }

    let aggregator = AnalyticsAggregator::new(store.clone(), config.analytics.key_encoder());
    let mut handlers = HandlerRegistry::new();
    handlers.register(ANALYTICS_TASK, Arc::new(AnalyticsHandler::new(aggregator.clone())));
    let pool = WorkerPool::new(broker.clone(), handlers, config.queue.worker_pool_config()).start();

    let book = service
        .create_book(
            &ctx,
            Book::new("The Left Hand of Darkness", "Ursula K. Le Guin", "978-0441478125")
                .with_copies(2),
        )
        .await?;
    let member = service
        .create_member(&ctx, Member::new("Ada Lovelace", "ada@example.org"))
        .await?;
    let loan = service.lend_book(&ctx, book.id, member.id, Utc::now()).await?;
    service.complete_loan(&ctx, loan.id, Utc::now()).await?;

    let wait = config.analytics.task.delay + config.queue.poll_interval * 2;
    info!(wait_ms = wait.as_millis() as u64, "waiting for the analytics task");
    let deadline = tokio::time::Instant::now() + wait;
    let finished = || pool.stats().completed + pool.stats().failed > 0;
    while !finished() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let top_limit = config.analytics.top_limit;
    let reports = AnalyticsService::new(aggregator, repos.books, repos.members, top_limit)
        .with_stats(service.cache_stats().clone());
    let (books, members) = reports.first_page_reports(&ctx, 10).await?;
    info!(report = %serde_json::to_string(&books)?, "book analytics");
    info!(report = %serde_json::to_string(&members)?, "member analytics");

    pool.shutdown().await;
    service.shutdown().await;
    shutdown.cancel();

    let failed = broker.failed_tasks().await?;
    info!(
        cache = ?service.cache_stats().snapshot(),
        failed_tasks = failed.len(),
        "demo finished"
    );
    Ok(())
}
