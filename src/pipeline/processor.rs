//! Consumer side: weighted queue selection, handler dispatch and the worker pool

use super::{Lease, SharedBroker, Task, TaskState};
use crate::context::RequestContext;
use crate::error::HandlerError;
use ahash::AHashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Handles every task of one type tag
pub trait TaskHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Type tag -> handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: AHashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> &mut Self {
        self.handlers.insert(type_name.into(), handler);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(type_name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Picks the order in which a worker polls the queues.
///
/// Each queue is entered `weight` times into a list that is shuffled and then
/// de-duplicated, so a queue with weight 10 comes first ten times as often as one
/// with weight 1, and every queue is still polled when the ones before it are empty.
pub struct QueueSelector {
    weights: Vec<(String, u32)>,
    rng: Mutex<ChaCha8Rng>,
}

impl QueueSelector {
    pub fn new(weights: Vec<(String, u32)>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        QueueSelector {
            weights,
            rng: Mutex::new(rng),
        }
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.weights.iter().map(|(q, _)| q.as_str())
    }

    pub fn order(&self) -> Vec<String> {
        let mut expanded: Vec<&str> = self
            .weights
            .iter()
            .flat_map(|(queue, weight)| std::iter::repeat(queue.as_str()).take(*weight as usize))
            .collect();
        expanded.shuffle(&mut *self.rng.lock());

        let mut order: Vec<String> = Vec::with_capacity(self.weights.len());
        for queue in expanded {
            if !order.iter().any(|q| q == queue) {
                order.push(queue.to_string());
            }
        }
        order
    }
}

#[derive(Debug, Default)]
pub struct PoolStats {
    processed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Attempts started
    pub processed: u64,
    pub completed: u64,
    /// Attempts that failed and were rescheduled
    pub retried: u64,
    /// Tasks that reached the failed set
    pub failed: u64,
    /// Failures the handler marked non-retryable
    pub skipped: u64,
}

impl PoolStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers; each runs at most one task at a time
    pub concurrency: usize,
    /// Upper bound on how long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Deadline of one handler invocation
    pub task_timeout: Duration,
    /// Queue name and weight
    pub queues: Vec<(String, u32)>,
    /// Seed for queue selection; None seeds from the OS
    pub seed: Option<u64>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            concurrency: 10,
            poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(1800),
            queues: vec![
                (super::CRITICAL_QUEUE.to_string(), 10),
                (super::DEFAULT_QUEUE.to_string(), 3),
                (super::LOW_QUEUE.to_string(), 1),
            ],
            seed: None,
        }
    }
}

struct PoolShared {
    broker: SharedBroker,
    handlers: HandlerRegistry,
    selector: QueueSelector,
    poll_interval: Duration,
    task_timeout: Duration,
    stats: Arc<PoolStats>,
}

impl PoolShared {
    async fn run_worker(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        debug!(worker, "worker started");

        while !shutdown.is_cancelled() {
            let order = self.selector.order();
            match self.broker.dequeue(&order).await {
                Ok(Some(lease)) => self.process(worker, lease).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.broker.wait_for_work() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        debug!(worker, "worker stopped");
    }

    async fn process(&self, worker: usize, lease: Lease) {
        let Lease { info, task } = lease;
        PoolStats::bump(&self.stats.processed);
        debug!(
            worker,
            task_id = info.id,
            queue = %info.queue,
            task_type = %task.type_name,
            "processing task"
        );

        let outcome = match self.handlers.get(&task.type_name) {
            Some(handler) => {
                let ctx = RequestContext::with_timeout(self.task_timeout);
                ctx.run(handler.handle(&ctx, &task)).await
            }
            None => Err(HandlerError::SkipRetry(format!(
                "no handler registered for '{}'",
                task.type_name
            ))),
        };

        match outcome {
            Ok(()) => match self.broker.complete(info.id).await {
                Ok(()) => {
                    PoolStats::bump(&self.stats.completed);
                    debug!(worker, task_id = info.id, "task completed");
                }
                Err(e) => {
                    warn!(worker, task_id = info.id, error = %e, "failed to mark task completed")
                }
            },
            Err(err) => {
                let retryable = matches!(err, HandlerError::Retry(_));
                if !retryable {
                    PoolStats::bump(&self.stats.skipped);
                }
                match self.broker.fail(info.id, err.to_string(), retryable).await {
                    Ok(TaskState::Retrying) => {
                        PoolStats::bump(&self.stats.retried);
                        warn!(worker, task_id = info.id, error = %err, "task failed, will retry");
                    }
                    Ok(_) => {
                        PoolStats::bump(&self.stats.failed);
                        error!(worker, task_id = info.id, error = %err, "task failed permanently");
                    }
                    Err(e) => {
                        warn!(worker, task_id = info.id, error = %e, "failed to report failure")
                    }
                }
            }
        }
    }
}

pub struct WorkerPool {
    broker: SharedBroker,
    handlers: HandlerRegistry,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(broker: SharedBroker, handlers: HandlerRegistry, config: WorkerPoolConfig) -> Self {
        WorkerPool {
            broker,
            handlers,
            config,
        }
    }

    /// Spawn the workers on the current runtime.
    pub fn start(self) -> WorkerPoolHandle {
        let WorkerPool {
            broker,
            handlers,
            config,
        } = self;

        let stats = Arc::new(PoolStats::default());
        let workers = config.concurrency.max(1);
        let shared = Arc::new(PoolShared {
            broker,
            handlers,
            selector: QueueSelector::new(config.queues, config.seed),
            poll_interval: config.poll_interval,
            task_timeout: config.task_timeout,
            stats: stats.clone(),
        });

        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        for worker in 0..workers {
            tracker.spawn(shared.clone().run_worker(worker, shutdown.clone()));
        }
        tracker.close();

        info!(
            workers,
            queues = ?shared.selector.queues().collect::<Vec<_>>(),
            handlers = shared.handlers.len(),
            "worker pool started"
        );
        WorkerPoolHandle {
            tracker,
            shutdown,
            stats,
            workers,
        }
    }
}

pub struct WorkerPoolHandle {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    stats: Arc<PoolStats>,
    workers: usize,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop polling; tasks already picked up run to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!(stats = ?self.stats.snapshot(), "worker pool stopped");
    }
}
