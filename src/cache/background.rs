//! Bounded runner for fire-and-forget side effects
//!
//! Cache population and invalidation after a source-of-truth write run here, detached
//! from the request. Each job gets one attempt; failures are logged and counted. When
//! the in-flight limit is reached new jobs are dropped, never queued.

use super::CacheStats;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct BackgroundRunner {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for BackgroundRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRunner")
            .field("in_flight", &self.tracker.len())
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl BackgroundRunner {
    pub fn new(max_in_flight: usize, stats: Arc<CacheStats>) -> Self {
        BackgroundRunner {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            shutdown: CancellationToken::new(),
            stats,
        }
    }

    /// Run `job` detached. Returns false if it was dropped.
    pub fn spawn<F, E>(&self, job_name: &'static str, job: F) -> bool
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.tracker.is_closed() || self.shutdown.is_cancelled() {
            self.stats.record_background_dropped();
            debug!(job = job_name, "background runner closed, dropping job");
            return false;
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats.record_background_dropped();
                warn!(job = job_name, "background runner saturated, dropping job");
                return false;
            }
        };

        let shutdown = self.shutdown.clone();
        let stats = self.stats.clone();
        self.tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(job = job_name, "background job cancelled");
                }
                result = job => {
                    if let Err(e) = result {
                        stats.record_background_failed();
                        warn!(job = job_name, error = %e, "background job failed");
                    }
                }
            }
        });
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until no job is in flight, without closing the runner.
    pub async fn settle(&self) {
        while !self.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Stop accepting jobs and wait for the running ones.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Stop accepting jobs, cancel the running ones and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.shutdown.cancel();
        self.tracker.wait().await;
    }
}
