//! Asynchronous task pipeline
//!
//! Producer side: `TaskDistributor` serializes a payload and enqueues it with options.
//! Consumer side: `WorkerPool` pulls from weighted named queues and dispatches by type
//! tag to registered `TaskHandler`s. The `TaskBroker` owns scheduling, delays and retry
//! bookkeeping; handlers only classify their own failures.
//!
//! Task lifecycle:
//!
//! ```text
//! enqueue ──► Delayed ──(due)──► Enqueued ──► Processing ──► Completed
//!                ▲                                 │
//!                └──────── Retrying(n) ◄───────────┤ retryable, budget left
//!                                                  └──► Failed
//! ```

mod broker;
mod distributor;
mod handler;
mod processor;

pub use broker::{InMemoryBroker, Retention, RetryBackoff};
pub use distributor::{AnalyticsTaskPayload, TaskDistributor};
pub use handler::AnalyticsHandler;
pub use processor::{
    HandlerRegistry, PoolStats, PoolStatsSnapshot, QueueSelector, TaskHandler, WorkerPool,
    WorkerPoolConfig, WorkerPoolHandle,
};

use crate::clock::Timestamp;
use crate::error::QueueError;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Type tag of the loan-analytics task
pub const ANALYTICS_TASK: &str = "task:orders_analytics";

pub const CRITICAL_QUEUE: &str = "critical";
pub const DEFAULT_QUEUE: &str = "default";
pub const LOW_QUEUE: &str = "low";

pub type TaskId = u64;

/// Type tag plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub type_name: String,
    pub payload: Bytes,
}

impl Task {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Task {
            type_name: type_name.into(),
            payload: payload.into(),
        }
    }
}

/// Producer-chosen delivery options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Retries after the first attempt
    pub max_retry: u32,
    /// Initial delay before the first attempt
    #[serde(with = "crate::config::duration_ms")]
    pub delay: Duration,
    pub queue: String,
}

impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions {
            max_retry: 25,
            delay: Duration::ZERO,
            queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl TaskOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its initial delay
    Delayed,
    /// Ready to be picked up
    Enqueued,
    Processing,
    /// Waiting out a backoff before the next attempt
    Retrying,
    Completed,
    /// Terminal: non-retryable error or retries exhausted
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Broker-side view of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub type_name: String,
    pub queue: String,
    pub state: TaskState,
    /// Retries used so far
    pub retried: u32,
    pub max_retry: u32,
    pub last_error: Option<String>,
    pub enqueued_at: Timestamp,
    /// When the task becomes (or became) ready
    pub process_at: Timestamp,
}

/// A task handed to exactly one worker until it reports back
#[derive(Debug, Clone)]
pub struct Lease {
    pub info: TaskInfo,
    pub task: Task,
}

pub type SharedBroker = Arc<dyn TaskBroker>;

/// Queue broker seam
pub trait TaskBroker: Send + Sync + 'static {
    fn enqueue(
        &self,
        task: Task,
        options: TaskOptions,
    ) -> BoxFuture<'_, Result<TaskInfo, QueueError>>;

    /// Take the next ready task, trying `queues` in order. None if all are empty.
    fn dequeue(&self, queues: &[String]) -> BoxFuture<'_, Result<Option<Lease>, QueueError>>;

    fn complete(&self, id: TaskId) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Report a failed attempt. Returns `Retrying` or `Failed`.
    fn fail(
        &self,
        id: TaskId,
        error: String,
        retryable: bool,
    ) -> BoxFuture<'_, Result<TaskState, QueueError>>;

    fn task_info(&self, id: TaskId) -> BoxFuture<'_, Result<TaskInfo, QueueError>>;

    /// Tasks in the terminal failed state
    fn failed_tasks(&self) -> BoxFuture<'_, Result<Vec<TaskInfo>, QueueError>>;

    /// Ready tasks per queue
    fn queue_depths(&self) -> BoxFuture<'_, Result<BTreeMap<String, usize>, QueueError>>;

    /// Resolves when new work may be available
    fn wait_for_work(&self) -> BoxFuture<'_, ()>;
}
