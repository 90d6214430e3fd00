//! In-process broker
//!
//! Holds per-queue FIFO lists of ready tasks, a schedule of delayed and backing-off
//! tasks ordered by due time, and the terminal failed set. Time comes from the injected
//! clock, so delays and backoff are deterministic under `SimulatedClock`.
//!
//! Finished tasks are pruned according to `Retention`: completed tasks are dropped on
//! completion unless a retention window is set, and the failed set is capped by size
//! and age.

use super::{Lease, Task, TaskBroker, TaskId, TaskInfo, TaskOptions, TaskState};
use crate::clock::{SharedClock, Timestamp};
use crate::error::QueueError;
use ahash::AHashMap;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error};

/// Exponential backoff between attempts: base, 2*base, 4*base ... capped at max
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(600),
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// How long finished tasks stay inspectable through `task_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Zero drops a task as soon as it completes
    pub completed: Duration,
    /// Failed tasks older than this are dropped
    pub failed: Duration,
    /// Oldest failed tasks are dropped past this size
    pub max_failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            completed: Duration::ZERO,
            failed: Duration::from_secs(90 * 24 * 3600),
            max_failed: 10_000,
        }
    }
}

struct TaskRecord {
    info: TaskInfo,
    task: Task,
}

#[derive(Default)]
struct BrokerState {
    next_id: TaskId,
    records: AHashMap<TaskId, TaskRecord>,
    ready: BTreeMap<String, VecDeque<TaskId>>,
    scheduled: BinaryHeap<Reverse<(Timestamp, TaskId)>>,
    /// (expires at, id), oldest first
    completed: VecDeque<(Timestamp, TaskId)>,
    /// (failed at, id), oldest first
    failed: VecDeque<(Timestamp, TaskId)>,
}

impl BrokerState {
    fn record_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, QueueError> {
        self.records.get_mut(&id).ok_or(QueueError::TaskNotFound(id))
    }

    /// Move every due task from the schedule to the tail of its queue
    fn promote_due(&mut self, now: Timestamp) {
        while let Some(Reverse((due, id))) = self.scheduled.peek().copied() {
            if due > now {
                break;
            }
            self.scheduled.pop();

            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if matches!(record.info.state, TaskState::Delayed | TaskState::Retrying) {
                record.info.state = TaskState::Enqueued;
                if let Some(queue) = self.ready.get_mut(&record.info.queue) {
                    queue.push_back(id);
                }
            }
        }
    }

    /// Drop completed tasks past their window and failed tasks past the cap or age
    fn prune(&mut self, now: Timestamp, retention: &Retention) {
        while let Some(&(expires, id)) = self.completed.front() {
            if expires > now {
                break;
            }
            self.completed.pop_front();
            self.records.remove(&id);
        }
        while let Some(&(failed_at, id)) = self.failed.front() {
            if self.failed.len() <= retention.max_failed && failed_at + retention.failed > now {
                break;
            }
            self.failed.pop_front();
            self.records.remove(&id);
        }
    }
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    clock: SharedClock,
    backoff: RetryBackoff,
    retention: Retention,
    work: Notify,
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryBroker")
            .field("tasks", &state.records.len())
            .field("scheduled", &state.scheduled.len())
            .field("completed", &state.completed.len())
            .field("failed", &state.failed.len())
            .finish()
    }
}

impl InMemoryBroker {
    pub fn new<I, Q>(clock: SharedClock, queues: I, backoff: RetryBackoff) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        let ready = queues
            .into_iter()
            .map(|q| (q.into(), VecDeque::new()))
            .collect();
        InMemoryBroker {
            state: Mutex::new(BrokerState {
                next_id: 1,
                ready,
                ..BrokerState::default()
            }),
            clock,
            backoff,
            retention: Retention::default(),
            work: Notify::new(),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    fn enqueue_now(&self, task: Task, options: TaskOptions) -> Result<TaskInfo, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.ready.contains_key(&options.queue) {
            return Err(QueueError::UnknownQueue(options.queue));
        }

        let id = state.next_id;
        state.next_id += 1;

        let delayed = !options.delay.is_zero();
        let info = TaskInfo {
            id,
            type_name: task.type_name.clone(),
            queue: options.queue.clone(),
            state: if delayed {
                TaskState::Delayed
            } else {
                TaskState::Enqueued
            },
            retried: 0,
            max_retry: options.max_retry,
            last_error: None,
            enqueued_at: now,
            process_at: now + options.delay,
        };

        if delayed {
            state.scheduled.push(Reverse((info.process_at, id)));
        } else if let Some(queue) = state.ready.get_mut(&options.queue) {
            queue.push_back(id);
        }
        state.records.insert(
            id,
            TaskRecord {
                info: info.clone(),
                task,
            },
        );
        drop(state);

        if !delayed {
            self.work.notify_one();
        }
        debug!(task_id = id, queue = %info.queue, state = ?info.state, "task enqueued");
        Ok(info)
    }

    fn dequeue_now(&self, queues: &[String]) -> Option<Lease> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.promote_due(now);

        for name in queues {
            let Some(id) = state.ready.get_mut(name).and_then(VecDeque::pop_front) else {
                continue;
            };
            if let Some(record) = state.records.get_mut(&id) {
                record.info.state = TaskState::Processing;
                return Some(Lease {
                    info: record.info.clone(),
                    task: record.task.clone(),
                });
            }
        }
        None
    }

    fn complete_now(&self, id: TaskId) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if self.retention.completed.is_zero() {
            state.records.remove(&id).ok_or(QueueError::TaskNotFound(id))?;
        } else {
            let record = state.record_mut(id)?;
            record.info.state = TaskState::Completed;
            // Payload is not needed once the task is done
            record.task.payload = Bytes::new();
            state.completed.push_back((now + self.retention.completed, id));
        }
        state.prune(now, &self.retention);
        Ok(())
    }

    fn fail_now(
        &self,
        id: TaskId,
        reason: String,
        retryable: bool,
    ) -> Result<TaskState, QueueError> {
        let now = self.clock.now();
        let backoff = self.backoff;
        let mut state = self.state.lock();
        let record = state.record_mut(id)?;
        record.info.last_error = Some(reason);

        if retryable && record.info.retried < record.info.max_retry {
            record.info.retried += 1;
            record.info.state = TaskState::Retrying;
            record.info.process_at = now + backoff.delay(record.info.retried);
            let due = record.info.process_at;
            debug!(task_id = id, retried = record.info.retried, "task scheduled for retry");
            state.scheduled.push(Reverse((due, id)));
            return Ok(TaskState::Retrying);
        }

        record.info.state = TaskState::Failed;
        error!(
            task_id = id,
            queue = %record.info.queue,
            retried = record.info.retried,
            error = record.info.last_error.as_deref().unwrap_or_default(),
            "task moved to failed set"
        );
        state.failed.push_back((now, id));
        state.prune(now, &self.retention);
        Ok(TaskState::Failed)
    }

    fn task_info_now(&self, id: TaskId) -> Result<TaskInfo, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, &self.retention);
        state
            .records
            .get(&id)
            .map(|r| r.info.clone())
            .ok_or(QueueError::TaskNotFound(id))
    }

    fn failed_now(&self) -> Vec<TaskInfo> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now, &self.retention);
        state
            .failed
            .iter()
            .filter_map(|(_, id)| state.records.get(id))
            .map(|r| r.info.clone())
            .collect()
    }

    fn depths_now(&self) -> BTreeMap<String, usize> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.promote_due(now);
        state.prune(now, &self.retention);
        state
            .ready
            .iter()
            .map(|(name, queue)| (name.clone(), queue.len()))
            .collect()
    }
}

impl TaskBroker for InMemoryBroker {
    fn enqueue(
        &self,
        task: Task,
        options: TaskOptions,
    ) -> BoxFuture<'_, Result<TaskInfo, QueueError>> {
        futures::future::ready(self.enqueue_now(task, options)).boxed()
    }

    fn dequeue(&self, queues: &[String]) -> BoxFuture<'_, Result<Option<Lease>, QueueError>> {
        futures::future::ready(Ok(self.dequeue_now(queues))).boxed()
    }

    fn complete(&self, id: TaskId) -> BoxFuture<'_, Result<(), QueueError>> {
        futures::future::ready(self.complete_now(id)).boxed()
    }

    fn fail(
        &self,
        id: TaskId,
        error: String,
        retryable: bool,
    ) -> BoxFuture<'_, Result<TaskState, QueueError>> {
        futures::future::ready(self.fail_now(id, error, retryable)).boxed()
    }

    fn task_info(&self, id: TaskId) -> BoxFuture<'_, Result<TaskInfo, QueueError>> {
        futures::future::ready(self.task_info_now(id)).boxed()
    }

    fn failed_tasks(&self) -> BoxFuture<'_, Result<Vec<TaskInfo>, QueueError>> {
        futures::future::ready(Ok(self.failed_now())).boxed()
    }

    fn queue_depths(&self) -> BoxFuture<'_, Result<BTreeMap<String, usize>, QueueError>> {
        futures::future::ready(Ok(self.depths_now())).boxed()
    }

    fn wait_for_work(&self) -> BoxFuture<'_, ()> {
        self.work.notified().boxed()
    }
}
