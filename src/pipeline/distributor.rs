use super::{SharedBroker, Task, TaskInfo, TaskOptions, ANALYTICS_TASK, CRITICAL_QUEUE};
use crate::context::RequestContext;
use crate::error::QueueError;
use crate::model::{Book, Loan, Member};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Body of an analytics task: the completed loan with its book and member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsTaskPayload {
    pub book: Book,
    pub loan: Loan,
    pub member: Member,
}

/// Producer side of the pipeline
#[derive(Clone)]
pub struct TaskDistributor {
    broker: SharedBroker,
    analytics_options: TaskOptions,
}

impl std::fmt::Debug for TaskDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDistributor")
            .field("analytics_options", &self.analytics_options)
            .finish_non_exhaustive()
    }
}

impl TaskDistributor {
    pub fn new(broker: SharedBroker, analytics_options: TaskOptions) -> Self {
        TaskDistributor {
            broker,
            analytics_options,
        }
    }

    /// Ten retries, ten seconds out, on the critical queue
    pub fn default_analytics_options() -> TaskOptions {
        TaskOptions::default()
            .max_retry(10)
            .process_in(Duration::from_secs(10))
            .queue(CRITICAL_QUEUE)
    }

    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Enqueue an analytics task. `options` overrides the configured defaults.
    pub async fn distribute_analytics(
        &self,
        ctx: &RequestContext,
        payload: &AnalyticsTaskPayload,
        options: Option<TaskOptions>,
    ) -> Result<TaskInfo, QueueError> {
        let body = serde_json::to_vec(payload)?;
        let options = options.unwrap_or_else(|| self.analytics_options.clone());
        let task = Task::new(ANALYTICS_TASK, body);

        let info = ctx.run(self.broker.enqueue(task, options)).await?;
        info!(
            task_id = info.id,
            task_type = %info.type_name,
            queue = %info.queue,
            max_retry = info.max_retry,
            loan_id = payload.loan.id,
            "enqueued task"
        );
        Ok(info)
    }
}
