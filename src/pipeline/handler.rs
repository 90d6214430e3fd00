use super::{AnalyticsTaskPayload, Task, TaskHandler};
use crate::analytics::AnalyticsAggregator;
use crate::context::RequestContext;
use crate::error::HandlerError;
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, error};

/// Consumes analytics tasks: one book-month and one member-week increment per loan.
///
/// A payload that does not decode is never retried. Counter update failures are
/// logged and the task still completes, so a store outage loses those increments
/// instead of stalling the queue.
#[derive(Debug, Clone)]
pub struct AnalyticsHandler {
    aggregator: AnalyticsAggregator,
}

impl AnalyticsHandler {
    pub fn new(aggregator: AnalyticsAggregator) -> Self {
        AnalyticsHandler { aggregator }
    }

    async fn process(&self, ctx: &RequestContext, task: &Task) -> Result<(), HandlerError> {
        let payload: AnalyticsTaskPayload = serde_json::from_slice(&task.payload).map_err(|e| {
            error!(task_type = %task.type_name, error = %e, "failed to decode analytics payload");
            HandlerError::SkipRetry(format!("decode analytics payload: {e}"))
        })?;

        let book_id = payload.book.id;
        let member_id = payload.loan.member_id;
        let (book, member) = self
            .aggregator
            .record_loan(ctx, book_id, member_id, &payload.loan.loan_date)
            .await;

        match book {
            Ok(count) => debug!(book_id, count, "book analytics updated"),
            Err(e) => error!(book_id, error = %e, "failed to update book analytics"),
        }
        match member {
            Ok(count) => debug!(member_id, count, "member analytics updated"),
            Err(e) => error!(member_id, error = %e, "failed to update member analytics"),
        }
        Ok(())
    }
}

impl TaskHandler for AnalyticsHandler {
    fn handle<'a>(
        &'a self,
        ctx: &'a RequestContext,
        task: &'a Task,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.process(ctx, task).boxed()
    }
}
