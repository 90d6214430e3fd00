//! Per-request deadline and cancellation
//!
//! Every cache and queue operation runs inside a `RequestContext`. When the caller's
//! request ends, work it started is interrupted; work that must outlive the request
//! (write-through after a read miss) gets an independent `background()` context.

use crate::error::{HandlerError, QueueError, StoreError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped a piece of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    DeadlineExceeded,
    Cancelled,
}

impl From<Interrupted> for StoreError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::DeadlineExceeded => StoreError::Timeout,
            Interrupted::Cancelled => StoreError::Cancelled,
        }
    }
}

impl From<Interrupted> for QueueError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::DeadlineExceeded => QueueError::Timeout,
            Interrupted::Cancelled => QueueError::Cancelled,
        }
    }
}

/// A handler that overran its deadline is retried
impl From<Interrupted> for HandlerError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::DeadlineExceeded => {
                HandlerError::Retry("handler deadline exceeded".into())
            }
            Interrupted::Cancelled => HandlerError::Retry("handler cancelled".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// No deadline, not tied to any caller
    pub fn background() -> Self {
        RequestContext {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        RequestContext {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Child that is cancelled with this context and may carry a tighter deadline
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout) {
            (Some(parent), Some(t)) => Some(parent.min(Instant::now() + t)),
            (None, Some(t)) => Some(Instant::now() + t),
            (parent, None) => parent,
        };
        RequestContext {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive `fut` to completion unless the context is cancelled or its deadline passes.
    pub async fn run<F, T, E>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled.into()),
            _ = deadline => Err(Interrupted::DeadlineExceeded.into()),
            result = fut => result,
        }
    }
}
