//! Per-request context: who is asking, and until when.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Interrupted;
use crate::permissions::Caller;

/// Carried by every blocking data source call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    caller: Caller,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Bind the request to an existing cancellation scope.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the request is already canceled or past its deadline.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` until it finishes, the token fires or the deadline passes.
    /// An interrupted `fut` is dropped before returning.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Canceled),
            _ = expiry => Err(Interrupted::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
