//! Timeout utilities.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// An operation did not finish within its time budget.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Run an operation with a timeout.
pub async fn with_timeout<T, F, Fut>(timeout: Duration, operation: F) -> Result<T, TimedOut>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation())
        .await
        .map_err(|_| TimedOut(timeout))
}
