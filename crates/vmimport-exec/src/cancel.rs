//! Cancellation and deadline scope shared by every blocking call

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scope stopped an operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The scope's token was cancelled
    #[error("operation cancelled")]
    Cancelled,
    /// The scope's deadline passed
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl CancelReason {
    /// Wrap the reason in an `io::Error` so it can travel through readers and writers
    #[must_use]
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::DeadlineExceeded => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, self)
    }

    /// Recover a reason previously wrapped with [`CancelReason::into_io`]
    #[must_use]
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<Self>())
            .copied()
    }
}

/// Cancellation token plus an optional deadline
///
/// Cloning a scope shares the token; cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    /// Scope that never fires unless cancelled explicitly
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope that fires after `timeout`
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().timeout(timeout)
    }

    /// Derive a scope sharing this token with a deadline no later than `timeout` from now
    #[must_use]
    pub fn timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child scope that is cancelled with this one but can be cancelled alone
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel the scope and every child derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check
    ///
    /// # Errors
    /// Returns the reason if the scope has already fired
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.token.is_cancelled() {
            return Err(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CancelReason::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the scope fires
    pub async fn cancelled(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => CancelReason::Cancelled,
                    () = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Run `fut` unless the scope fires first
    ///
    /// # Errors
    /// Returns the reason when the scope wins; `fut` is dropped at that point
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            out = fut => Ok(out),
        }
    }
}

/// Aborts a background task when dropped, so early returns never leak it
#[derive(Debug)]
pub(crate) struct AbortOnDrop<T>(pub(crate) JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_fires() {
        let scope = CancelScope::with_timeout(Duration::from_millis(20));
        let result = scope
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(CancelReason::DeadlineExceeded));
        assert_eq!(scope.check(), Err(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = CancelScope::new();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.check(), Err(CancelReason::Cancelled));
        assert_eq!(child.cancelled().await, CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = CancelScope::new();
        let child = parent.child();
        child.cancel();
        assert!(parent.check().is_ok());
    }

    #[tokio::test]
    async fn test_timeout_keeps_earlier_deadline() {
        let tight = CancelScope::with_timeout(Duration::from_secs(1));
        let loose = tight.timeout(Duration::from_secs(60));
        assert_eq!(loose.deadline(), tight.deadline());
    }

    #[test]
    fn test_reason_round_trips_through_io_error() {
        let err = CancelReason::Cancelled.into_io();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(CancelReason::from_io(&err), Some(CancelReason::Cancelled));
        assert_eq!(CancelReason::from_io(&io::Error::other("x")), None);
    }
}
