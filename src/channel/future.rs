//! One-shot completion signal for channel open and close
//!
//! A future starts pending and is completed exactly once, with success or
//! an error. Any number of tasks may wait on clones of it and all of them
//! see the same outcome.

use super::ChannelError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// Stored outcome shared with every waiter
pub type Outcome = Result<(), Arc<ChannelError>>;

/// Pending/done completion signal
#[derive(Debug, Clone)]
pub struct CompletionFuture {
    name: &'static str,
    state: Arc<watch::Sender<Option<Outcome>>>,
}

/// Completed when the peer confirms or rejects a channel open
pub type OpenFuture = CompletionFuture;

/// Completed when both sides have closed a channel
pub type CloseFuture = CompletionFuture;

impl CompletionFuture {
    /// Create a pending future
    pub fn new(name: &'static str) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            name,
            state: Arc::new(state),
        }
    }

    /// Store the outcome and release all waiters.
    ///
    /// Returns `false` without touching the stored outcome if the future was
    /// already completed.
    pub fn complete(&self, outcome: Result<(), ChannelError>) -> bool {
        let mut outcome = Some(outcome.map_err(Arc::new));
        let stored = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = outcome.take();
            true
        });

        if !stored {
            trace!("{} future already completed, ignoring new outcome", self.name);
        }
        stored
    }

    /// Wait without bound for the outcome
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(Ok(())),
            // The sender lives as long as `self`, so this is unreachable in practice
            Err(_) => Err(Arc::new(ChannelError::Closed)),
        };
        outcome
    }

    /// Wait for the outcome for at most `timeout`.
    ///
    /// Elapsing the timeout is not reported: the caller re-checks
    /// [`is_done`](Self::is_done) and [`error`](Self::error) afterwards.
    pub async fn wait_timeout(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wait()).await;
    }

    /// Wait with `timeout`, where a zero timeout means no bound
    pub async fn wait_for(&self, timeout: Duration) {
        if timeout.is_zero() {
            let _ = self.wait().await;
        } else {
            self.wait_timeout(timeout).await;
        }
    }

    /// Check if the future has been completed
    pub fn is_done(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Check if the future completed successfully
    pub fn is_success(&self) -> bool {
        matches!(*self.state.borrow(), Some(Ok(())))
    }

    /// Stored error, if the future completed with one
    pub fn error(&self) -> Option<Arc<ChannelError>> {
        match &*self.state.borrow() {
            Some(Err(e)) => Some(Arc::clone(e)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_once() {
        let future = CompletionFuture::new("open");
        assert!(!future.is_done());

        assert!(future.complete(Err(ChannelError::Closed)));
        assert!(!future.complete(Ok(())));

        assert!(future.is_done());
        assert!(!future.is_success());
        assert!(matches!(future.error().as_deref(), Some(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_all_waiters_see_same_outcome() {
        let future = CompletionFuture::new("open");

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let future = future.clone();
                tokio::spawn(async move { future.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        future.complete(Err(ChannelError::OpenFailed {
            reason: 2,
            description: "refused".to_string(),
        }));

        let mut errors = Vec::new();
        for waiter in waiters {
            errors.push(waiter.await.unwrap().unwrap_err());
        }
        for err in &errors {
            assert!(Arc::ptr_eq(err, &errors[0]));
        }
    }

    #[tokio::test]
    async fn test_concurrent_complete_single_winner() {
        let future = CompletionFuture::new("close");

        let racers: Vec<_> = (0..16)
            .map(|i| {
                let future = future.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        future.complete(Ok(()))
                    } else {
                        future.complete(Err(ChannelError::Closed))
                    }
                })
            })
            .collect();

        let mut winners = 0;
        for racer in racers {
            if racer.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(future.is_done());
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_future_pending() {
        let future = CompletionFuture::new("open");

        future.wait_timeout(Duration::from_millis(10)).await;
        assert!(!future.is_done());
        assert!(future.error().is_none());

        future.complete(Ok(()));
        future.wait_timeout(Duration::from_millis(10)).await;
        assert!(future.is_success());
    }

    #[tokio::test]
    async fn test_wait_after_completion_returns_immediately() {
        let future = CompletionFuture::new("close");
        future.complete(Ok(()));
        assert!(future.wait().await.is_ok());
        future.wait_for(Duration::ZERO).await;
        assert!(future.is_success());
    }
}
